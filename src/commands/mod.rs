pub mod connection;

pub use connection::{CommandError, ConnectRequest, ConnectionHistory, ConnectionService};
