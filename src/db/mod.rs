pub mod connectors;
pub mod pool;
pub mod registry;
pub mod scalar;
