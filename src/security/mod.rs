pub mod credentials;
pub mod redact;
pub mod validation;

// Re-export key types and functions for convenient access
pub use credentials::{AesGcmEncryptionService, CipherError, EncryptionService};
pub use redact::{redact_connection_string, redact_value};
pub use validation::{sanitize_for_display, validate_query, ValidationError};
