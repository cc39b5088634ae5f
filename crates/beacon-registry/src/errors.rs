//! Registry error types.

use thiserror::Error;

/// Errors returned by [`ClientRegistry`](crate::ClientRegistry) and
/// [`Client`](crate::Client) operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry has been closed or its owner task is gone.
    #[error("client registry is closed")]
    Closed,
    /// The client's outbound receiver has been dropped.
    #[error("client {0} is disconnected")]
    Disconnected(String),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
