//! Error types and result aliases shared across Sluice components.

/// The result type used throughout `sluice-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A worker key did not match the required `<prefix>-<number>` format.
    #[error("invalid worker key: {message}")]
    InvalidWorkerKey {
        /// Description of what made the key invalid.
        message: String,
    },

    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },
}
