//! LyncNat device error types.
//!
//! # Recoverability
//!
//! Every failure the runtime can meet falls in one of two groups:
//!
//! - **Recoverable**: framing and integrity failures, unknown capabilities,
//!   argument mismatches and network failures. The offending frame is dropped
//!   (or the connection is re-established) and the device keeps running.
//! - **Fatal**: the relay rejected the device identity (bad credentials, or the
//!   device was deleted server side). The session is stopped and the error is
//!   surfaced to the owning application.
//!
//! [`LyncnatError::is_recoverable`] encodes this split.

use thiserror::Error;

/// Why the relay refused the device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityFailure {
    /// Username or API key rejected.
    Unauthorized,
    /// The relay does not know the device UUID.
    UnknownDevice,
}

impl std::fmt::Display for IdentityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "credentials rejected by relay"),
            Self::UnknownDevice => write!(f, "device not recognized by relay"),
        }
    }
}

/// LyncNat runtime errors.
#[derive(Error, Debug)]
pub enum LyncnatError {
    /// Malformed frame header or attribute layout.
    #[error("Framing error: {0}")]
    Framing(String),

    /// MESSAGE-INTEGRITY did not match the recomputed HMAC.
    #[error("Message integrity check failed")]
    Authentication,

    /// Action or event name not present in the capability registry.
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// Wrong arity or type in an argument list.
    #[error("Argument mismatch: {0}")]
    ArgumentMismatch(String),

    /// I/O failure on the relay connection.
    #[error("Network error: {0}")]
    Network(String),

    /// Relay rejected the device identity; the session cannot continue.
    #[error("Fatal identity error: {0}")]
    FatalIdentity(IdentityFailure),

    /// An action handler returned an error.
    #[error("Action '{action}' failed: {source}")]
    ActionFailed {
        /// Name of the action being dispatched.
        action: String,
        /// Error raised by the handler.
        #[source]
        source: anyhow::Error,
    },

    /// Well-formed frame missing something the operation needs.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Capability registration rejected.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Operation not allowed in the current session state.
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// TLS setup failure (trust anchors, server name).
    #[error("TLS error: {0}")]
    Tls(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LyncnatError {
    /// False only for errors that must terminate the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::FatalIdentity(_))
    }
}

/// Result type alias for LyncNat operations
pub type Result<T> = std::result::Result<T, LyncnatError>;

impl From<toml::de::Error> for LyncnatError {
    fn from(err: toml::de::Error) -> Self {
        LyncnatError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for LyncnatError {
    fn from(err: toml::ser::Error) -> Self {
        LyncnatError::Config(err.to_string())
    }
}

impl From<rustls::Error> for LyncnatError {
    fn from(err: rustls::Error) -> Self {
        LyncnatError::Tls(err.to_string())
    }
}
