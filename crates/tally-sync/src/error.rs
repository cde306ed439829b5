//! Error types for the sync engine.

use thiserror::Error;

use crate::coordinator::SyncState;
use crate::transport::TransportError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the sync engine.
#[derive(Error, Debug)]
pub enum Error {
    /// A locally authored record failed validation; nothing was sent.
    #[error("validation error: {0}")]
    Validation(#[from] tally_core::ValidationError),

    /// A record could not be encoded for the wire.
    #[error("codec error: {0}")]
    Codec(String),

    /// The transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// `initialize()` was called in a state other than `NotStarted`.
    #[error("coordinator already initialized (state: {0})")]
    AlreadyInitialized(SyncState),

    /// A live subscriber was asked to subscribe twice.
    #[error("subscriber already attached to topic '{0}'")]
    AlreadySubscribed(String),

    /// The coordinator or subscriber has been stopped.
    #[error("sync engine stopped")]
    Stopped,
}

impl From<tally_core::Error> for Error {
    fn from(err: tally_core::Error) -> Self {
        match err {
            tally_core::Error::Validation(e) => Self::Validation(e),
            tally_core::Error::Json(e) => Self::Codec(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportErrorKind;

    #[test]
    fn test_from_core_validation_error() {
        let core: tally_core::Error = tally_core::ValidationError::EmptyField { field: "id" }.into();
        let err: Error = core.into();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_from_core_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = tally_core::Error::Json(json_err).into();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_transport_error_display() {
        let err: Error = TransportError::fatal("no peers").into();
        let msg = err.to_string();
        assert!(msg.contains("transport error"));
        assert!(msg.contains("no peers"));
        assert!(matches!(
            err,
            Error::Transport(TransportError {
                kind: TransportErrorKind::Fatal,
                ..
            })
        ));
    }

    #[test]
    fn test_already_initialized_display() {
        let err = Error::AlreadyInitialized(SyncState::Ready);
        assert!(err.to_string().contains("ready"));
    }
}
