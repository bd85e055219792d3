use thiserror::Error;
use uuid::Uuid;

use parley_types::events::ServerEvent;

pub type HubResult<T> = Result<T, HubError>;

/// Everything that can go wrong while handling one gateway operation.
/// Errors are scoped to the connection that triggered them.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("{0}")]
    Validation(String),

    #[error("store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl HubError {
    pub fn channel_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "channel", id }
    }

    pub fn message_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "message", id }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable code carried by `operation_error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_failed",
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation_failed",
            Self::Store(_) => "store_failure",
        }
    }

    /// The event sent back to the requesting connection. Store details stay in the logs.
    pub fn to_event(&self) -> ServerEvent {
        let message = match self {
            Self::Store(_) => "the operation could not be completed".to_string(),
            other => other.to_string(),
        };
        ServerEvent::OperationError {
            code: self.code().to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_details_hidden() {
        let err = HubError::from(anyhow::anyhow!("disk I/O error at /var/lib/parley.db"));
        match err.to_event() {
            ServerEvent::OperationError { code, message } => {
                assert_eq!(code, "store_failure");
                assert!(!message.contains("/var/lib"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_not_found_message() {
        let id = Uuid::from_u128(7);
        let err = HubError::message_not_found(id);
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.to_string(), format!("message not found: {}", id));
    }
}
