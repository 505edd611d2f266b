use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

/// Pipeline error taxonomy.
///
/// Errors are `Clone` because a single refresh failure is fanned out to
/// every waiter coalesced onto the in-flight call.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Token invalid or rejected, including after a refresh attempt.
    #[error("auth failure: {0}")]
    Auth(String),
    /// Challenge request or answer computation failed.
    #[error("challenge failure: {0}")]
    Challenge(String),
    /// Unexpected content type, malformed frame, or a structurally required
    /// field that did not parse.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    /// Feature quota exhausted; retrying cannot change quota state.
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("transport failure ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
}

impl CoreError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        CoreError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Whether the retry supervisor may restart the pipeline on this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CoreError::Quota(_))
    }
}
