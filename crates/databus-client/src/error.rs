use thiserror::Error;

/// Errors produced by channel operations.
///
/// The taxonomy is two-level: every variant is either *permanent* (surface
/// to the caller) or *temporary* (a retry candidate). Two variants carry
/// extra meaning on top of that split: [`Error::ConsumerNotFound`] is
/// temporary but escapes the retry driver so the run loop can rebuild the
/// server-side consumer, and [`Error::Stopped`] marks an operation aborted
/// by a cooperative stop request.
#[derive(Error, Debug)]
pub enum Error {
    /// Unrecoverable failure; retrying cannot help.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Transient failure; eligible for retry with backoff.
    #[error("temporary error: {0}")]
    Temporary(String),

    /// The operation was aborted because a stop was requested.
    #[error("operation stopped")]
    Stopped,

    /// The server no longer recognises the consumer instance.
    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    /// The authentication endpoint rejected the credentials.
    #[error("authentication rejected: {0}")]
    AuthenticationPermanent(String),

    /// The authentication endpoint was unreachable or answered unexpectedly.
    #[error("authentication unavailable: {0}")]
    AuthenticationTemporary(String),
}

impl Error {
    /// Whether this error class is transient.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Error::Temporary(_) | Error::ConsumerNotFound(_) | Error::AuthenticationTemporary(_)
        )
    }

    /// Whether this error class is final.
    pub fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }

    /// Whether the server-side consumer has been lost.
    pub fn is_consumer_loss(&self) -> bool {
        matches!(self, Error::ConsumerNotFound(_))
    }

    /// Whether the operation was aborted by a stop request.
    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Stopped)
    }

    /// Whether the retry driver may re-attempt this error.
    ///
    /// Consumer loss is temporary but must escape the driver: looping
    /// against a dead consumer id cannot succeed, the run loop has to
    /// reset and re-create instead.
    pub fn is_retryable(&self) -> bool {
        self.is_temporary() && !self.is_consumer_loss()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
