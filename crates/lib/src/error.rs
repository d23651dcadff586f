//! Failure taxonomy shared by the poller, dispatcher and outbound queue.
//!
//! Kinds are reported to the metrics sink as stable lowercase labels.

use std::fmt;

/// What went wrong, independent of where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// getUpdates failed; retried forever after a fixed backoff.
    TransientFetch,
    /// Platform answered "too many requests"; bounded exponential retry.
    RateLimited,
    /// 5xx or no response at all; one retry, then drop.
    RetryableServer,
    /// Any other platform error; dropped immediately.
    Permanent,
    /// A command handler returned an error or panicked.
    HandlerFailure,
    /// The outbound queue was at capacity.
    QueueFull,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientFetch => "fetch",
            Self::RateLimited => "rate_limited",
            Self::RetryableServer => "server",
            Self::Permanent => "permanent",
            Self::HandlerFailure => "handler",
            Self::QueueFull => "queue_full",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
