//! Bridge error taxonomy and transport-failure classification.
//!
//! # Error Classes
//!
//! 1. **Transport failures (retryable at most once)**: DNS, refused, reset,
//!    connect/handshake timeouts, malformed handshakes, closed sessions.
//!    A listener refusing unencrypted traffic is a transport failure that is
//!    never retried.
//!
//! 2. **Authentication failures (never retried)**: every configured scheme
//!    was rejected. The per-scheme reasons are kept in order.
//!
//! 3. **Command timeouts (terminal)**: the command exceeded its budget and
//!    its session is discarded.
//!
//! Command failures and malformed output are not errors at this level; they
//! are produced by the classifier from a completed `CommandResult`.
//!
//! # Cause Inference
//!
//! The cause of a transport error is taken from the `std::io::ErrorKind` in
//! the error's source chain when there is one. Otherwise the message is
//! matched against known patterns, in the order of [`CAUSE_PATTERNS`].

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use thiserror::Error;

use super::types::{Outcome, SchemeAttempt, TransportCause};

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("{cause} failure: {message}")]
    Transport {
        cause: TransportCause,
        message: String,
    },

    #[error("authentication rejected by every scheme ({})", join_attempts(.attempts))]
    Auth { attempts: Vec<SchemeAttempt> },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

fn join_attempts(attempts: &[SchemeAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BridgeError {
    pub fn transport(cause: TransportCause, message: impl Into<String>) -> Self {
        BridgeError::Transport {
            cause,
            message: message.into(),
        }
    }

    /// Error returned by any operation on a closed session.
    pub fn closed() -> Self {
        Self::transport(TransportCause::Closed, "session is closed")
    }

    /// Build a transport error from a message alone, inferring the cause.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::transport(classify_message(&message), message)
    }

    /// Build a transport error from any error, inferring the cause from its
    /// source chain.
    pub fn from_source(context: &str, err: &(dyn StdError + 'static)) -> Self {
        let cause = classify_error(err);
        Self::transport(cause, format!("{}: {}", context, render_chain(err)))
    }

    /// Whether the executor may retry after this error. A listener that
    /// refuses unencrypted traffic refuses it again on the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport { cause, .. } if *cause != TransportCause::Unencrypted
        )
    }

    pub fn cause(&self) -> Option<TransportCause> {
        match self {
            BridgeError::Transport { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Convert into the outcome reported to callers.
    pub fn into_outcome(self, attempts: u32) -> Outcome {
        match self {
            BridgeError::Transport { cause, message } => Outcome::TransportFailure {
                cause,
                message,
                attempts,
            },
            BridgeError::Auth { attempts } => Outcome::AuthFailure { attempts },
            BridgeError::Timeout(after) => Outcome::Timeout {
                after_ms: after.as_millis() as u64,
            },
        }
    }
}

/// Message patterns checked in order; the first match decides the cause.
const CAUSE_PATTERNS: &[(&str, TransportCause)] = &[
    ("dns error", TransportCause::Dns),
    ("failed to lookup address", TransportCause::Dns),
    ("name or service not known", TransportCause::Dns),
    ("no such host", TransportCause::Dns),
    ("temporary failure in name resolution", TransportCause::Dns),
    ("connection refused", TransportCause::Refused),
    ("actively refused", TransportCause::Refused),
    ("connection reset", TransportCause::Reset),
    ("connection aborted", TransportCause::Reset),
    ("broken pipe", TransportCause::Reset),
    ("connection closed", TransportCause::Reset),
    ("unexpected eof", TransportCause::Reset),
    ("timed out", TransportCause::Timeout),
    ("timeout", TransportCause::Timeout),
    ("certificate", TransportCause::Tls),
    ("tls", TransportCause::Tls),
    ("handshake", TransportCause::Tls),
];

pub(crate) fn classify_message(message: &str) -> TransportCause {
    let lower = message.to_lowercase();
    CAUSE_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, cause)| *cause)
        .unwrap_or(TransportCause::Other)
}

fn classify_io_kind(kind: io::ErrorKind) -> Option<TransportCause> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some(TransportCause::Refused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => Some(TransportCause::Reset),
        io::ErrorKind::TimedOut => Some(TransportCause::Timeout),
        _ => None,
    }
}

pub(crate) fn classify_error(err: &(dyn StdError + 'static)) -> TransportCause {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>()
            && let Some(cause) = classify_io_kind(io_err.kind())
        {
            return cause;
        }
        current = e.source();
    }
    classify_message(&render_chain(err))
}

fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let next = e.to_string();
        if !rendered.contains(&next) {
            rendered.push_str(": ");
            rendered.push_str(&next);
        }
        current = e.source();
    }
    rendered
}
