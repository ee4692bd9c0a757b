//! Typed outcomes from raw command results.
//!
//! Classification looks at the exit code first and only parses the payload
//! on the success branch. The rules, in order:
//!
//! | Exit code | Output | Outcome |
//! |---|---|---|
//! | non-zero | diagnostic mentions an authentication failure | `AuthFailure` |
//! | non-zero | anything else | `CommandFailure` (`Remote`) |
//! | 0 | empty | `Success(Empty)` |
//! | 0 | JSON requested, does not parse | `CommandFailure` (`MalformedOutput`) |
//! | 0 | otherwise | `Success(Json)` or `Success(Text)` |

use tracing::debug;

use super::types::{CommandResult, FailureKind, Outcome, Payload, PayloadFormat, SchemeAttempt};

/// Lowercase markers of a remote authentication or authorization failure.
const AUTH_MARKERS: &[&str] = &[
    "access is denied",
    "unauthorizedaccessexception",
    "logon failure",
    "the user name or password is incorrect",
    "authentication failed",
    "a specified logon session does not exist",
    "insufficient access rights",
];

fn has_auth_marker(diagnostic: &str) -> bool {
    let lower = diagnostic.to_lowercase();
    AUTH_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Diagnostic text to report for a failed command.
fn diagnostic_of(result: &CommandResult) -> String {
    let stderr = result.stderr().trim();
    if stderr.is_empty() {
        result.stdout().trim().to_string()
    } else {
        stderr.to_string()
    }
}

/// Map a completed command to its outcome. Pure.
pub fn classify(result: &CommandResult) -> Outcome {
    let code = result.exit_code();
    if code != 0 {
        let diagnostic = diagnostic_of(result);
        if !result.stderr().trim().is_empty() && has_auth_marker(result.stderr()) {
            return Outcome::AuthFailure {
                attempts: vec![SchemeAttempt {
                    scheme: result.scheme(),
                    reason: diagnostic,
                }],
            };
        }
        return Outcome::CommandFailure {
            diagnostic,
            code,
            kind: FailureKind::Remote,
        };
    }

    let stdout = result.stdout().trim();
    if stdout.is_empty() {
        return Outcome::Success {
            payload: Payload::Empty,
        };
    }

    match result.format() {
        PayloadFormat::Text => Outcome::Success {
            payload: Payload::Text(stdout.to_string()),
        },
        PayloadFormat::Json => match serde_json::from_str(stdout) {
            Ok(value) => Outcome::Success {
                payload: Payload::Json(value),
            },
            Err(e) => {
                debug!(error = %e, bytes = stdout.len(), "Command output is not valid JSON");
                Outcome::CommandFailure {
                    diagnostic: format!("output is not valid JSON: {}", e),
                    code,
                    kind: FailureKind::MalformedOutput,
                }
            }
        },
    }
}
