//! WinRM authentication.
//!
//! Each HTTP scheme is an [`AuthStrategy`]; the [`Negotiator`] tries them in
//! the caller's order and binds the winner to the new session. Negotiate
//! seals bodies on plain-HTTP channels.

mod basic;
mod negotiator;
pub(crate) mod ntlm;
pub(crate) mod sealing;
mod traits;

pub use basic::BasicAuth;
pub use negotiator::Negotiator;
pub use ntlm::NegotiateAuth;
pub use traits::AuthStrategy;
