//! Ordered scheme negotiation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::error::BridgeError;
use crate::bridge::session::Session;
use crate::bridge::transport::{Channel, Reply};
use crate::bridge::types::{AuthScheme, Credential, SchemeAttempt, SchemeList, Target, TransportCause};
use crate::bridge::wsman;

use super::traits::AuthStrategy;
use super::{BasicAuth, NegotiateAuth};

/// Longest slice of a rejection body kept in the attempt reason
const MAX_REASON_BODY: usize = 200;

/// Tries authentication schemes against a channel in the caller's order.
///
/// The first scheme the server accepts produces the session. A rejected
/// scheme moves on to the next one. Any other failure aborts the loop as a
/// transport failure, so a dropped connection is never reported as bad
/// credentials.
///
/// # Example
///
/// ```ignore
/// let session = Negotiator::standard()
///     .authenticate(channel, &target, credential, &schemes, timeout)
///     .await?;
/// ```
#[derive(Clone)]
pub struct Negotiator {
    strategies: Vec<Arc<dyn AuthStrategy>>,
}

impl Negotiator {
    /// Create a negotiator with no registered strategies.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Negotiator supporting every scheme this crate implements.
    pub fn standard() -> Self {
        Self::new()
            .with_strategy(NegotiateAuth::new())
            .with_strategy(BasicAuth::new())
    }

    /// Register (or replace) the strategy for its scheme.
    pub fn with_strategy(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        let scheme = strategy.scheme();
        self.strategies.retain(|s| s.scheme() != scheme);
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn supports(&self, scheme: AuthScheme) -> bool {
        self.strategy(scheme).is_some()
    }

    fn strategy(&self, scheme: AuthScheme) -> Option<Arc<dyn AuthStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.scheme() == scheme)
            .cloned()
    }

    /// Authenticate on `channel` and open a session bound to the accepted
    /// scheme.
    ///
    /// The channel is shut down on every failure path. The whole negotiation,
    /// including shell creation, must finish within `timeout`.
    pub async fn authenticate(
        &self,
        channel: Box<dyn Channel>,
        target: &Target,
        credential: Arc<Credential>,
        schemes: &SchemeList,
        timeout: Duration,
    ) -> Result<Session, BridgeError> {
        let negotiation = async {
            let strategy = self.negotiate(channel.as_ref(), target, &credential, schemes).await?;
            let shell_id =
                Session::create_shell(channel.as_ref(), target, &credential, strategy.as_ref())
                    .await?;
            Ok::<_, BridgeError>((strategy, shell_id))
        };

        let result = match tokio::time::timeout(timeout, negotiation).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::transport(
                TransportCause::Timeout,
                format!("authentication with {} timed out after {:?}", target, timeout),
            )),
        };

        match result {
            Ok((strategy, shell_id)) => Ok(Session::new(
                target.clone(),
                credential,
                strategy,
                channel,
                shell_id,
            )),
            Err(e) => {
                channel.shutdown().await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        channel: &dyn Channel,
        target: &Target,
        credential: &Credential,
        schemes: &SchemeList,
    ) -> Result<Arc<dyn AuthStrategy>, BridgeError> {
        let identify = wsman::identify();
        let mut attempts = Vec::with_capacity(schemes.len());

        for &scheme in schemes.as_slice() {
            let Some(strategy) = self.strategy(scheme) else {
                attempts.push(SchemeAttempt {
                    scheme,
                    reason: "scheme not supported by this client".to_string(),
                });
                continue;
            };

            debug!(host = %target.host(), scheme = %scheme, "Trying authentication scheme");
            let reply = strategy.send(channel, credential, &identify).await?;

            if reply.is_success() {
                info!(host = %target.host(), scheme = %scheme, "Authentication succeeded");
                return Ok(strategy);
            }
            if reply.is_unauthorized() {
                let reason = rejection_reason(&reply, channel.offered_challenges());
                debug!(host = %target.host(), scheme = %scheme, reason = %reason, "Authentication rejected");
                attempts.push(SchemeAttempt { scheme, reason });
                continue;
            }
            if wsman::is_unencrypted_refusal(&reply.body) {
                return Err(BridgeError::transport(
                    TransportCause::Unencrypted,
                    format!(
                        "{} refuses unencrypted traffic with {}; use TLS or Negotiate with sealing",
                        target, scheme
                    ),
                ));
            }
            return Err(BridgeError::transport(
                TransportCause::Protocol,
                format!("unexpected HTTP {} to Identify with {}", reply.status, scheme),
            ));
        }

        warn!(
            host = %target.host(),
            principal = %credential.principal(),
            attempts = attempts.len(),
            "Every authentication scheme was rejected"
        );
        Err(BridgeError::Auth { attempts })
    }
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::standard()
    }
}

fn rejection_reason(reply: &Reply, offered: &[String]) -> String {
    let mut reason = format!("HTTP {}", reply.status);
    let body = reply.body.trim();
    if !body.is_empty() {
        let detail = if wsman::is_fault(body) {
            wsman::fault_message(body)
        } else {
            body.chars().take(MAX_REASON_BODY).collect()
        };
        reason.push_str(": ");
        reason.push_str(&detail);
    }
    if !offered.is_empty() {
        let names: Vec<&str> = offered
            .iter()
            .map(|c| c.split_whitespace().next().unwrap_or(c.as_str()))
            .collect();
        reason.push_str(&format!(" (server offers {})", names.join(", ")));
    }
    reason
}
