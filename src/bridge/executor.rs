//! The execution façade.
//!
//! [`Bridge::execute`] is the only call higher layers need: it checks out a
//! pooled session (or negotiates a fresh one), submits the command,
//! classifies the result and returns a typed [`Outcome`].
//!
//! ## Retry Strategy
//!
//! Transport failures are retried with exponential backoff and jitter via
//! the `backon` crate, up to [`RetryPolicy::max_retries`] times (default 1).
//! Each retry discards the failed session and negotiates a fresh one.
//!
//! - **Retried**: transport failures (DNS, refused, reset, connect or
//!   handshake timeout, protocol errors)
//! - **Never retried**: authentication failures, command failures, command
//!   timeouts, and listeners refusing unencrypted traffic. A failed or
//!   timed-out administrative command may already have taken effect remotely.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::Negotiator;
use super::classifier::classify;
use super::config::{BridgeConfig, MAX_RETRY_DELAY, PoolConfig, RetryPolicy};
use super::error::BridgeError;
use super::pool::{Checkout, PoolKey, SessionPool};
use super::session::Session;
use super::transport::{Connector, HttpConnector};
use super::types::{CommandRequest, CommandResult, Credential, Outcome, SchemeList, Target};

/// Whether a call may use a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reuse {
    /// Take a healthy pooled session if one exists, and pool it afterwards
    #[default]
    IfHealthy,
    /// Negotiate a fresh session and close it after the command
    Never,
}

/// Per-call pool, retry and handshake policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutePolicy {
    pub reuse: Reuse,
    pub retry: RetryPolicy,
    /// Replaces the configured connect timeout when set
    pub connect_timeout: Option<Duration>,
    /// Replaces the configured authentication timeout when set
    pub authenticate_timeout: Option<Duration>,
}

impl ExecutePolicy {
    pub fn fresh_session() -> Self {
        Self {
            reuse: Reuse::Never,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_authenticate_timeout(mut self, timeout: Duration) -> Self {
        self.authenticate_timeout = Some(timeout);
        self
    }
}

/// Shortest interval between reaper sweeps
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Sweep often enough that no idle session outlives its deadline by more
/// than half of it.
fn reap_interval(pool: &PoolConfig) -> Duration {
    (pool.idle_timeout.min(pool.max_age) / 2).max(MIN_REAP_INTERVAL)
}

/// Pooled, authenticated command execution against WinRM targets.
pub struct Bridge<C: Connector = HttpConnector> {
    connector: C,
    negotiator: Negotiator,
    config: BridgeConfig,
    pool: Arc<SessionPool>,
    reaper: CancellationToken,
}

impl Bridge<HttpConnector> {
    /// Bridge over HTTP(S) with the standard schemes.
    pub fn http(config: BridgeConfig) -> Self {
        Self::new(HttpConnector::new(), config)
    }
}

impl<C: Connector> Bridge<C> {
    /// Build a bridge. Inside a Tokio runtime this also starts the idle
    /// reaper; it stops on [`shutdown`](Self::shutdown) or drop.
    pub fn new(connector: C, config: BridgeConfig) -> Self {
        let pool = Arc::new(SessionPool::new(config.pool));
        let reaper = CancellationToken::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            let interval = reap_interval(&config.pool);
            debug!(interval_ms = interval.as_millis() as u64, "Starting session reaper");
            pool.spawn_reaper(interval, reaper.child_token());
        }
        Self {
            connector,
            negotiator: Negotiator::standard(),
            config,
            pool,
            reaper,
        }
    }

    pub fn with_negotiator(mut self, negotiator: Negotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The policy used when callers have no preference.
    pub fn default_policy(&self) -> ExecutePolicy {
        ExecutePolicy {
            reuse: Reuse::IfHealthy,
            retry: self.config.retry,
            connect_timeout: None,
            authenticate_timeout: None,
        }
    }

    /// Run `request` against `target` and classify the result.
    pub async fn execute(
        &self,
        target: &Target,
        credential: &Credential,
        schemes: &SchemeList,
        request: CommandRequest,
        policy: &ExecutePolicy,
    ) -> Outcome {
        let attempt_counter = AtomicU32::new(0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(policy.retry.delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(policy.retry.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > 1 {
                warn!(host = %target.host(), attempt, "Retrying command with a fresh session");
            }
            self.attempt(target, credential, schemes, &request, policy)
                .await
        })
        .retry(backoff)
        .when(|e| {
            let retryable = e.is_retryable();
            if !retryable {
                debug!(host = %target.host(), error = %e, "Not retrying");
            }
            retryable
        })
        .notify(|err, dur| {
            warn!(host = %target.host(), error = %err, "Transport failure. Retrying in {:?}", dur);
        })
        .await;

        let attempts = attempt_counter.load(Ordering::SeqCst);
        match result {
            Ok(result) => {
                let outcome = classify(&result);
                info!(
                    host = %target.host(),
                    outcome = outcome.kind(),
                    exit_code = result.exit_code(),
                    elapsed_ms = result.elapsed().as_millis() as u64,
                    attempts,
                    "Command finished"
                );
                outcome
            }
            Err(e) => {
                error!(
                    host = %target.host(),
                    attempts,
                    error = %e,
                    "Command did not complete"
                );
                e.into_outcome(attempts)
            }
        }
    }

    async fn attempt(
        &self,
        target: &Target,
        credential: &Credential,
        schemes: &SchemeList,
        request: &CommandRequest,
        policy: &ExecutePolicy,
    ) -> Result<CommandResult, BridgeError> {
        let mut checkout = self.checkout(target, credential, schemes, policy).await?;
        match checkout.submit(request, self.config.timeouts.command).await {
            Ok(result) => {
                match policy.reuse {
                    Reuse::IfHealthy => checkout.release().await,
                    Reuse::Never => checkout.discard().await,
                }
                Ok(result)
            }
            Err(e) => {
                checkout.discard().await;
                Err(e)
            }
        }
    }

    async fn checkout(
        &self,
        target: &Target,
        credential: &Credential,
        schemes: &SchemeList,
        policy: &ExecutePolicy,
    ) -> Result<Checkout, BridgeError> {
        let key = PoolKey::new(target, credential);
        let mut reservation = self.pool.reserve(&key).await?;
        if policy.reuse == Reuse::IfHealthy
            && let Some(session) = self.pool.take_idle(&key, &mut reservation).await
        {
            debug!(session_id = %session.id(), host = %target.host(), "Reusing pooled session");
            return Ok(self.pool.checkout(key, session, reservation));
        }
        let session = self.open(target, credential, schemes, policy).await?;
        Ok(self.pool.checkout(key, session, reservation))
    }

    async fn open(
        &self,
        target: &Target,
        credential: &Credential,
        schemes: &SchemeList,
        policy: &ExecutePolicy,
    ) -> Result<Session, BridgeError> {
        let timeouts = self.config.timeouts;
        let connect = policy.connect_timeout.unwrap_or(timeouts.connect);
        let authenticate = policy.authenticate_timeout.unwrap_or(timeouts.authenticate);
        let channel = self.connector.connect(target, connect).await?;
        self.negotiator
            .authenticate(channel, target, Arc::new(credential.clone()), schemes, authenticate)
            .await
    }

    /// Negotiate a session ahead of time and pool it.
    pub async fn warm(
        &self,
        target: &Target,
        credential: &Credential,
        schemes: &SchemeList,
    ) -> Result<(), BridgeError> {
        let key = PoolKey::new(target, credential);
        let reservation = self.pool.reserve(&key).await?;
        let session = self.open(target, credential, schemes, &self.default_policy()).await?;
        self.pool.checkout(key, session, reservation).release().await;
        Ok(())
    }

    /// Close every pooled session for `target`, e.g. after credential
    /// rotation. Returns the number of idle sessions closed.
    pub async fn evict_all(&self, target: &Target) -> usize {
        self.pool.evict_target(target).await
    }

    pub fn idle_count(&self, target: &Target) -> usize {
        self.pool.idle_count(target)
    }

    /// Start closing expired idle sessions every `interval` until
    /// [`shutdown`](Self::shutdown). Only needed for a bridge built outside a
    /// Tokio runtime, or for a different sweep interval.
    pub fn start_reaper(&self, interval: Duration) -> JoinHandle<()> {
        self.pool.spawn_reaper(interval, self.reaper.child_token())
    }

    /// Stop the reaper and close every idle session.
    pub async fn shutdown(&self) {
        self.reaper.cancel();
        let closed = self.pool.clear().await;
        info!(closed, "Bridge shut down");
    }
}

impl<C: Connector> Drop for Bridge<C> {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}
