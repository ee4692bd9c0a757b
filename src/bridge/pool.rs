//! Session pool keyed by target and credential.
//!
//! Idle sessions wait in a `DashMap` until the next caller for the same key
//! takes one. A per-key semaphore bounds how many sessions a key may have
//! checked out; callers beyond that queue. A [`Checkout`] owns its session
//! exclusively until it is released, discarded or dropped, so one session can
//! never serve two callers at once.
//!
//! Sessions are closed instead of reused when they failed, when their submit
//! was cancelled, when they idled past `idle_timeout` or outlived `max_age`,
//! and when their target was evicted while they were checked out.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::config::PoolConfig;
use super::error::BridgeError;
use super::session::Session;
use super::types::{CommandRequest, CommandResult, Credential, Target};

/// Identity of a pooled session. The secret only contributes a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    target: Target,
    principal: String,
    fingerprint: u64,
}

impl PoolKey {
    pub fn new(target: &Target, credential: &Credential) -> Self {
        Self {
            target: target.clone(),
            principal: credential.principal().to_string(),
            fingerprint: credential.fingerprint(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

async fn close_all(sessions: Vec<Session>) -> usize {
    let count = sessions.len();
    join_all(sessions.into_iter().map(|mut s| async move { s.close().await })).await;
    count
}

/// Per-key pool state. Keeping the epoch next to the idle list lets a return
/// be checked and pushed under one entry lock.
struct Slot {
    gate: Arc<Semaphore>,
    /// Bumped by eviction; checkouts from an older epoch are closed on release
    epoch: u64,
    idle: Vec<Session>,
}

impl Slot {
    fn new(permits: usize) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(permits)),
            epoch: 0,
            idle: Vec::new(),
        }
    }

    /// No idle sessions and nobody holding or waiting for the gate.
    fn is_unused(&self) -> bool {
        self.idle.is_empty() && Arc::strong_count(&self.gate) == 1
    }
}

/// A checkout slot held for one key, with the eviction epoch it belongs to.
pub(crate) struct Reservation {
    permit: OwnedSemaphorePermit,
    epoch: u64,
}

pub struct SessionPool {
    config: PoolConfig,
    slots: DashMap<PoolKey, Slot>,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn is_fresh(&self, session: &Session) -> bool {
        session.is_reusable()
            && session.idle_time() < self.config.idle_timeout
            && session.age() < self.config.max_age
    }

    fn prune(&self) {
        self.slots.retain(|_, slot| !slot.is_unused());
    }

    /// Wait for a checkout slot for `key`.
    pub(crate) async fn reserve(&self, key: &PoolKey) -> Result<Reservation, BridgeError> {
        let (gate, epoch) = {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Slot::new(self.config.max_sessions_per_key));
            (slot.gate.clone(), slot.epoch)
        };
        let permit = gate.acquire_owned().await.map_err(|_| BridgeError::closed())?;
        Ok(Reservation { permit, epoch })
    }

    /// Take a healthy idle session for `key`, closing stale ones found on the
    /// way. Moves `reservation` to the current epoch.
    pub(crate) async fn take_idle(&self, key: &PoolKey, reservation: &mut Reservation) -> Option<Session> {
        let mut stale = Vec::new();
        let found = {
            let mut slot = self.slots.get_mut(key)?;
            reservation.epoch = slot.epoch;
            let mut found = None;
            while let Some(session) = slot.idle.pop() {
                if self.is_fresh(&session) {
                    found = Some(session);
                    break;
                }
                stale.push(session);
            }
            found
        };
        if !stale.is_empty() {
            debug!(host = %key.target.host(), count = stale.len(), "Closing stale idle sessions");
            close_all(stale).await;
        }
        found
    }

    /// Pool `session` if it is fresh and `epoch` is still current for `key`.
    /// Otherwise hand it back so the caller can close it.
    fn put(&self, key: &PoolKey, epoch: u64, session: Session) -> Result<(), Session> {
        if !self.is_fresh(&session) {
            return Err(session);
        }
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Err(session);
        };
        if slot.epoch != epoch {
            return Err(session);
        }
        debug!(session_id = %session.id(), host = %key.target.host(), "Session returned to pool");
        slot.idle.push(session);
        Ok(())
    }

    /// Wrap a session into an exclusive checkout.
    pub(crate) fn checkout(self: &Arc<Self>, key: PoolKey, session: Session, reservation: Reservation) -> Checkout {
        Checkout {
            pool: self.clone(),
            key,
            epoch: reservation.epoch,
            session: Some(session),
            _permit: reservation.permit,
        }
    }

    /// Idle sessions currently pooled for `target`.
    pub fn idle_count(&self, target: &Target) -> usize {
        self.slots
            .iter()
            .filter(|entry| &entry.key().target == target)
            .map(|entry| entry.value().idle.len())
            .sum()
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Close every idle session for `target`. Checked-out sessions for it are
    /// closed when released. Returns the number of idle sessions closed.
    pub async fn evict_target(&self, target: &Target) -> usize {
        let mut sessions = Vec::new();
        for mut entry in self.slots.iter_mut() {
            if &entry.key().target != target {
                continue;
            }
            let slot = entry.value_mut();
            slot.epoch += 1;
            sessions.append(&mut slot.idle);
        }
        self.prune();
        let closed = close_all(sessions).await;
        info!(host = %target.host(), closed, "Evicted target from session pool");
        closed
    }

    /// Close every idle session.
    pub async fn clear(&self) -> usize {
        let mut sessions = Vec::new();
        for mut entry in self.slots.iter_mut() {
            sessions.append(&mut entry.value_mut().idle);
        }
        self.prune();
        close_all(sessions).await
    }

    /// Close idle sessions past their idle timeout or maximum age.
    pub async fn reap(&self) -> usize {
        let mut expired = Vec::new();
        for mut entry in self.slots.iter_mut() {
            let slot = entry.value_mut();
            let (keep, stale): (Vec<Session>, Vec<Session>) =
                std::mem::take(&mut slot.idle)
                    .into_iter()
                    .partition(|s| self.is_fresh(s));
            slot.idle = keep;
            expired.extend(stale);
        }
        self.prune();
        let count = close_all(expired).await;
        if count > 0 {
            debug!(count, "Reaped expired sessions");
        }
        count
    }

    /// Run [`reap`](Self::reap) every `interval` until `token` is cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        pool.reap().await;
                    }
                }
            }
            debug!("Session reaper stopped");
        })
    }
}

/// Exclusive use of one pooled session.
///
/// Dropping a checkout returns a healthy session to the pool. A session that
/// is not reusable, including one whose submit was cancelled mid-command, is
/// closed in the background instead.
pub struct Checkout {
    pool: Arc<SessionPool>,
    key: PoolKey,
    epoch: u64,
    session: Option<Session>,
    _permit: OwnedSemaphorePermit,
}

impl Checkout {
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub async fn submit(
        &mut self,
        request: &CommandRequest,
        default_timeout: Duration,
    ) -> Result<CommandResult, BridgeError> {
        match self.session.as_mut() {
            Some(session) => session.submit(request, default_timeout).await,
            None => Err(BridgeError::closed()),
        }
    }

    /// Give the session back to the pool, or close it if it cannot be reused.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take()
            && let Err(mut session) = self.pool.put(&self.key, self.epoch, session)
        {
            session.close().await;
        }
    }

    /// Close the session instead of pooling it.
    pub async fn discard(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Err(mut session) = self.pool.put(&self.key, self.epoch, session) else {
            return;
        };
        debug!(session_id = %session.id(), state = ?session.state(), "Closing abandoned session");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.close().await });
        }
    }
}
