//! Authenticated remote-shell sessions.
//!
//! A [`Session`] owns one channel, the strategy that authenticated it and one
//! remote command shell. Commands run one at a time: `submit` takes `&mut
//! self`, so two commands can never share a session's stream framing.
//!
//! ## Output collection
//!
//! Every Receive round asks for `stdout stderr` together, so both streams
//! drain in the same round trip while the exit code is awaited. A command
//! that floods its diagnostic stream cannot stall behind unread primary
//! output, or the other way round.
//!
//! ## State
//!
//! ```text
//! Open --submit--> Busy --done--> Open
//!                   |
//!                   +--transport error / timeout--> Failed
//! Open | Busy | Failed --close--> Closed
//! ```
//!
//! A session left `Busy` (its `submit` future was dropped) or `Failed` is
//! never reused; only `close` remains useful on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::auth::AuthStrategy;
use super::error::BridgeError;
use super::powershell::{self, POWERSHELL_PROGRAM};
use super::transport::{Channel, Reply};
use super::types::{AuthScheme, CommandRequest, CommandResult, Credential, Target, TransportCause};
use super::wsman;

/// Upper bound for the best-effort shell deletion on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Busy,
    Failed,
    Closed,
}

fn protocol(message: impl Into<String>) -> BridgeError {
    BridgeError::transport(TransportCause::Protocol, message)
}

/// Turn a non-2xx reply into a transport error.
fn reply_error(reply: &Reply, operation: &str) -> BridgeError {
    if reply.is_unauthorized() {
        return protocol(format!("{} rejected with HTTP 401 on an authenticated session", operation));
    }
    if wsman::is_unencrypted_refusal(&reply.body) {
        return BridgeError::transport(
            TransportCause::Unencrypted,
            format!(
                "{} refused unencrypted: {}. Use TLS, or Negotiate with sealing",
                operation,
                wsman::fault_message(&reply.body)
            ),
        );
    }
    if wsman::is_fault(&reply.body) {
        return protocol(format!(
            "{} failed with HTTP {}: {}",
            operation,
            reply.status,
            wsman::fault_message(&reply.body)
        ));
    }
    protocol(format!("{} failed with HTTP {}", operation, reply.status))
}

async fn send_expecting_success(
    channel: &dyn Channel,
    credential: &Credential,
    strategy: &dyn AuthStrategy,
    body: &str,
    operation: &str,
) -> Result<String, BridgeError> {
    let reply = strategy.send(channel, credential, body).await?;
    if reply.is_success() {
        Ok(reply.body)
    } else {
        Err(reply_error(&reply, operation))
    }
}

/// A live authenticated channel with one remote shell.
pub struct Session {
    id: String,
    target: Target,
    credential: Arc<Credential>,
    strategy: Arc<dyn AuthStrategy>,
    scheme: AuthScheme,
    channel: Box<dyn Channel>,
    shell_id: String,
    state: SessionState,
    created_at: DateTime<Utc>,
    opened: Instant,
    last_used: Instant,
}

impl Session {
    /// Create the remote shell the session will run every command in.
    pub(crate) async fn create_shell(
        channel: &dyn Channel,
        target: &Target,
        credential: &Credential,
        strategy: &dyn AuthStrategy,
    ) -> Result<String, BridgeError> {
        let body = send_expecting_success(
            channel,
            credential,
            strategy,
            &wsman::create_shell(&target.endpoint_url()),
            "Create",
        )
        .await?;
        wsman::parse_shell_id(&body)
    }

    pub(crate) fn new(
        target: Target,
        credential: Arc<Credential>,
        strategy: Arc<dyn AuthStrategy>,
        channel: Box<dyn Channel>,
        shell_id: String,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let scheme = strategy.scheme();
        let now = Instant::now();
        info!(
            session_id = %id,
            host = %target.host(),
            scheme = %scheme,
            shell_id = %shell_id,
            "Session opened"
        );
        Self {
            id,
            target,
            credential,
            strategy,
            scheme,
            channel,
            shell_id,
            state: SessionState::Open,
            created_at: Utc::now(),
            opened: now,
            last_used: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Scheme negotiated when the session was opened; never changes.
    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the session can take another command.
    pub fn is_reusable(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Run one command and wait for its exit code.
    ///
    /// `request.timeout` overrides `default_timeout`. On timeout or
    /// transport failure the session becomes unusable and must be closed.
    pub async fn submit(
        &mut self,
        request: &CommandRequest,
        default_timeout: Duration,
    ) -> Result<CommandResult, BridgeError> {
        if self.state != SessionState::Open {
            return Err(BridgeError::closed());
        }
        let timeout = request.timeout.unwrap_or(default_timeout);
        self.state = SessionState::Busy;
        self.last_used = Instant::now();
        let started = Instant::now();

        debug!(session_id = %self.id, host = %self.target.host(), "Submitting command");
        let result = tokio::time::timeout(timeout, self.run(&request.command)).await;

        match result {
            Ok(Ok((stdout, stderr, exit_code))) => {
                self.state = SessionState::Open;
                self.last_used = Instant::now();
                let stdout = String::from_utf8_lossy(&stdout).into_owned();
                let stderr = powershell::decode_clixml(&String::from_utf8_lossy(&stderr));
                debug!(
                    session_id = %self.id,
                    exit_code,
                    stdout_bytes = stdout.len(),
                    stderr_bytes = stderr.len(),
                    "Command completed"
                );
                Ok(CommandResult::new(
                    stdout,
                    stderr,
                    exit_code,
                    started.elapsed(),
                    self.scheme,
                    request.format,
                ))
            }
            Ok(Err(e)) => {
                self.state = SessionState::Failed;
                warn!(session_id = %self.id, error = %e, "Command failed on the transport");
                Err(e)
            }
            Err(_) => {
                self.state = SessionState::Failed;
                warn!(session_id = %self.id, ?timeout, "Command timed out");
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    async fn send(&self, body: &str, operation: &str) -> Result<String, BridgeError> {
        send_expecting_success(
            self.channel.as_ref(),
            &self.credential,
            self.strategy.as_ref(),
            body,
            operation,
        )
        .await
    }

    async fn run(&self, script: &str) -> Result<(Vec<u8>, Vec<u8>, i32), BridgeError> {
        let to = self.target.endpoint_url();
        let args = powershell::command_arguments(script);
        let body = self
            .send(
                &wsman::command(&to, &self.shell_id, POWERSHELL_PROGRAM, &args),
                "Command",
            )
            .await?;
        let command_id = wsman::parse_command_id(&body)?;

        let output = self.collect(&to, &command_id).await?;

        let signal = wsman::signal_terminate(&to, &self.shell_id, &command_id);
        if let Err(e) = self.send(&signal, "Signal").await {
            debug!(session_id = %self.id, error = %e, "Signal terminate failed");
        }
        Ok(output)
    }

    async fn collect(
        &self,
        to: &str,
        command_id: &str,
    ) -> Result<(Vec<u8>, Vec<u8>, i32), BridgeError> {
        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code = None;

        loop {
            let request = wsman::receive(to, &self.shell_id, command_id);
            let reply = self
                .strategy
                .send(self.channel.as_ref(), &self.credential, &request)
                .await?;

            if !reply.is_success() {
                if wsman::is_operation_timeout(&reply.body) {
                    trace!(session_id = %self.id, "Receive round produced no output");
                    continue;
                }
                return Err(reply_error(&reply, "Receive"));
            }

            let chunk = wsman::parse_receive(&reply.body)?;
            stdout.extend_from_slice(&chunk.stdout);
            stderr.extend_from_slice(&chunk.stderr);
            if chunk.exit_code.is_some() {
                exit_code = chunk.exit_code;
            }
            if chunk.done {
                let code = exit_code
                    .ok_or_else(|| protocol("command finished without reporting an exit code"))?;
                return Ok((stdout, stderr, code));
            }
        }
    }

    /// Delete the remote shell and release the channel. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let previous = self.state;
        self.state = SessionState::Closed;

        let delete = wsman::delete_shell(&self.target.endpoint_url(), &self.shell_id);
        match tokio::time::timeout(CLOSE_TIMEOUT, self.send(&delete, "Delete")).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "Shell delete failed"),
            Err(_) => debug!(session_id = %self.id, "Shell delete timed out"),
        }
        self.channel.shutdown().await;
        info!(
            session_id = %self.id,
            host = %self.target.host(),
            previous_state = ?previous,
            "Session closed"
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("principal", &self.credential.principal())
            .field("scheme", &self.scheme)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
