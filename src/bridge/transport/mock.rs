//! Scripted in-memory WinRM endpoint for tests.
//!
//! [`MockServer`] implements [`Connector`]; each connect yields a
//! [`MockChannel`] that speaks enough WS-Management to authenticate with
//! Basic or NTLM, create a shell, run scripts and stream their output back in
//! chunks. Negotiate over plain HTTP is sealed the way a Windows listener
//! seals it. Counters in [`MockStats`] let tests observe connects, shells and
//! how many commands were ever in flight on one channel at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use uuid::Uuid;

use super::{Channel, Connector, Exchange, Reply};
use crate::bridge::auth::ntlm;
use crate::bridge::auth::sealing::SecurityContext;
use crate::bridge::error::BridgeError;
use crate::bridge::powershell::{PROGRESS_PREAMBLE, decode_script};
use crate::bridge::types::{AuthScheme, Target, TransportCause};
use crate::bridge::wsman::{self, ACTION_COMMAND, ACTION_CREATE, ACTION_DELETE, ACTION_RECEIVE, ACTION_SIGNAL};

const SERVER_CHALLENGE: [u8; 8] = [0x4d, 0x6f, 0x63, 0x6b, 0x53, 0x72, 0x76, 0x21];

const OPERATION_TIMEOUT_FAULT: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">The WS-Management service cannot complete the operation within the time specified in OperationTimeout.</s:Text></s:Reason><s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858793" Machine="mock"/></s:Detail></s:Fault></s:Body></s:Envelope>"#;

const UNENCRYPTED_FAULT: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Code><s:Value>s:Sender</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">The WinRM service refuses unencrypted traffic on this listener.</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// What a script prints and returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Time the first Receive waits before any output
    pub delay: Duration,
    /// Receive rounds the output is spread over
    pub chunks: usize,
}

impl ScriptedOutput {
    pub(crate) fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            delay: Duration::ZERO,
            chunks: 1,
        }
    }

    pub(crate) fn failed(stderr: &str, exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
            delay: Duration::ZERO,
            chunks: 1,
        }
    }

    pub(crate) fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn in_chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectBehavior {
    Accept,
    Fail(TransportCause),
    /// Take this long to connect; fails with a timeout if it exceeds the
    /// caller's budget
    Delay(Duration),
}

#[derive(Debug, Clone)]
pub(crate) struct MockConfig {
    pub connect: ConnectBehavior,
    pub accepts: Vec<AuthScheme>,
    pub password: String,
    /// Overrides the status of an authenticated Identify
    pub identify_status: Option<u16>,
    /// Added before every exchange
    pub exchange_delay: Duration,
    /// Operation-timeout faults returned before a command's first output
    pub timeout_rounds: usize,
    /// The next Receive fails as a connection reset
    pub drop_next_receive: bool,
    /// Grant NTLM signing, sealing and key exchange
    pub grant_sealing: bool,
    /// Refuse unsealed SOAP bodies on plain HTTP
    pub require_sealing: bool,
    /// Announce `Connection: close` on the NTLM challenge
    pub close_after_challenge: bool,
    pub scripts: HashMap<String, ScriptedOutput>,
    pub default_output: ScriptedOutput,
}

impl MockConfig {
    pub(crate) fn accepting(schemes: &[AuthScheme], password: &str) -> Self {
        Self {
            connect: ConnectBehavior::Accept,
            accepts: schemes.to_vec(),
            password: password.to_string(),
            identify_status: None,
            exchange_delay: Duration::ZERO,
            timeout_rounds: 0,
            drop_next_receive: false,
            grant_sealing: true,
            require_sealing: false,
            close_after_challenge: false,
            scripts: HashMap::new(),
            default_output: ScriptedOutput::ok(""),
        }
    }

    pub(crate) fn with_script(mut self, script: &str, output: ScriptedOutput) -> Self {
        self.scripts.insert(script.to_string(), output);
        self
    }
}

/// Snapshot of server-side counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MockStats {
    pub connects: usize,
    pub shells_created: usize,
    pub shells_deleted: usize,
    pub commands: usize,
    pub signals: usize,
    pub shutdowns: usize,
    /// Requests that arrived sealed
    pub sealed_requests: usize,
    /// Highest number of commands ever running at once on one channel
    pub max_in_flight: usize,
    /// Scripts in the order they were started
    pub scripts: Vec<String>,
}

struct Inner {
    config: Mutex<MockConfig>,
    stats: Mutex<MockStats>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct MockServer {
    inner: Arc<Inner>,
}

impl MockServer {
    pub(crate) fn new(config: MockConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                stats: Mutex::new(MockStats::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn stats(&self) -> MockStats {
        lock(&self.inner.stats).clone()
    }

    pub(crate) fn configure(&self, update: impl FnOnce(&mut MockConfig)) {
        update(&mut lock(&self.inner.config));
    }

    /// Break every channel opened so far, as a server restart would.
    pub(crate) fn sever_all(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(
        &self,
        target: &Target,
        timeout: Duration,
    ) -> Result<Box<dyn Channel>, BridgeError> {
        lock(&self.inner.stats).connects += 1;
        let (behavior, accepts) = {
            let config = lock(&self.inner.config);
            (config.connect, config.accepts.clone())
        };

        match behavior {
            ConnectBehavior::Accept => {}
            ConnectBehavior::Fail(cause) => {
                return Err(BridgeError::transport(
                    cause,
                    format!("mock connect to {} failed", target),
                ));
            }
            ConnectBehavior::Delay(delay) if delay >= timeout => {
                tokio::time::sleep(timeout).await;
                return Err(BridgeError::transport(
                    TransportCause::Timeout,
                    format!("connect to {} timed out after {:?}", target, timeout),
                ));
            }
            ConnectBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }

        let offered = accepts
            .iter()
            .map(|s| match s {
                AuthScheme::Negotiate => "Negotiate".to_string(),
                AuthScheme::Basic => "Basic realm=\"WSMAN\"".to_string(),
            })
            .collect();

        Ok(Box::new(MockChannel {
            inner: self.inner.clone(),
            generation: self.inner.generation.load(Ordering::SeqCst),
            tls: target.uses_tls(),
            closed: AtomicBool::new(false),
            offered,
            state: Mutex::new(ChannelState::default()),
        }))
    }
}

struct RunningCommand {
    stdout: VecDeque<Vec<u8>>,
    stderr: VecDeque<Vec<u8>>,
    exit_code: i32,
    delay: Duration,
    timeouts_left: usize,
    started: bool,
}

#[derive(Default)]
struct ChannelState {
    shells: HashSet<String>,
    commands: HashMap<String, RunningCommand>,
    in_flight: usize,
    /// Context of the last accepted NTLM AUTHENTICATE
    context: Option<SecurityContext>,
}

pub(crate) struct MockChannel {
    inner: Arc<Inner>,
    generation: u64,
    tls: bool,
    closed: AtomicBool,
    offered: Vec<String>,
    state: Mutex<ChannelState>,
}

fn split_chunks(data: &[u8], chunks: usize) -> VecDeque<Vec<u8>> {
    if data.is_empty() {
        return VecDeque::new();
    }
    let size = data.len().div_ceil(chunks.max(1));
    data.chunks(size).map(<[u8]>::to_vec).collect()
}

fn ok(body: String) -> Reply {
    Reply::new(200, body)
}

fn fault(status: u16, body: &str) -> Reply {
    Reply::new(status, body)
}

impl MockChannel {
    fn unauthorized(&self, challenges: Vec<String>) -> Reply {
        Reply {
            challenges,
            ..Reply::new(401, "")
        }
    }

    /// `None` when the request is authenticated, else the 401 to return.
    fn check_auth(&self, authorization: Option<&str>, config: &MockConfig) -> Option<Reply> {
        let Some(header) = authorization else {
            return Some(self.unauthorized(self.offered.clone()));
        };
        let (scheme, token) = header.split_once(' ').unwrap_or((header, ""));
        let bytes = BASE64.decode(token.trim()).unwrap_or_default();

        if scheme.eq_ignore_ascii_case("Basic") {
            let pair = String::from_utf8_lossy(&bytes);
            let secret = pair.split_once(':').map(|(_, s)| s).unwrap_or("");
            if config.accepts.contains(&AuthScheme::Basic) && secret == config.password {
                return None;
            }
            return Some(self.unauthorized(self.offered.clone()));
        }

        if scheme.eq_ignore_ascii_case("Negotiate") {
            let offers_ntlm = config.accepts.contains(&AuthScheme::Negotiate);
            match bytes.get(8).copied() {
                Some(1) if offers_ntlm => {
                    let challenge = if config.grant_sealing {
                        ntlm::challenge_message(&SERVER_CHALLENGE, &[])
                    } else {
                        ntlm::challenge_message_with_flags(
                            &SERVER_CHALLENGE,
                            &[],
                            ntlm::FLAGS_WITHOUT_SEALING,
                        )
                    };
                    let mut reply = self.unauthorized(vec![format!(
                        "Negotiate {}",
                        BASE64.encode(challenge)
                    )]);
                    reply.closes_connection = config.close_after_challenge;
                    return Some(reply);
                }
                Some(3) if offers_ntlm => {
                    let key = ntlm::accept_authenticate(&bytes, &SERVER_CHALLENGE, &config.password);
                    let Some(key) = key else {
                        return Some(self.unauthorized(self.offered.clone()));
                    };
                    lock(&self.state).context = Some(SecurityContext::server(&key));
                    return None;
                }
                _ => return Some(self.unauthorized(self.offered.clone())),
            }
        }

        Some(self.unauthorized(self.offered.clone()))
    }

    /// Unseal with the connection's context, dispatch, and seal the reply.
    async fn dispatch_sealed(&self, framed: &[u8]) -> Result<Reply, BridgeError> {
        let context = lock(&self.state).context.take();
        let Some(mut context) = context else {
            return Ok(self.unauthorized(self.offered.clone()));
        };
        let Ok(plaintext) = context.unwrap(framed) else {
            return Ok(fault(400, "<s:Fault><s:Reason><s:Text>bad seal</s:Text></s:Reason></s:Fault>"));
        };
        lock(&self.inner.stats).sealed_requests += 1;

        let reply = self.dispatch(&String::from_utf8_lossy(&plaintext)).await?;
        let sealed = context.wrap(reply.body.as_bytes())?;
        lock(&self.state).context = Some(context);
        Ok(Reply {
            body: String::new(),
            sealed: Some(sealed),
            ..reply
        })
    }

    async fn dispatch(&self, body: &str) -> Result<Reply, BridgeError> {
        if wsman::first(body, "Identify").is_some() {
            let status = lock(&self.inner.config).identify_status.unwrap_or(200);
            return Ok(Reply::new(
                status,
                "<wsmid:IdentifyResponse><wsmid:ProductVendor>Mock</wsmid:ProductVendor></wsmid:IdentifyResponse>",
            ));
        }

        let action = wsman::first(body, "Action").map(|a| a.text()).unwrap_or("");
        let shell_id = wsman::elements(body, "Selector")
            .into_iter()
            .find(|s| s.attr("Name") == Some("ShellId"))
            .map(|s| s.text().to_string());

        match action {
            ACTION_CREATE => {
                let id = Uuid::new_v4().to_string().to_uppercase();
                lock(&self.state).shells.insert(id.clone());
                lock(&self.inner.stats).shells_created += 1;
                Ok(ok(format!(
                    "<rsp:Shell><rsp:ShellId>{}</rsp:ShellId></rsp:Shell>",
                    id
                )))
            }
            ACTION_COMMAND => self.start_command(body, shell_id),
            ACTION_RECEIVE => self.receive(body).await,
            ACTION_SIGNAL => {
                let command_id = wsman::first(body, "Signal")
                    .and_then(|s| s.attr("CommandId"))
                    .unwrap_or("");
                let mut state = lock(&self.state);
                if state.commands.remove(command_id).is_some() {
                    state.in_flight = state.in_flight.saturating_sub(1);
                }
                lock(&self.inner.stats).signals += 1;
                Ok(ok("<rsp:SignalResponse/>".to_string()))
            }
            ACTION_DELETE => {
                if let Some(id) = shell_id {
                    lock(&self.state).shells.remove(&id);
                }
                lock(&self.inner.stats).shells_deleted += 1;
                Ok(ok(String::new()))
            }
            _ => Ok(fault(400, "<s:Fault><s:Reason><s:Text>unknown action</s:Text></s:Reason></s:Fault>")),
        }
    }

    fn start_command(&self, body: &str, shell_id: Option<String>) -> Result<Reply, BridgeError> {
        let known_shell = shell_id.is_some_and(|id| lock(&self.state).shells.contains(&id));
        if !known_shell {
            return Ok(fault(
                500,
                "<s:Fault><s:Reason><s:Text>The request for the Windows Remote Shell with ShellId failed because the shell was not found on the server.</s:Text></s:Reason></s:Fault>",
            ));
        }

        let script = wsman::elements(body, "Arguments")
            .last()
            .and_then(|arg| decode_script(&wsman::xml_unescape(arg.text())))
            .map(|s| s.strip_prefix(PROGRESS_PREAMBLE).unwrap_or(&s).to_string())
            .unwrap_or_default();

        let (output, timeout_rounds) = {
            let config = lock(&self.inner.config);
            let output = config
                .scripts
                .get(&script)
                .cloned()
                .unwrap_or_else(|| config.default_output.clone());
            (output, config.timeout_rounds)
        };

        let command_id = Uuid::new_v4().to_string().to_uppercase();
        let in_flight = {
            let mut state = lock(&self.state);
            state.in_flight += 1;
            state.commands.insert(
                command_id.clone(),
                RunningCommand {
                    stdout: split_chunks(output.stdout.as_bytes(), output.chunks),
                    stderr: split_chunks(output.stderr.as_bytes(), output.chunks),
                    exit_code: output.exit_code,
                    delay: output.delay,
                    timeouts_left: timeout_rounds,
                    started: false,
                },
            );
            state.in_flight
        };

        let mut stats = lock(&self.inner.stats);
        stats.commands += 1;
        stats.max_in_flight = stats.max_in_flight.max(in_flight);
        stats.scripts.push(script);

        Ok(ok(format!(
            "<rsp:CommandResponse><rsp:CommandId>{}</rsp:CommandId></rsp:CommandResponse>",
            command_id
        )))
    }

    async fn receive(&self, body: &str) -> Result<Reply, BridgeError> {
        {
            let mut config = lock(&self.inner.config);
            if config.drop_next_receive {
                config.drop_next_receive = false;
                return Err(BridgeError::transport(
                    TransportCause::Reset,
                    "connection reset by peer",
                ));
            }
        }

        let command_id = wsman::first(body, "DesiredStream")
            .and_then(|d| d.attr("CommandId"))
            .unwrap_or("")
            .to_string();

        let delay = {
            let mut state = lock(&self.state);
            match state.commands.get_mut(&command_id) {
                Some(cmd) if !cmd.started => {
                    cmd.started = true;
                    cmd.delay
                }
                Some(_) => Duration::ZERO,
                None => {
                    return Ok(fault(
                        500,
                        "<s:Fault><s:Reason><s:Text>unknown command</s:Text></s:Reason></s:Fault>",
                    ));
                }
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let Some(cmd) = state.commands.get_mut(&command_id) else {
            return Ok(fault(
                500,
                "<s:Fault><s:Reason><s:Text>unknown command</s:Text></s:Reason></s:Fault>",
            ));
        };
        if cmd.timeouts_left > 0 {
            cmd.timeouts_left -= 1;
            return Ok(fault(500, OPERATION_TIMEOUT_FAULT));
        }

        let mut streams = String::new();
        if let Some(chunk) = cmd.stdout.pop_front() {
            streams.push_str(&format!(
                "<rsp:Stream Name=\"stdout\" CommandId=\"{}\">{}</rsp:Stream>",
                command_id,
                BASE64.encode(chunk)
            ));
        }
        if let Some(chunk) = cmd.stderr.pop_front() {
            streams.push_str(&format!(
                "<rsp:Stream Name=\"stderr\" CommandId=\"{}\">{}</rsp:Stream>",
                command_id,
                BASE64.encode(chunk)
            ));
        }
        let state_xml = if cmd.stdout.is_empty() && cmd.stderr.is_empty() {
            format!(
                "<rsp:CommandState CommandId=\"{}\" State=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done\"><rsp:ExitCode>{}</rsp:ExitCode></rsp:CommandState>",
                command_id, cmd.exit_code
            )
        } else {
            format!(
                "<rsp:CommandState CommandId=\"{}\" State=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running\"/>",
                command_id
            )
        };

        Ok(ok(format!(
            "<rsp:ReceiveResponse>{}{}</rsp:ReceiveResponse>",
            streams, state_xml
        )))
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn exchange(&self, exchange: Exchange<'_>) -> Result<Reply, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::closed());
        }
        if self.generation != self.inner.generation.load(Ordering::SeqCst) {
            return Err(BridgeError::transport(
                TransportCause::Reset,
                "connection reset by peer",
            ));
        }

        let delay = lock(&self.inner.config).exchange_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(framed) = exchange.sealed {
            return self.dispatch_sealed(framed).await;
        }

        let (rejection, refuse_plain) = {
            let config = lock(&self.inner.config);
            (
                self.check_auth(exchange.authorization, &config),
                config.require_sealing && !self.tls,
            )
        };
        if let Some(reply) = rejection {
            return Ok(reply);
        }

        match exchange.body {
            Some(_) if refuse_plain => Ok(fault(400, UNENCRYPTED_FAULT)),
            Some(body) => self.dispatch(body).await,
            None => Ok(ok(String::new())),
        }
    }

    fn offered_challenges(&self) -> &[String] {
        &self.offered
    }

    fn is_encrypted(&self) -> bool {
        self.tls
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.inner.stats).shutdowns += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::auth::{AuthStrategy, BasicAuth, NegotiateAuth};
    use crate::bridge::types::Credential;

    async fn channel(server: &MockServer) -> Box<dyn Channel> {
        server
            .connect(&Target::plaintext("mock").unwrap(), Duration::from_secs(1))
            .await
            .map_err(|e| e.to_string())
            .unwrap()
    }

    #[tokio::test]
    async fn test_unauthenticated_request_is_challenged() {
        let server = MockServer::new(MockConfig::accepting(&[AuthScheme::Negotiate], "pw"));
        let ch = channel(&server).await;
        let reply = ch.exchange(Exchange::anonymous(None)).await.unwrap();
        assert!(reply.is_unauthorized());
        assert!(reply.offers("negotiate"));
    }

    #[tokio::test]
    async fn test_ntlm_round_trip_against_mock() {
        let server = MockServer::new(MockConfig::accepting(&[AuthScheme::Negotiate], "pw"));
        let ch = channel(&server).await;
        let cred = Credential::new("CORP\\user", "pw").unwrap();
        let reply = NegotiateAuth::new()
            .send(ch.as_ref(), &cred, &wsman::identify())
            .await
            .unwrap();
        assert!(reply.is_success());

        let bad = Credential::new("CORP\\user", "nope").unwrap();
        let reply = NegotiateAuth::new()
            .send(ch.as_ref(), &bad, &wsman::identify())
            .await
            .unwrap();
        assert!(reply.is_unauthorized());
    }

    #[tokio::test]
    async fn test_ntlm_seals_on_plain_http() {
        let server = MockServer::new(MockConfig::accepting(&[AuthScheme::Negotiate], "pw"));
        let ch = channel(&server).await;
        let cred = Credential::new("CORP\\user", "pw").unwrap();
        let reply = NegotiateAuth::new()
            .send(ch.as_ref(), &cred, &wsman::create_shell("http://mock:5985/wsman"))
            .await
            .unwrap();
        assert!(reply.is_success());
        assert!(reply.sealed.is_none());
        assert!(wsman::parse_shell_id(&reply.body).is_ok());
        assert_eq!(server.stats().sealed_requests, 1);
    }

    #[tokio::test]
    async fn test_ntlm_over_tls_is_not_sealed() {
        let server = MockServer::new(MockConfig::accepting(&[AuthScheme::Negotiate], "pw"));
        let ch = server
            .connect(&Target::tls("mock").unwrap(), Duration::from_secs(1))
            .await
            .map_err(|e| e.to_string())
            .unwrap();
        let cred = Credential::new("CORP\\user", "pw").unwrap();
        let reply = NegotiateAuth::new()
            .send(ch.as_ref(), &cred, &wsman::identify())
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(server.stats().sealed_requests, 0);
    }

    #[tokio::test]
    async fn test_unsealed_body_refused_when_sealing_required() {
        let mut config = MockConfig::accepting(&[AuthScheme::Negotiate], "pw");
        config.require_sealing = true;
        let server = MockServer::new(config);
        let ch = channel(&server).await;
        let cred = Credential::new("CORP\\user", "pw").unwrap();

        let reply = NegotiateAuth::unsealed()
            .send(ch.as_ref(), &cred, &wsman::identify())
            .await
            .unwrap();
        assert_eq!(reply.status, 400);
        assert!(wsman::is_unencrypted_refusal(&reply.body));

        let reply = NegotiateAuth::new()
            .send(ch.as_ref(), &cred, &wsman::identify())
            .await
            .unwrap();
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_sealed_request_without_context_is_unauthorized() {
        let server = MockServer::new(MockConfig::accepting(&[AuthScheme::Negotiate], "pw"));
        let ch = channel(&server).await;
        let mut stranger = SecurityContext::client(&[1u8; 16]);
        let framed = stranger.wrap(b"<s:Envelope/>").unwrap();
        let reply = ch.exchange(Exchange::sealed(&framed)).await.unwrap();
        assert!(reply.is_unauthorized());
    }

    #[tokio::test]
    async fn test_basic_refused_when_not_accepted() {
        let server = MockServer::new(MockConfig::accepting(&[AuthScheme::Negotiate], "pw"));
        let ch = channel(&server).await;
        let cred = Credential::new("user", "pw").unwrap();
        let reply = BasicAuth::new()
            .send(ch.as_ref(), &cred, &wsman::identify())
            .await
            .unwrap();
        assert!(reply.is_unauthorized());
    }

    #[tokio::test]
    async fn test_severed_channel_resets() {
        let server = MockServer::new(MockConfig::accepting(&[AuthScheme::Basic], "pw"));
        let ch = channel(&server).await;
        server.sever_all();
        let err = ch.exchange(Exchange::anonymous(None)).await.unwrap_err();
        assert_eq!(err.cause(), Some(TransportCause::Reset));
    }

    #[test]
    fn test_split_chunks() {
        assert_eq!(split_chunks(b"abcde", 2), VecDeque::from(vec![b"abc".to_vec(), b"de".to_vec()]));
        assert!(split_chunks(b"", 3).is_empty());
    }
}
