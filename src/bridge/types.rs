//! Value types shared across the bridge.
//!
//! `Target` and `Credential` identify where and as whom to connect,
//! `CommandRequest`/`CommandResult` carry one command through a session, and
//! `Outcome` is the typed result handed back to callers.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use zeroize::Zeroizing;

use super::config::ConfigError;

/// Default WinRM HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 5986;

/// Where to connect. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    host: String,
    port: u16,
    tls: bool,
    validate_certs: bool,
}

impl Target {
    /// Create a target, rejecting an empty host or a zero port.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        tls: bool,
        validate_certs: bool,
    ) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::InvalidTarget("host must not be empty".to_string()));
        }
        if port == 0 {
            return Err(ConfigError::InvalidTarget("port must not be zero".to_string()));
        }
        Ok(Self {
            host,
            port,
            tls,
            validate_certs,
        })
    }

    /// Plaintext HTTP target on the default WinRM port.
    pub fn plaintext(host: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(host, DEFAULT_HTTP_PORT, false, false)
    }

    /// HTTPS target on the default WinRM TLS port with certificate validation.
    pub fn tls(host: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(host, DEFAULT_HTTPS_PORT, true, true)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uses_tls(&self) -> bool {
        self.tls
    }

    pub fn validates_certs(&self) -> bool {
        self.validate_certs
    }

    /// The WS-Management endpoint URL, e.g. `http://dc01:5985/wsman`.
    ///
    /// Bare IPv6 literals are bracketed.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}/wsman", scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}/wsman", scheme, self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Principal/secret pair. The secret is zeroed on drop and never printed.
#[derive(Clone)]
pub struct Credential {
    principal: String,
    secret: Zeroizing<String>,
}

impl Credential {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Result<Self, ConfigError> {
        let principal = principal.into();
        if principal.trim().is_empty() {
            return Err(ConfigError::InvalidCredential(
                "principal must not be empty".to_string(),
            ));
        }
        Ok(Self {
            principal,
            secret: Zeroizing::new(secret.into()),
        })
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Use sparingly and only to build authentication tokens.
    pub fn expose_secret(&self) -> &str {
        &self.secret
    }

    /// Process-local digest of principal and secret, used as a pool key.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.principal.hash(&mut hasher);
        self.secret.as_str().hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &"***")
            .finish()
    }
}

/// HTTP authentication scheme used to negotiate a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// HTTP Basic (local accounts only on Windows)
    Basic,
    /// NTLM carried in the `Negotiate` HTTP scheme
    Negotiate,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "basic",
            AuthScheme::Negotiate => "negotiate",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthScheme::Basic),
            "negotiate" | "ntlm" => Ok(AuthScheme::Negotiate),
            other => Err(ConfigError::UnknownScheme(other.to_string())),
        }
    }
}

/// Ordered, non-empty negotiation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeList(Vec<AuthScheme>);

impl SchemeList {
    /// Build a scheme list. An empty list is a programming error.
    pub fn new(schemes: Vec<AuthScheme>) -> Result<Self, ConfigError> {
        if schemes.is_empty() {
            return Err(ConfigError::EmptySchemes);
        }
        Ok(Self(schemes))
    }

    /// Parse a comma separated list such as `"negotiate,basic"`.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let schemes = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(AuthScheme::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(schemes)
    }

    pub fn as_slice(&self) -> &[AuthScheme] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for SchemeList {
    fn default() -> Self {
        Self(vec![AuthScheme::Negotiate])
    }
}

/// How successful primary output is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Structured output (`ConvertTo-Json`)
    #[default]
    Json,
    /// Raw text, trimmed
    Text,
}

/// One command to run. Constructed fresh per call.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub timeout: Option<Duration>,
    pub format: PayloadFormat,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            format: PayloadFormat::Json,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }
}

/// Raw result of a completed command.
///
/// Only sessions construct this, and only after an exit code was observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    stdout: String,
    stderr: String,
    exit_code: i32,
    elapsed_ms: u64,
    scheme: AuthScheme,
    format: PayloadFormat,
}

impl CommandResult {
    pub(crate) fn new(
        stdout: String,
        stderr: String,
        exit_code: i32,
        elapsed: Duration,
        scheme: AuthScheme,
        format: PayloadFormat,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            elapsed_ms: elapsed.as_millis() as u64,
            scheme,
            format,
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Scheme the producing session was negotiated with
    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }
}

/// Successful command payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Empty,
    Json(Value),
    Text(String),
}

/// Why a command is reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote command reported a non-zero exit code
    Remote,
    /// Exit code zero, but the payload could not be parsed
    MalformedOutput,
}

/// One rejected negotiation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemeAttempt {
    pub scheme: AuthScheme,
    pub reason: String,
}

impl fmt::Display for SchemeAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.scheme, self.reason)
    }
}

/// Underlying cause of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportCause {
    Dns,
    Refused,
    Timeout,
    Reset,
    Tls,
    /// The peer answered but not as a WS-Management endpoint
    Protocol,
    /// The listener refuses unencrypted traffic, or would not agree to
    /// message sealing
    Unencrypted,
    /// The session was already closed
    Closed,
    Other,
}

impl fmt::Display for TransportCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportCause::Dns => "dns",
            TransportCause::Refused => "connection refused",
            TransportCause::Timeout => "timeout",
            TransportCause::Reset => "connection reset",
            TransportCause::Tls => "tls",
            TransportCause::Protocol => "protocol",
            TransportCause::Unencrypted => "unencrypted traffic refused",
            TransportCause::Closed => "session closed",
            TransportCause::Other => "transport",
        };
        f.write_str(s)
    }
}

/// Typed result of one `execute` call.
///
/// Control decisions use the variant tag, never the message text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        payload: Payload,
    },
    CommandFailure {
        diagnostic: String,
        code: i32,
        kind: FailureKind,
    },
    AuthFailure {
        attempts: Vec<SchemeAttempt>,
    },
    TransportFailure {
        cause: TransportCause,
        message: String,
        attempts: u32,
    },
    Timeout {
        after_ms: u64,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Short tag for logs and exit statuses.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::CommandFailure {
                kind: FailureKind::MalformedOutput,
                ..
            } => "malformed_output",
            Outcome::CommandFailure { .. } => "command_failure",
            Outcome::AuthFailure { .. } => "auth_failure",
            Outcome::TransportFailure { .. } => "transport_failure",
            Outcome::Timeout { .. } => "timeout",
        }
    }
}
