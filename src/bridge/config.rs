//! Configuration resolution for the WinRM bridge.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WINRM_SERVER` | (required) | Target host name or address |
//! | `WINRM_PORT` | 5985 / 5986 | WinRM port (HTTPS default when `WINRM_SSL` is set) |
//! | `WINRM_USERNAME` | (required) | Principal, `DOMAIN\user` or `user@domain` |
//! | `WINRM_PASSWORD` | (required) | Secret |
//! | `WINRM_SSL` | false | Use HTTPS |
//! | `WINRM_CERT_VALIDATION` | true | Validate the server certificate |
//! | `WINRM_AUTH` | negotiate | Comma separated negotiation order |
//! | `WINRM_CONNECT_TIMEOUT` | 30s | Connect + handshake timeout in seconds |
//! | `WINRM_AUTH_TIMEOUT` | 30s | Authentication timeout in seconds |
//! | `WINRM_COMMAND_TIMEOUT` | 180s | Command execution timeout in seconds |
//! | `WINRM_MAX_RETRIES` | 1 | Transport retries per execute |
//! | `WINRM_RETRY_DELAY_MS` | 500ms | Delay before a transport retry |
//! | `WINRM_SESSION_IDLE_TIMEOUT` | 300s | Idle time before a pooled session is closed |
//! | `WINRM_MAX_SESSIONS` | 4 | Concurrent sessions per target and credential |

use std::env;
use std::time::Duration;

use thiserror::Error;

use super::types::{Credential, DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, SchemeList, Target};

/// Default connect timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default authentication timeout in seconds
pub(crate) const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// Default transport retries per execute
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default idle timeout for pooled sessions in seconds
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default maximum session age in seconds
pub(crate) const DEFAULT_MAX_AGE_SECS: u64 = 3600;

/// Default concurrent sessions per pool key
pub(crate) const DEFAULT_MAX_SESSIONS: usize = 4;

pub(crate) const SERVER_ENV_VAR: &str = "WINRM_SERVER";
pub(crate) const PORT_ENV_VAR: &str = "WINRM_PORT";
pub(crate) const USERNAME_ENV_VAR: &str = "WINRM_USERNAME";
pub(crate) const PASSWORD_ENV_VAR: &str = "WINRM_PASSWORD";
pub(crate) const SSL_ENV_VAR: &str = "WINRM_SSL";
pub(crate) const CERT_VALIDATION_ENV_VAR: &str = "WINRM_CERT_VALIDATION";
pub(crate) const AUTH_ENV_VAR: &str = "WINRM_AUTH";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "WINRM_CONNECT_TIMEOUT";
pub(crate) const AUTH_TIMEOUT_ENV_VAR: &str = "WINRM_AUTH_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "WINRM_COMMAND_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "WINRM_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "WINRM_RETRY_DELAY_MS";
pub(crate) const IDLE_TIMEOUT_ENV_VAR: &str = "WINRM_SESSION_IDLE_TIMEOUT";
pub(crate) const MAX_SESSIONS_ENV_VAR: &str = "WINRM_MAX_SESSIONS";

/// Problems building bridge inputs from configuration or arguments.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("authentication scheme list must not be empty")]
    EmptySchemes,

    #[error("unknown authentication scheme {0:?}")]
    UnknownScheme(String),
}

fn env_parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(var: &str) -> Option<bool> {
    env::var(var).ok().map(|v| {
        let v = v.trim();
        v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes")
    })
}

/// Resolve the connect timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parsed(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the authentication timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_auth_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parsed(AUTH_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_AUTH_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the command timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parsed(COMMAND_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the max retries value with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    max_retries_param
        .or_else(|| env_parsed(MAX_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_RETRIES)
}

/// Resolve the retry delay with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    let ms = retry_delay_param
        .or_else(|| env_parsed(RETRY_DELAY_MS_ENV_VAR))
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// Resolve the session idle timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_idle_timeout(idle_param: Option<u64>) -> Duration {
    let secs = idle_param
        .or_else(|| env_parsed(IDLE_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the per-key session limit. Zero is clamped to one.
pub(crate) fn resolve_max_sessions(max_param: Option<usize>) -> usize {
    max_param
        .or_else(|| env_parsed(MAX_SESSIONS_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_SESSIONS)
        .max(1)
}

/// Independent timeouts for the three suspension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub authenticate: Duration,
    pub command: Duration,
}

impl Timeouts {
    pub fn from_env() -> Self {
        Self {
            connect: resolve_connect_timeout(None),
            authenticate: resolve_auth_timeout(None),
            command: resolve_command_timeout(None),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            authenticate: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            command: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }
}

/// Bounded retry for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; later retries back off exponentially
    pub delay: Duration,
}

impl RetryPolicy {
    /// Fail on the first transport error
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn from_env() -> Self {
        Self {
            max_retries: resolve_max_retries(None),
            delay: resolve_retry_delay(None),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Limits for the session pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle sessions older than this are closed instead of reused
    pub idle_timeout: Duration,
    /// Sessions older than this are closed instead of reused
    pub max_age: Duration,
    /// Concurrent checkouts per target and credential; extra callers queue
    pub max_sessions_per_key: usize,
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self {
            idle_timeout: resolve_idle_timeout(None),
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            max_sessions_per_key: resolve_max_sessions(None),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            max_sessions_per_key: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Everything the bridge needs that is not per-call.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub pool: PoolConfig,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self {
            timeouts: Timeouts::from_env(),
            retry: RetryPolicy::from_env(),
            pool: PoolConfig::from_env(),
        }
    }
}

/// Build the target from `WINRM_SERVER`, `WINRM_PORT`, `WINRM_SSL` and
/// `WINRM_CERT_VALIDATION`.
pub fn target_from_env() -> Result<Target, ConfigError> {
    let host = env::var(SERVER_ENV_VAR).map_err(|_| ConfigError::MissingVar(SERVER_ENV_VAR))?;
    let tls = env_flag(SSL_ENV_VAR).unwrap_or(false);
    let validate = env_flag(CERT_VALIDATION_ENV_VAR).unwrap_or(true);
    let port = match env::var(PORT_ENV_VAR) {
        Ok(raw) => raw.trim().parse::<u16>().map_err(|_| ConfigError::InvalidValue {
            var: PORT_ENV_VAR,
            value: raw,
        })?,
        Err(_) if tls => DEFAULT_HTTPS_PORT,
        Err(_) => DEFAULT_HTTP_PORT,
    };
    Target::new(host, port, tls, validate)
}

/// Build the credential from `WINRM_USERNAME` and `WINRM_PASSWORD`.
pub fn credential_from_env() -> Result<Credential, ConfigError> {
    let username =
        env::var(USERNAME_ENV_VAR).map_err(|_| ConfigError::MissingVar(USERNAME_ENV_VAR))?;
    let password =
        env::var(PASSWORD_ENV_VAR).map_err(|_| ConfigError::MissingVar(PASSWORD_ENV_VAR))?;
    Credential::new(username, password)
}

/// Negotiation order from `WINRM_AUTH`, defaulting to `negotiate`.
pub fn schemes_from_env() -> Result<SchemeList, ConfigError> {
    match env::var(AUTH_ENV_VAR) {
        Ok(list) => SchemeList::parse(&list),
        Err(_) => Ok(SchemeList::default()),
    }
}
