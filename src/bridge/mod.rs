//! Remote PowerShell execution over WinRM.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Targets, credentials, requests, results and typed outcomes
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Bridge errors and transport cause classification
//! - `transport`: Channel and connector traits, HTTP implementation
//! - `wsman`: WS-Management envelopes and response parsing
//! - `powershell`: Command encoding and diagnostic decoding
//! - `auth`: Basic and NTLM strategies, ordered scheme negotiation
//! - `session`: One authenticated channel with a remote shell
//! - `pool`: Exclusive session checkouts keyed by target and credential
//! - `classifier`: Pure mapping from command results to outcomes
//! - `executor`: The `Bridge` façade with bounded retry
//!
//! # Example
//!
//! ```no_run
//! use winrm_bridge::bridge::{Bridge, BridgeConfig, CommandRequest, Credential, SchemeList, Target};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = Bridge::http(BridgeConfig::default());
//! let target = Target::tls("dc01.corp.local")?;
//! let credential = Credential::new("CORP\\svc-bridge", "secret")?;
//! let outcome = bridge
//!     .execute(
//!         &target,
//!         &credential,
//!         &SchemeList::parse("negotiate,basic")?,
//!         CommandRequest::new("Get-ADGroup -Filter * | Select-Object Name | ConvertTo-Json"),
//!         &bridge.default_policy(),
//!     )
//!     .await;
//! println!("{}", outcome.kind());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod powershell;
pub mod session;
pub mod transport;
pub mod types;
pub(crate) mod wsman;

pub use classifier::classify;
pub use config::{BridgeConfig, ConfigError, PoolConfig, RetryPolicy, Timeouts};
pub use error::BridgeError;
pub use executor::{Bridge, ExecutePolicy, Reuse};
pub use pool::{Checkout, PoolKey, SessionPool};
pub use session::{Session, SessionState};
pub use types::{
    AuthScheme, CommandRequest, CommandResult, Credential, FailureKind, Outcome, Payload,
    PayloadFormat, SchemeAttempt, SchemeList, Target, TransportCause,
};
