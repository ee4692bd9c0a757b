//! Transport connector and channel abstractions.
//!
//! A [`Connector`] opens a [`Channel`] to one target. A channel carries
//! request/reply exchanges against the WS-Management endpoint and owns the
//! underlying sockets; dropping it releases them. Connectors perform no
//! retries.

use std::time::Duration;

use async_trait::async_trait;

use super::error::BridgeError;
use super::types::Target;

mod http;
#[cfg(test)]
pub(crate) mod mock;

pub use http::{HttpChannel, HttpConnector};

/// Content type of a sealed WinRM body
pub(crate) const ENCRYPTED_CONTENT_TYPE: &str = "multipart/encrypted;protocol=\"application/HTTP-SPNEGO-session-encrypted\";boundary=\"Encrypted Boundary\"";

/// One outbound request on a channel.
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    /// Value of the `Authorization` header, if any
    pub authorization: Option<&'a str>,
    /// SOAP envelope; `None` sends an empty body
    pub body: Option<&'a str>,
    /// A framed `multipart/encrypted` body, sent instead of `body`
    pub sealed: Option<&'a [u8]>,
}

impl<'a> Exchange<'a> {
    pub fn anonymous(body: Option<&'a str>) -> Self {
        Self {
            authorization: None,
            body,
            sealed: None,
        }
    }

    pub fn authorized(authorization: &'a str, body: Option<&'a str>) -> Self {
        Self {
            authorization: Some(authorization),
            body,
            sealed: None,
        }
    }

    /// A sealed body riding on the connection's established security
    /// context; no `Authorization` header is sent.
    pub fn sealed(framed: &'a [u8]) -> Self {
        Self {
            authorization: None,
            body: None,
            sealed: Some(framed),
        }
    }
}

/// Reply to an [`Exchange`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    /// Every `WWW-Authenticate` header value, in order
    pub challenges: Vec<String>,
    /// Plain reply body; empty when the reply is sealed
    pub body: String,
    /// Framed `multipart/encrypted` reply body
    pub sealed: Option<Vec<u8>>,
    /// The server announced it will close the connection after this reply
    pub closes_connection: bool,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Token offered for `scheme` in a `WWW-Authenticate` challenge, e.g. the
    /// base64 blob after `Negotiate `. `Some("")` when the scheme is offered
    /// without a token.
    pub fn challenge_token(&self, scheme: &str) -> Option<&str> {
        self.challenges.iter().find_map(|c| {
            let c = c.trim();
            let (name, rest) = c.split_once(' ').unwrap_or((c, ""));
            name.eq_ignore_ascii_case(scheme).then(|| rest.trim())
        })
    }

    /// Whether the server offers `scheme` at all.
    pub fn offers(&self, scheme: &str) -> bool {
        self.challenge_token(scheme).is_some()
    }
}

/// A live connection to one WS-Management endpoint.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one request and wait for the complete reply.
    async fn exchange(&self, exchange: Exchange<'_>) -> Result<Reply, BridgeError>;

    /// Authentication schemes the endpoint advertised during the handshake.
    fn offered_challenges(&self) -> &[String];

    /// Whether the channel runs over TLS.
    fn is_encrypted(&self) -> bool;

    /// Release the channel's network resources. Idempotent.
    async fn shutdown(&self);
}

/// Opens channels to targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolve, connect and handshake with `target` within `timeout`.
    ///
    /// Fails with a transport error carrying the cause (DNS, refused,
    /// timeout, reset, protocol).
    async fn connect(
        &self,
        target: &Target,
        timeout: Duration,
    ) -> Result<Box<dyn Channel>, BridgeError>;
}
