//! HTTP(S) transport for WS-Management.
//!
//! ## Connection Lifecycle
//!
//! 1. **Resolution**: The target host is resolved up front so that DNS
//!    failures are reported as such rather than as generic connect errors.
//!
//! 2. **Client Configuration**: Each channel owns its own `reqwest::Client`
//!    with at most one idle connection, a connect timeout, TCP keepalive, and
//!    certificate validation per the target's flag.
//!
//! 3. **Handshake**: An unauthenticated POST to `/wsman`. A WinRM listener
//!    answers 401 with the schemes it accepts in `WWW-Authenticate`; those are
//!    recorded on the channel. A 404 means the peer is not a WS-Management
//!    endpoint.
//!
//! The whole sequence runs under the caller's connect timeout.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use tracing::{debug, warn};

use super::{Channel, Connector, ENCRYPTED_CONTENT_TYPE, Exchange, Reply};
use crate::bridge::error::{BridgeError, classify_error};
use crate::bridge::types::{Target, TransportCause};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// Build the HTTP client backing one channel.
pub(crate) fn build_http_client(
    target: &Target,
    connect_timeout: Duration,
) -> Result<reqwest::Client, BridgeError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(1)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .danger_accept_invalid_certs(target.uses_tls() && !target.validates_certs())
        .build()
        .map_err(|e| BridgeError::transport(TransportCause::Tls, format!("failed to build HTTP client: {}", e)))
}

async fn resolve(target: &Target) -> Result<(), BridgeError> {
    let mut addrs = tokio::net::lookup_host((target.host(), target.port()))
        .await
        .map_err(|e| {
            BridgeError::transport(
                TransportCause::Dns,
                format!("failed to resolve {}: {}", target.host(), e),
            )
        })?;
    if addrs.next().is_none() {
        return Err(BridgeError::transport(
            TransportCause::Dns,
            format!("{} resolved to no addresses", target.host()),
        ));
    }
    Ok(())
}

fn request_error(context: &str, err: reqwest::Error) -> BridgeError {
    let cause = if err.is_timeout() {
        TransportCause::Timeout
    } else {
        classify_error(&err)
    };
    match BridgeError::from_source(context, &err) {
        BridgeError::Transport { message, .. } => BridgeError::transport(cause, message),
        other => other,
    }
}

/// Connector producing [`HttpChannel`]s.
#[derive(Debug, Default, Clone)]
pub struct HttpConnector;

impl HttpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        target: &Target,
        timeout: Duration,
    ) -> Result<Box<dyn Channel>, BridgeError> {
        let handshake = async {
            resolve(target).await?;
            let client = build_http_client(target, timeout)?;
            let mut channel = HttpChannel::new(client, target.endpoint_url(), target.uses_tls());

            let reply = channel.exchange(Exchange::anonymous(None)).await?;
            if reply.status == 404 {
                return Err(BridgeError::transport(
                    TransportCause::Protocol,
                    format!("{} has no WS-Management endpoint (HTTP 404)", target),
                ));
            }
            channel.challenges = reply.challenges;
            Ok::<_, BridgeError>(channel)
        };

        let channel = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| {
                BridgeError::transport(
                    TransportCause::Timeout,
                    format!("connect to {} timed out after {:?}", target, timeout),
                )
            })??;

        debug!(
            host = %target.host(),
            port = target.port(),
            challenges = ?channel.challenges,
            "WinRM handshake complete"
        );
        Ok(Box::new(channel))
    }
}

/// Channel over one HTTP client.
pub struct HttpChannel {
    url: String,
    tls: bool,
    client: Mutex<Option<reqwest::Client>>,
    challenges: Vec<String>,
    open: AtomicBool,
}

impl HttpChannel {
    fn new(client: reqwest::Client, url: String, tls: bool) -> Self {
        Self {
            url,
            tls,
            client: Mutex::new(Some(client)),
            challenges: Vec::new(),
            open: AtomicBool::new(true),
        }
    }

    fn client(&self) -> Option<reqwest::Client> {
        match self.client.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Channel for HttpChannel {
    async fn exchange(&self, exchange: Exchange<'_>) -> Result<Reply, BridgeError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BridgeError::closed());
        }
        let client = self.client().ok_or_else(BridgeError::closed)?;

        let mut request = client.post(&self.url);
        if let Some(authorization) = exchange.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        request = match (exchange.sealed, exchange.body) {
            (Some(framed), _) => request
                .header(CONTENT_TYPE, ENCRYPTED_CONTENT_TYPE)
                .body(framed.to_vec()),
            (None, Some(body)) => request
                .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                .body(body.to_string()),
            (None, None) => request
                .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                .header(CONTENT_LENGTH, "0"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| request_error("WinRM request failed", e))?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let challenges = headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let closes_connection = headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("close"));
        let encrypted = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/encrypted"));
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error("failed to read WinRM reply", e))?;

        let (body, sealed) = if encrypted {
            (String::new(), Some(bytes.to_vec()))
        } else {
            (String::from_utf8_lossy(&bytes).into_owned(), None)
        };
        Ok(Reply {
            status,
            challenges,
            body,
            sealed,
            closes_connection,
        })
    }

    fn offered_challenges(&self) -> &[String] {
        &self.challenges
    }

    fn is_encrypted(&self) -> bool {
        self.tls
    }

    async fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            match self.client.lock() {
                Ok(mut guard) => {
                    guard.take();
                }
                Err(poisoned) => {
                    warn!("HTTP channel lock poisoned during shutdown");
                    poisoned.into_inner().take();
                }
            }
        }
    }
}
