//! HTTP Basic authentication.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use zeroize::Zeroizing;

use crate::bridge::error::BridgeError;
use crate::bridge::transport::{Channel, Exchange, Reply};
use crate::bridge::types::{AuthScheme, Credential};

use super::traits::AuthStrategy;

/// Basic authentication strategy.
///
/// Sends `principal:secret` on every request. Windows only accepts this for
/// local accounts, and only when the listener allows it.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicAuth;

impl BasicAuth {
    pub fn new() -> Self {
        Self
    }

    fn header(credential: &Credential) -> Zeroizing<String> {
        let pair = Zeroizing::new(format!(
            "{}:{}",
            credential.principal(),
            credential.expose_secret()
        ));
        Zeroizing::new(format!("Basic {}", BASE64.encode(pair.as_bytes())))
    }
}

#[async_trait]
impl AuthStrategy for BasicAuth {
    async fn send(
        &self,
        channel: &dyn Channel,
        credential: &Credential,
        body: &str,
    ) -> Result<Reply, BridgeError> {
        let header = Self::header(credential);
        channel
            .exchange(Exchange::authorized(&header, Some(body)))
            .await
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::Basic
    }
}
