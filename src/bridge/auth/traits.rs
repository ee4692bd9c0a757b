//! Authentication strategy trait definition.
//!
//! Defines the interface for HTTP authentication schemes, enabling the
//! Strategy pattern for WinRM authentication.

use async_trait::async_trait;

use crate::bridge::error::BridgeError;
use crate::bridge::transport::{Channel, Reply};
use crate::bridge::types::{AuthScheme, Credential};

/// Trait for WinRM authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks. Authentication is per request: a session keeps its
/// strategy and routes every SOAP request through [`AuthStrategy::send`].
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Send `body` on `channel`, authenticated as `credential`.
    ///
    /// # Returns
    ///
    /// * `Ok(reply)` with status 401 - credentials rejected by the server
    /// * `Ok(reply)` otherwise - the server's answer to `body`
    /// * `Err(error)` - transport failure or malformed handshake
    async fn send(
        &self,
        channel: &dyn Channel,
        credential: &Credential,
        body: &str,
    ) -> Result<Reply, BridgeError>;

    /// The scheme this strategy implements.
    fn scheme(&self) -> AuthScheme;
}
