use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{Credentials, PortRange, StreamRequest, StreamResponse, WirePolicy};

#[cfg(test)]
pub mod mock;
pub mod tcp;

pub use tcp::TcpConnector;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("coordinator rejected call: {0}")]
    Rejected(String),
    #[error("connection closed")]
    Closed,
}

/// Establishes connections to a coordinator.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `address`.  The credentials are attached to every call
    /// made on the returned channel.
    async fn connect(
        &self,
        address: &str,
        credentials: Credentials,
    ) -> Result<Arc<dyn Channel>, TransportError>;
}

/// One logical connection to the coordinator.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Opens the persistent bidirectional stream.
    async fn open_stream(
        &self,
    ) -> Result<(Box<dyn StreamSender>, Box<dyn StreamReceiver>), TransportError>;

    async fn set_port_range(&self, range: &PortRange) -> Result<(), TransportError>;

    /// Replaces the policy set.  Returns the per-policy validation errors
    /// reported by the coordinator.
    async fn set_policies(&self, policies: &[WirePolicy]) -> Result<Vec<String>, TransportError>;

    /// Releases the connection.  Calls made afterwards fail with
    /// [`TransportError::Closed`].
    async fn close(&self);
}

#[async_trait]
pub trait StreamSender: Send {
    async fn send(&mut self, request: StreamRequest) -> Result<(), TransportError>;

    /// Half-closes the stream.
    async fn close_send(&mut self);
}

#[async_trait]
pub trait StreamReceiver: Send {
    /// Next inbound message; `Ok(None)` once the coordinator ends the stream.
    async fn recv(&mut self) -> Result<Option<StreamResponse>, TransportError>;
}
