//! Ways of opening a connection to the coordinator.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use fedsync_core::transport::{Channel, ClientChannel, TransportError};

/// Opens connections to the coordinator.
#[async_trait]
pub trait Connector: Send {
    async fn connect(&mut self) -> Result<ClientChannel, TransportError>;
}

/// Connects to a coordinator over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    max_frame_length: usize,
}

impl TcpConnector {
    /// Creates a connector for a `host:port` address.
    pub fn new(address: impl Into<String>, max_frame_length: usize) -> Self {
        Self {
            address: address.into(),
            max_frame_length,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&mut self) -> Result<ClientChannel, TransportError> {
        let stream = TcpStream::connect(self.address.as_str()).await?;
        stream.set_nodelay(true)?;
        debug!("connected to {}", self.address);
        Ok(Channel::tcp(stream, self.max_frame_length))
    }
}

/// Connects to a coordinator running in the same process.
///
/// The function hands out the client end of a fresh in-process connection, for example
/// `Sessions::connect_local` of the coordinator.
pub struct LocalConnector<F>(pub F);

#[async_trait]
impl<F> Connector for LocalConnector<F>
where
    F: FnMut() -> ClientChannel + Send,
{
    async fn connect(&mut self) -> Result<ClientChannel, TransportError> {
        Ok((self.0)())
    }
}
