use async_trait::async_trait;
use chordkv_lib::dht_messages::DhtMessage;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Request/response transport between nodes.
///
/// Any error, including a timeout, means the peer is treated as unreachable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync + 'static {
    async fn call_node(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, Box<dyn std::error::Error + Send + Sync>>;
}

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// One TCP connection per call: write the bincode request, shut down the
/// write half, read the response to EOF.
#[derive(Debug, Clone)]
pub struct RealNetworkClient {
    rpc_timeout: Duration,
}

impl Default for RealNetworkClient {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

impl RealNetworkClient {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }

    async fn exchange(
        address: &str,
        message: &DhtMessage,
    ) -> Result<DhtMessage, Box<dyn std::error::Error + Send + Sync>> {
        let mut stream = TcpStream::connect(address).await?;
        let encoded = bincode::serialize(message)?;
        debug!("Sending message to {}: {:?}", address, message);
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        let response = bincode::deserialize(&buffer)?;
        debug!("Received response from {}: {:?}", address, response);
        Ok(response)
    }
}

#[async_trait]
impl NetworkClient for RealNetworkClient {
    async fn call_node(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, Box<dyn std::error::Error + Send + Sync>> {
        match timeout(self.rpc_timeout, Self::exchange(address, &message)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "call to {} timed out after {:?}",
                address, self.rpc_timeout
            )
            .into()),
        }
    }
}
