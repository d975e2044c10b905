use async_trait::async_trait;
use chordkv_lib::dht_messages::DhtMessage;
use chordkv_node::NetworkClient;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Request ID for correlating requests and responses
pub type RequestId = u64;

/// Routes DHT messages between nodes in the test environment without actual
/// TCP connections.
#[derive(Clone)]
pub struct NetworkSimulator {
    /// Maps node addresses to message channels
    nodes: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<SimulatorMessage>>>>,
    /// Controls message delivery timing and failures
    delivery_controller: Arc<RwLock<DeliveryController>>,
    next_request_id: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

/// Message delivered to a simulated node
#[derive(Debug)]
pub enum SimulatorMessage {
    Request {
        from: String,
        message: DhtMessage,
        request_id: RequestId,
        response_sender: oneshot::Sender<DhtMessage>,
    },
}

struct DeliveryController {
    /// Addresses that should fail message delivery
    failed_nodes: HashSet<String>,
    /// Simulated one-way latency
    latency: Duration,
    /// How long a caller waits for a reply before giving up
    timeout: Duration,
}

impl Default for DeliveryController {
    fn default() -> Self {
        Self {
            failed_nodes: HashSet::new(),
            latency: Duration::ZERO,
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            delivery_controller: Arc::new(RwLock::new(DeliveryController::default())),
            next_request_id: Arc::new(AtomicU64::new(1)),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a node with the simulator
    pub async fn register_node(
        &self,
        address: String,
        sender: mpsc::UnboundedSender<SimulatorMessage>,
    ) {
        self.nodes.write().await.insert(address, sender);
    }

    /// Remove a node from the simulator
    pub async fn unregister_node(&self, address: &str) {
        self.nodes.write().await.remove(address);
    }

    /// Mark a node as failed (messages will not be delivered)
    pub async fn mark_node_failed(&self, address: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_nodes
            .insert(address.to_string());
    }

    pub async fn mark_node_recovered(&self, address: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_nodes
            .remove(address);
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.delivery_controller.write().await.latency = latency;
    }

    pub async fn set_timeout(&self, timeout: Duration) {
        self.delivery_controller.write().await.timeout = timeout;
    }

    pub async fn is_node_registered(&self, address: &str) -> bool {
        self.nodes.read().await.contains_key(address)
    }

    /// Number of requests handed to a node so far
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Create a NetworkClient for a specific node
    pub fn create_client(&self, from_address: String) -> SimulatedNetworkClient {
        SimulatedNetworkClient {
            simulator: self.clone(),
            from_address,
        }
    }
}

/// NetworkClient implementation that uses the simulator for message delivery
#[derive(Clone)]
pub struct SimulatedNetworkClient {
    simulator: NetworkSimulator,
    from_address: String,
}

#[async_trait]
impl NetworkClient for SimulatedNetworkClient {
    async fn call_node(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, Box<dyn std::error::Error + Send + Sync>> {
        let (latency, timeout_duration) = {
            let controller = self.simulator.delivery_controller.read().await;
            if controller.failed_nodes.contains(address)
                || controller.failed_nodes.contains(&self.from_address)
            {
                return Err(format!("Node {} is unreachable", address).into());
            }
            (controller.latency, controller.timeout)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let sender = self
            .simulator
            .nodes
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| format!("Node {} not registered", address))?;

        let request_id = self
            .simulator
            .next_request_id
            .fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();

        sender
            .send(SimulatorMessage::Request {
                from: self.from_address.clone(),
                message,
                request_id,
                response_sender: response_tx,
            })
            .map_err(|_| "Failed to send message to node")?;
        self.simulator.delivered.fetch_add(1, Ordering::SeqCst);

        match tokio::time::timeout(timeout_duration, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err("Response channel closed".into()),
            Err(_) => Err(format!("Request {} timed out", request_id).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reaches_registered_node() {
        let simulator = NetworkSimulator::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        simulator.register_node("127.0.0.1:8001".to_string(), tx).await;

        tokio::spawn(async move {
            while let Some(SimulatorMessage::Request {
                message,
                response_sender,
                ..
            }) = rx.recv().await
            {
                assert_eq!(message, DhtMessage::Ping);
                let _ = response_sender.send(DhtMessage::Pong);
            }
        });

        let client = simulator.create_client("127.0.0.1:8000".to_string());
        let response = client.call_node("127.0.0.1:8001", DhtMessage::Ping).await;
        assert_eq!(response.unwrap(), DhtMessage::Pong);
        assert_eq!(simulator.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_and_unknown_nodes_are_unreachable() {
        let simulator = NetworkSimulator::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        simulator.register_node("127.0.0.1:8001".to_string(), tx).await;
        simulator.mark_node_failed("127.0.0.1:8001").await;

        let client = simulator.create_client("127.0.0.1:8000".to_string());
        assert!(client.call_node("127.0.0.1:8001", DhtMessage::Ping).await.is_err());
        assert!(client.call_node("127.0.0.1:8002", DhtMessage::Ping).await.is_err());
        assert_eq!(simulator.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_recovered_node_answers_after_latency() {
        let simulator = NetworkSimulator::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        simulator.register_node("127.0.0.1:8001".to_string(), tx).await;
        assert!(simulator.is_node_registered("127.0.0.1:8001").await);

        tokio::spawn(async move {
            while let Some(SimulatorMessage::Request {
                response_sender, ..
            }) = rx.recv().await
            {
                let _ = response_sender.send(DhtMessage::Pong);
            }
        });

        let client = simulator.create_client("127.0.0.1:8000".to_string());
        simulator.mark_node_failed("127.0.0.1:8001").await;
        assert!(client.call_node("127.0.0.1:8001", DhtMessage::Ping).await.is_err());

        simulator.mark_node_recovered("127.0.0.1:8001").await;
        simulator.set_latency(Duration::from_millis(20)).await;
        let started = tokio::time::Instant::now();
        let response = client.call_node("127.0.0.1:8001", DhtMessage::Ping).await;
        assert_eq!(response.unwrap(), DhtMessage::Pong);
        assert!(started.elapsed() >= Duration::from_millis(20));

        simulator.unregister_node("127.0.0.1:8001").await;
        assert!(!simulator.is_node_registered("127.0.0.1:8001").await);
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        let simulator = NetworkSimulator::new();
        simulator.set_timeout(Duration::from_millis(50)).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        simulator.register_node("127.0.0.1:8001".to_string(), tx).await;

        let client = simulator.create_client("127.0.0.1:8000".to_string());
        assert!(client.call_node("127.0.0.1:8001", DhtMessage::Ping).await.is_err());
    }
}
