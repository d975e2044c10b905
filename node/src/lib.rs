//! chordkv DHT node library
//!
//! Ring membership, finger-table routing and the per-node key-value store of a
//! Chord overlay. The binary in `main.rs` is a thin front end over this crate;
//! integration tests drive the same `ChordNode` through a simulated network.

macro_rules! log_info {
    ($address:expr, $($arg:tt)*) => ({
        log::info!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($address:expr, $($arg:tt)*) => ({
        log::warn!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($address:expr, $($arg:tt)*) => ({
        log::error!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_debug {
    ($address:expr, $($arg:tt)*) => ({
        log::debug!("[{}] {}", $address, format_args!($($arg)*));
    })
}

pub mod api;
pub mod error;
pub mod finger_table;
pub mod kv;
pub mod maintenance;
pub mod network_client;
pub mod node;
pub mod routing;
pub mod store;


use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use error::ChordError;
pub use finger_table::{Finger, FingerTable};
pub use maintenance::MaintenanceSchedule;
pub use network_client::{NetworkClient, RealNetworkClient};
pub use node::{ChordNode, MembershipState, RingSnapshot};
pub use store::KeyValueStore;

// Re-export from lib crate for convenience
pub use chordkv_lib::dht_messages::{DhtMessage, NodeId, NodeInfo};
pub use chordkv_lib::IdentifierSpace;

pub const DEFAULT_SUCCESSOR_LIST_LEN: usize = 3;
pub const DEFAULT_LEAVE_DEADLINE: Duration = Duration::from_secs(3);

/// Configuration for a ChordNode
#[derive(Debug, Clone)]
pub struct Config {
    /// Address other nodes use to reach this one; also hashed into the node id.
    pub p2p_address: String,
    /// Local listen address, defaults to `p2p_address`.
    pub bind_address: Option<String>,
    /// Optional HTTP status API.
    pub api_address: Option<String>,
    /// Overrides the hashed id. Mostly useful for deterministic tests.
    pub node_id: Option<NodeId>,
    pub ring_bits: u32,
    pub successor_list_len: usize,
    pub rpc_timeout: Duration,
    pub schedule: MaintenanceSchedule,
    pub leave_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_address: "127.0.0.1:8000".to_string(),
            bind_address: None,
            api_address: None,
            node_id: None,
            ring_bits: chordkv_lib::DEFAULT_RING_BITS,
            successor_list_len: DEFAULT_SUCCESSOR_LIST_LEN,
            rpc_timeout: network_client::DEFAULT_RPC_TIMEOUT,
            schedule: MaintenanceSchedule::default(),
            leave_deadline: DEFAULT_LEAVE_DEADLINE,
        }
    }
}

fn env_var<V: FromStr>(name: &str) -> Result<Option<V>, ChordError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ChordError::InvalidConfig(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, ChordError> {
    Ok(env_var::<u64>(name)?.map(Duration::from_millis))
}

impl Config {
    /// Reads `CHORD_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ChordError> {
        let mut config = Config::default();
        if let Some(address) = env_var("CHORD_NODE_ADDRESS")? {
            config.p2p_address = address;
        }
        config.bind_address = env_var("CHORD_BIND_ADDRESS")?;
        config.api_address = env_var("CHORD_API_ADDRESS")?;
        config.node_id = env_var("CHORD_NODE_ID")?;
        if let Some(bits) = env_var("CHORD_RING_BITS")? {
            config.ring_bits = bits;
        }
        if let Some(len) = env_var("CHORD_SUCCESSOR_LIST_LEN")? {
            config.successor_list_len = len;
        }
        if let Some(timeout) = env_millis("CHORD_RPC_TIMEOUT_MS")? {
            config.rpc_timeout = timeout;
        }
        if let Some(interval) = env_millis("CHORD_STABILIZE_INTERVAL_MS")? {
            config.schedule.stabilize_interval = interval;
        }
        if let Some(interval) = env_millis("CHORD_FIX_FINGERS_INTERVAL_MS")? {
            config.schedule.fix_fingers_interval = interval;
        }
        if let Some(interval) = env_millis("CHORD_CHECK_PREDECESSOR_INTERVAL_MS")? {
            config.schedule.check_predecessor_interval = interval;
        }
        if let Some(budget) = env_millis("CHORD_TASK_TIMEOUT_MS")? {
            config.schedule.task_timeout = budget;
        }
        if let Some(deadline) = env_millis("CHORD_LEAVE_DEADLINE_MS")? {
            config.leave_deadline = deadline;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChordError> {
        let space = self.space()?;
        if let Some(id) = self.node_id {
            if !space.contains(id) {
                return Err(ChordError::InvalidConfig(format!(
                    "node id {} does not fit a {}-bit ring",
                    id, self.ring_bits
                )));
            }
        }
        if self.successor_list_len == 0 {
            return Err(ChordError::InvalidConfig(
                "successor list length must be at least 1".to_string(),
            ));
        }
        if self.schedule.has_zero_interval() {
            return Err(ChordError::InvalidConfig(
                "maintenance intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn space(&self) -> Result<IdentifierSpace, ChordError> {
        IdentifierSpace::new(self.ring_bits).map_err(|e| ChordError::InvalidConfig(e.to_string()))
    }

    pub fn bind_address(&self) -> &str {
        self.bind_address.as_deref().unwrap_or(&self.p2p_address)
    }
}

impl<T: NetworkClient> ChordNode<T> {
    /// Create a ChordNode from config with the given network client
    pub fn from_config(config: &Config, network_client: Arc<T>) -> Result<Self, ChordError> {
        config.validate()?;
        let space = config.space()?;
        let address = config.p2p_address.clone();
        let node = match config.node_id {
            Some(id) => ChordNode::with_id(NodeInfo::new(id, address), space, network_client),
            None => ChordNode::new(address, space, network_client),
        };
        Ok(node
            .with_successor_list_len(config.successor_list_len)
            .with_request_timeout(config.rpc_timeout))
    }
}
