use serde::{Deserialize, Serialize};
use std::fmt;

/// Position on the ring, always below 2^m for the ring's width.
pub type NodeId = u64;

/// Non-owning reference to a node: where it sits on the ring and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DhtMessage {
    // Message to find the successor of a given ID
    FindSuccessor {
        id: NodeId,
    },
    // Response to FindSuccessor and GetSuccessor
    FoundSuccessor {
        node: NodeInfo,
    },
    // Request for a node's immediate successor
    GetSuccessor,
    // Request for a node's successor list
    GetSuccessorList,
    SuccessorList {
        nodes: Vec<NodeInfo>,
    },
    // Request for the closest preceding node
    ClosestPrecedingNode {
        id: NodeId,
    },
    FoundClosestPrecedingNode {
        node: NodeInfo,
    },
    // Request for a node's predecessor
    GetPredecessor,
    Predecessor {
        node: Option<NodeInfo>,
    },
    // Notify a node that we believe we are its predecessor
    Notify {
        node: NodeInfo,
    },
    Ping,
    Pong,
    // Store a key-value pair at its owner
    Store {
        key: NodeId,
        value: Vec<u8>,
    },
    Fetch {
        key: NodeId,
    },
    Fetched {
        key: NodeId,
        value: Option<Vec<u8>>,
    },
    Remove {
        key: NodeId,
    },
    Removed {
        key: NodeId,
        existed: bool,
    },
    // A joining node claims everything its successor holds outside (node, successor]
    ClaimRange {
        node: NodeInfo,
    },
    DataRange {
        data: Vec<(NodeId, Vec<u8>)>,
    },
    // Entries pushed to their new owner
    Handoff {
        data: Vec<(NodeId, Vec<u8>)>,
    },
    // Sent to the predecessor of a departing node
    SuccessorLeaving {
        leaving: NodeInfo,
        successor: NodeInfo,
    },
    // Sent to the successor of a departing node
    PredecessorLeaving {
        leaving: NodeInfo,
    },
    Ack,
    Error {
        message: String,
    },
}
