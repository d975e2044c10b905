use chordkv_lib::dht_messages::{DhtMessage, NodeId, NodeInfo};
use chordkv_lib::{is_strictly_between, IdentifierSpace};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::ChordError;
use crate::finger_table::{Finger, FingerTable};
use crate::network_client::{NetworkClient, DEFAULT_RPC_TIMEOUT};
use crate::store::KeyValueStore;
use crate::DEFAULT_SUCCESSOR_LIST_LEN;

/// Largest request an inbound connection may send.
pub const MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MembershipState {
    Uninitialized,
    Joining,
    Stable,
    Leaving,
}

/// Everything about the ring that a node mutates. Guarded by one mutex so
/// inbound handlers and periodic tasks never interleave partial updates.
#[derive(Debug)]
pub struct RingState {
    pub membership: MembershipState,
    pub successor: NodeInfo,
    pub successor_list: Vec<NodeInfo>,
    pub predecessor: Option<NodeInfo>,
    pub finger_table: FingerTable,
    pub store: KeyValueStore,
    owner: NodeInfo,
}

impl RingState {
    fn new(owner: &NodeInfo, space: IdentifierSpace) -> Self {
        RingState {
            membership: MembershipState::Uninitialized,
            successor: owner.clone(),
            successor_list: Vec::new(),
            predecessor: None,
            finger_table: FingerTable::new(owner, space),
            store: KeyValueStore::new(),
            owner: owner.clone(),
        }
    }

    /// The successor is also finger 0.
    pub fn set_successor(&mut self, node: NodeInfo) {
        if node.id == self.owner.id {
            self.successor_list.clear();
        } else {
            self.successor_list.retain(|n| n.id != node.id);
            self.successor_list.insert(0, node.clone());
        }
        self.finger_table.set(0, node.clone());
        self.successor = node;
    }

    /// Drops every reference to a peer that stopped answering and, if it was
    /// the successor, promotes the next known node.
    pub fn forget(&mut self, failed: NodeId) -> bool {
        self.finger_table.evict(failed);
        self.successor_list.retain(|n| n.id != failed);
        if self.successor.id != failed {
            return false;
        }
        let owner = self.owner.id;
        let next = self
            .successor_list
            .first()
            .cloned()
            .or_else(|| {
                self.finger_table
                    .entries()
                    .iter()
                    .map(|f| f.node.clone())
                    .find(|n| n.id != owner)
            })
            .unwrap_or_else(|| self.owner.clone());
        self.set_successor(next);
        true
    }
}

/// Serializable view of a node's routing state.
#[derive(Debug, Clone, Serialize)]
pub struct RingSnapshot {
    pub id: NodeId,
    pub address: String,
    pub state: MembershipState,
    pub successor: NodeInfo,
    pub predecessor: Option<NodeInfo>,
    pub successor_list: Vec<NodeInfo>,
    pub fingers: Vec<Finger>,
    pub key_count: usize,
}

#[derive(Debug)]
pub struct ChordNode<T: NetworkClient> {
    pub info: NodeInfo,
    pub(crate) space: IdentifierSpace,
    pub(crate) successor_list_len: usize,
    /// How long an inbound connection may take to deliver its request.
    pub(crate) request_timeout: Duration,
    pub(crate) state: Arc<Mutex<RingState>>,
    pub(crate) network_client: Arc<T>,
}

impl<T: NetworkClient> Clone for ChordNode<T> {
    fn clone(&self) -> Self {
        ChordNode {
            info: self.info.clone(),
            space: self.space,
            successor_list_len: self.successor_list_len,
            request_timeout: self.request_timeout,
            state: self.state.clone(), // This clones the Arc, not the state
            network_client: self.network_client.clone(),
        }
    }
}

impl<T: NetworkClient> ChordNode<T> {
    /// Node whose id is the hash of its address.
    pub fn new(address: String, space: IdentifierSpace, network_client: Arc<T>) -> Self {
        let id = space.hash(address.as_bytes());
        Self::with_id(NodeInfo::new(id, address), space, network_client)
    }

    pub fn with_id(info: NodeInfo, space: IdentifierSpace, network_client: Arc<T>) -> Self {
        let state = RingState::new(&info, space);
        ChordNode {
            info,
            space,
            successor_list_len: DEFAULT_SUCCESSOR_LIST_LEN,
            request_timeout: DEFAULT_RPC_TIMEOUT,
            state: Arc::new(Mutex::new(state)),
            network_client,
        }
    }

    pub fn with_successor_list_len(mut self, len: usize) -> Self {
        self.successor_list_len = len.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Single exclusive-access path to the ring state. Never hold the guard
    /// across an `.await`.
    pub(crate) fn state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn space(&self) -> IdentifierSpace {
        self.space
    }

    pub fn membership(&self) -> MembershipState {
        self.state().membership
    }

    pub fn successor(&self) -> NodeInfo {
        self.state().successor.clone()
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.state().predecessor.clone()
    }

    pub fn successor_list(&self) -> Vec<NodeInfo> {
        self.state().successor_list.clone()
    }

    pub fn fingers(&self) -> Vec<Finger> {
        self.state().finger_table.entries().to_vec()
    }

    pub fn local_keys(&self) -> Vec<NodeId> {
        self.state().store.keys()
    }

    pub fn ring_snapshot(&self) -> RingSnapshot {
        let state = self.state();
        RingSnapshot {
            id: self.info.id,
            address: self.info.address.clone(),
            state: state.membership,
            successor: state.successor.clone(),
            predecessor: state.predecessor.clone(),
            successor_list: state.successor_list.clone(),
            fingers: state.finger_table.entries().to_vec(),
            key_count: state.store.len(),
        }
    }

    /// Sends one request and maps transport failures to `PeerUnreachable` and
    /// remote `Error` replies to `UnexpectedResponse`.
    pub(crate) async fn call(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, ChordError> {
        match self.network_client.call_node(address, message).await {
            Ok(DhtMessage::Error { message }) => Err(ChordError::unexpected(address, message)),
            Ok(response) => Ok(response),
            Err(e) => Err(ChordError::unreachable(address, e)),
        }
    }

    pub(crate) fn forget_peer(&self, failed: &NodeInfo) {
        let promoted = {
            let mut state = self.state();
            if state.forget(failed.id) {
                Some(state.successor.clone())
            } else {
                None
            }
        };
        if let Some(successor) = promoted {
            log_warn!(
                self.info.address,
                "Successor {} unreachable, falling back to {}",
                failed,
                successor
            );
        }
    }

    /// Starts a new ring with this node as its only member.
    pub fn create(&self) {
        let mut state = self.state();
        state.set_successor(self.info.clone());
        state.predecessor = None;
        state.finger_table.reset();
        state.membership = MembershipState::Stable;
        log_info!(
            self.info.address,
            "Started new ring as node {}. I am the only node.",
            self.info.id
        );
    }

    /// Joins the ring known to `bootstrap_address` and takes over the keys
    /// that now fall into (predecessor, self].
    pub async fn join(&self, bootstrap_address: &str) -> Result<(), ChordError> {
        log_info!(
            self.info.address,
            "Attempting to join ring via bootstrap node: {}",
            bootstrap_address
        );
        self.state().membership = MembershipState::Joining;

        let response = self
            .network_client
            .call_node(bootstrap_address, DhtMessage::FindSuccessor { id: self.info.id })
            .await;
        let successor = match response {
            Ok(DhtMessage::FoundSuccessor { node }) => node,
            Ok(other) => {
                self.state().membership = MembershipState::Uninitialized;
                log_error!(
                    self.info.address,
                    "Unexpected response from bootstrap node: {:?}",
                    other
                );
                return Err(ChordError::unexpected(bootstrap_address, other));
            }
            Err(e) => {
                self.state().membership = MembershipState::Uninitialized;
                log_error!(
                    self.info.address,
                    "Failed to get successor from bootstrap node: {}",
                    e
                );
                return Err(ChordError::BootstrapUnreachable {
                    address: bootstrap_address.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        {
            let mut state = self.state();
            state.finger_table.reset();
            state.set_successor(successor.clone());
            state.predecessor = None;
            state.membership = MembershipState::Stable;
        }
        log_info!(self.info.address, "Joined ring. Successor: {}", successor);

        if successor.id != self.info.id {
            if let Err(e) = self.claim_range(&successor).await {
                log_error!(
                    self.info.address,
                    "Failed to take over keys from successor {}: {}",
                    successor,
                    e
                );
            }
        }
        Ok(())
    }

    async fn claim_range(&self, successor: &NodeInfo) -> Result<(), ChordError> {
        match self
            .call(
                &successor.address,
                DhtMessage::ClaimRange {
                    node: self.info.clone(),
                },
            )
            .await?
        {
            DhtMessage::DataRange { data } => {
                if !data.is_empty() {
                    log_info!(
                        self.info.address,
                        "Received {} keys from successor {}",
                        data.len(),
                        successor
                    );
                    self.state().store.extend(data);
                }
                Ok(())
            }
            other => Err(ChordError::unexpected(&successor.address, other)),
        }
    }

    /// Asks the successor for its predecessor, adopts it if it sits between
    /// us, then tells the successor about us.
    pub async fn stabilize(&self) -> Result<(), ChordError> {
        if self.membership() != MembershipState::Stable {
            return Ok(());
        }
        let successor = self.successor();
        log_debug!(
            self.info.address,
            "Stabilize: current successor is {}",
            successor
        );

        // Alone on the ring: our own predecessor is the only candidate.
        let candidate = if successor.id == self.info.id {
            self.predecessor()
        } else {
            match self.call(&successor.address, DhtMessage::GetPredecessor).await {
                Ok(DhtMessage::Predecessor { node }) => node,
                Ok(other) => return Err(ChordError::unexpected(&successor.address, other)),
                Err(e) => {
                    self.forget_peer(&successor);
                    return Err(e);
                }
            }
        };

        if let Some(x) = candidate {
            if is_strictly_between(x.id, self.info.id, successor.id) {
                let mut state = self.state();
                // Only replace the successor we actually asked about.
                if state.successor.id == successor.id {
                    state.set_successor(x.clone());
                    log_info!(
                        self.info.address,
                        "Stabilize: successor changed from {} to {}",
                        successor,
                        x
                    );
                }
            }
        }

        let successor = self.successor();
        if successor.id == self.info.id {
            return Ok(());
        }

        if let Err(e) = self
            .call(
                &successor.address,
                DhtMessage::Notify {
                    node: self.info.clone(),
                },
            )
            .await
        {
            log_warn!(self.info.address, "Error notifying successor: {}", e);
            if e.is_unreachable() {
                self.forget_peer(&successor);
            }
            return Err(e);
        }

        match self
            .call(&successor.address, DhtMessage::GetSuccessorList)
            .await
        {
            Ok(DhtMessage::SuccessorList { nodes }) => {
                self.refresh_successor_list(&successor, nodes)
            }
            Ok(other) => log_debug!(
                self.info.address,
                "Unexpected successor list reply: {:?}",
                other
            ),
            Err(e) => log_debug!(self.info.address, "Failed to get successor list: {}", e),
        }
        Ok(())
    }

    fn refresh_successor_list(&self, successor: &NodeInfo, nodes: Vec<NodeInfo>) {
        let mut state = self.state();
        if state.successor.id != successor.id {
            return;
        }
        let mut list = vec![successor.clone()];
        for node in nodes {
            if list.len() >= self.successor_list_len {
                break;
            }
            if node.id != self.info.id && !list.iter().any(|n| n.id == node.id) {
                list.push(node);
            }
        }
        state.successor_list = list;
    }

    /// `candidate` thinks it might be our predecessor. Accepts it if we have
    /// none or it is closer than the current one, and hands it the keys that
    /// now belong to it.
    pub async fn notify(&self, candidate: NodeInfo) {
        if candidate.id == self.info.id {
            return;
        }
        let (previous, moving) = {
            let mut state = self.state();
            let accept = match &state.predecessor {
                None => true,
                Some(current) => is_strictly_between(candidate.id, current.id, self.info.id),
            };
            if !accept {
                log_debug!(
                    self.info.address,
                    "Notify: keeping current predecessor over {}",
                    candidate
                );
                return;
            }
            let previous = state.predecessor.replace(candidate.clone());
            let moving = state.store.take_outside(candidate.id, self.info.id);
            (previous, moving)
        };

        log_info!(
            self.info.address,
            "Notify: predecessor changed from {:?} to {}",
            previous.map(|p| p.to_string()),
            candidate
        );

        if !moving.is_empty() {
            if let Err(e) = self.hand_off(&candidate, moving).await {
                log_error!(self.info.address, "{}", e);
            }
        }
    }

    /// Pushes entries to their new owner. On failure they are kept locally so
    /// nothing is dropped.
    pub(crate) async fn hand_off(
        &self,
        target: &NodeInfo,
        data: Vec<(NodeId, Vec<u8>)>,
    ) -> Result<(), ChordError> {
        let count = data.len();
        let result = self
            .call(&target.address, DhtMessage::Handoff { data: data.clone() })
            .await;
        match result {
            Ok(DhtMessage::Ack) => {
                log_info!(self.info.address, "Transferred {} keys to {}", count, target);
                Ok(())
            }
            Ok(other) => {
                self.state().store.extend(data);
                Err(ChordError::HandoffIncomplete {
                    address: target.address.clone(),
                    reason: format!("unexpected reply {:?}", other),
                })
            }
            Err(e) => {
                self.state().store.extend(data);
                Err(ChordError::HandoffIncomplete {
                    address: target.address.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Refreshes the next finger in turn.
    pub async fn fix_fingers(&self) -> Result<(), ChordError> {
        if self.membership() != MembershipState::Stable {
            return Ok(());
        }
        let next = self.state().finger_table.next_to_fix();
        let Some((index, start)) = next else {
            return Ok(());
        };
        let node = self.find_successor(start).await?;
        if self.state().finger_table.set(index, node.clone()) {
            log_debug!(
                self.info.address,
                "Finger {} (start {}) now points to {}",
                index,
                start,
                node
            );
        }
        Ok(())
    }

    /// Runs `fix_fingers` once per entry.
    pub async fn fix_all_fingers(&self) -> Result<(), ChordError> {
        for _ in 0..self.space.bits() {
            self.fix_fingers().await?;
        }
        Ok(())
    }

    /// Clears the predecessor if it no longer answers a ping.
    pub async fn check_predecessor(&self) -> Result<(), ChordError> {
        let predecessor = self.predecessor();
        let Some(predecessor) = predecessor else {
            return Ok(());
        };
        match self.call(&predecessor.address, DhtMessage::Ping).await {
            Ok(DhtMessage::Pong) => Ok(()),
            result => {
                {
                    let mut state = self.state();
                    if state.predecessor.as_ref().map(|p| p.id) == Some(predecessor.id) {
                        state.predecessor = None;
                    }
                    state.finger_table.evict(predecessor.id);
                    state.successor_list.retain(|n| n.id != predecessor.id);
                }
                log_warn!(
                    self.info.address,
                    "Predecessor {} is dead. Cleared.",
                    predecessor
                );
                match result {
                    Err(e) => Err(e),
                    Ok(other) => Err(ChordError::unexpected(&predecessor.address, other)),
                }
            }
        }
    }

    /// Best-effort departure: hand every key to the successor and ask both
    /// neighbours to link around us. The node should go silent afterwards.
    pub async fn leave(&self) -> Result<(), ChordError> {
        let (predecessor, successor, data) = {
            let mut state = self.state();
            if state.membership != MembershipState::Stable {
                return Err(ChordError::NotJoined);
            }
            state.membership = MembershipState::Leaving;
            (
                state.predecessor.clone(),
                state.successor.clone(),
                state.store.drain(),
            )
        };

        if successor.id == self.info.id {
            if !data.is_empty() {
                log_warn!(
                    self.info.address,
                    "Last node leaving the ring, dropping {} keys",
                    data.len()
                );
            }
            return Ok(());
        }

        log_info!(
            self.info.address,
            "Leaving ring, handing {} keys to {}",
            data.len(),
            successor
        );

        let mut outcome = Ok(());
        if !data.is_empty() {
            if let Err(e) = self.hand_off(&successor, data).await {
                log_error!(self.info.address, "{}", e);
                outcome = Err(e);
            }
        }

        if let Some(predecessor) = predecessor {
            if predecessor.id != self.info.id {
                let message = DhtMessage::SuccessorLeaving {
                    leaving: self.info.clone(),
                    successor: successor.clone(),
                };
                if let Err(e) = self.call(&predecessor.address, message).await {
                    log_warn!(self.info.address, "Failed to tell predecessor we are leaving: {}", e);
                }
            }
        }

        let message = DhtMessage::PredecessorLeaving {
            leaving: self.info.clone(),
        };
        if let Err(e) = self.call(&successor.address, message).await {
            log_warn!(self.info.address, "Failed to tell successor we are leaving: {}", e);
        }
        outcome
    }

    fn successor_leaving(&self, leaving: NodeInfo, successor: NodeInfo) {
        let mut state = self.state();
        state.finger_table.evict(leaving.id);
        state.successor_list.retain(|n| n.id != leaving.id);
        if state.successor.id == leaving.id {
            let next = if successor.id == leaving.id {
                self.info.clone()
            } else {
                successor
            };
            log_info!(
                self.info.address,
                "Successor {} is leaving, linking to {}",
                leaving,
                next
            );
            state.set_successor(next);
        }
    }

    fn predecessor_leaving(&self, leaving: NodeInfo) {
        let mut state = self.state();
        state.finger_table.evict(leaving.id);
        state.successor_list.retain(|n| n.id != leaving.id);
        if state.predecessor.as_ref().map(|p| p.id) == Some(leaving.id) {
            // The next notify from the new predecessor fills this in.
            state.predecessor = None;
            log_info!(self.info.address, "Predecessor {} left", leaving);
        }
    }

    /// Answers one inbound RPC.
    pub async fn handle_message(&self, message: DhtMessage) -> DhtMessage {
        let touches_data = matches!(
            message,
            DhtMessage::Store { .. }
                | DhtMessage::Fetch { .. }
                | DhtMessage::Remove { .. }
                | DhtMessage::ClaimRange { .. }
                | DhtMessage::Handoff { .. }
        );
        // The store was drained when leave started; anything written now
        // would be stranded on a node that is about to go silent.
        if touches_data && self.membership() == MembershipState::Leaving {
            log_warn!(self.info.address, "Refusing data request while leaving");
            return DhtMessage::Error {
                message: "Node is leaving the ring".to_string(),
            };
        }

        match message {
            DhtMessage::FindSuccessor { id } => match self.find_successor(id).await {
                Ok(node) => DhtMessage::FoundSuccessor { node },
                Err(e) => DhtMessage::Error {
                    message: e.to_string(),
                },
            },
            DhtMessage::GetSuccessor => DhtMessage::FoundSuccessor {
                node: self.successor(),
            },
            DhtMessage::GetSuccessorList => DhtMessage::SuccessorList {
                nodes: self.successor_list(),
            },
            DhtMessage::ClosestPrecedingNode { id } => DhtMessage::FoundClosestPrecedingNode {
                node: self.closest_preceding_node(id),
            },
            DhtMessage::GetPredecessor => DhtMessage::Predecessor {
                node: self.predecessor(),
            },
            DhtMessage::Notify { node } => {
                self.notify(node).await;
                DhtMessage::Ack
            }
            DhtMessage::Ping => DhtMessage::Pong,
            DhtMessage::Store { key, value } => {
                self.store_local(key, value);
                DhtMessage::Ack
            }
            DhtMessage::Fetch { key } => DhtMessage::Fetched {
                key,
                value: self.fetch_local(key),
            },
            DhtMessage::Remove { key } => DhtMessage::Removed {
                key,
                existed: self.remove_local(key),
            },
            DhtMessage::ClaimRange { node } => DhtMessage::DataRange {
                data: self.release_range(&node),
            },
            DhtMessage::Handoff { data } => {
                self.accept_handoff(data);
                DhtMessage::Ack
            }
            DhtMessage::SuccessorLeaving { leaving, successor } => {
                self.successor_leaving(leaving, successor);
                DhtMessage::Ack
            }
            DhtMessage::PredecessorLeaving { leaving } => {
                self.predecessor_leaving(leaving);
                DhtMessage::Ack
            }
            other => {
                log_error!(
                    self.info.address,
                    "Unsupported message received: {:?}",
                    other
                );
                DhtMessage::Error {
                    message: "Unsupported message type".to_string(),
                }
            }
        }
    }

    /// Accepts RPC connections until `shutdown` flips to true.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChordError> {
        log_info!(
            self.info.address,
            "Chord node {} listening on {}",
            self.info.id,
            listener.local_addr()?
        );
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, _)) => {
                        let node = self.clone();
                        tokio::spawn(async move {
                            node.handle_connection(socket).await;
                        });
                    }
                    Err(e) => {
                        log_error!(self.info.address, "Failed to accept connection: {}", e);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log_info!(self.info.address, "RPC listener shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    pub(crate) async fn handle_connection(&self, mut socket: TcpStream) {
        let mut buffer = Vec::new();
        // Read the entire message
        let mut limited = (&mut socket).take(MAX_REQUEST_BYTES + 1);
        match tokio::time::timeout(self.request_timeout, limited.read_to_end(&mut buffer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                log_error!(self.info.address, "Failed to read from socket: {}", e);
                return;
            }
            Err(_) => {
                log_warn!(
                    self.info.address,
                    "Dropping connection that sent no complete request within {:?}",
                    self.request_timeout
                );
                return;
            }
        }
        if buffer.len() as u64 > MAX_REQUEST_BYTES {
            log_warn!(
                self.info.address,
                "Dropping request larger than {} bytes",
                MAX_REQUEST_BYTES
            );
            return;
        }

        let message = match bincode::deserialize::<DhtMessage>(&buffer) {
            Ok(message) => message,
            Err(e) => {
                log_error!(self.info.address, "Failed to deserialize message: {}", e);
                return;
            }
        };
        log_debug!(self.info.address, "Received message: {:?}", message);

        let response = self.handle_message(message).await;
        match bincode::serialize(&response) {
            Ok(encoded) => {
                if let Err(e) = socket.write_all(&encoded).await {
                    log_error!(
                        self.info.address,
                        "Failed to write response to socket: {}",
                        e
                    );
                }
            }
            Err(e) => log_error!(self.info.address, "Failed to encode response: {}", e),
        }
    }
}
