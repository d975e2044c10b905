use chordkv_lib::dht_messages::{DhtMessage, NodeId, NodeInfo};
use chordkv_lib::{is_between, is_strictly_between};

use crate::error::ChordError;
use crate::network_client::NetworkClient;
use crate::node::ChordNode;

impl<T: NetworkClient> ChordNode<T> {
    /// Node responsible for `key_id`.
    pub async fn lookup(&self, key_id: NodeId) -> Result<NodeInfo, ChordError> {
        self.find_successor(key_id).await
    }

    /// Recursive lookup. Answers locally when `id` falls in (self, successor],
    /// otherwise forwards to the closest preceding node it knows and falls
    /// back to the next candidate when a hop fails.
    pub async fn find_successor(&self, id: NodeId) -> Result<NodeInfo, ChordError> {
        let successor = self.successor();
        if successor.id == self.info.id || is_between(id, self.info.id, successor.id) {
            return Ok(successor);
        }

        let candidates = self.routing_candidates(id);
        log_debug!(
            self.info.address,
            "find_successor({}): {} candidate hops",
            id,
            candidates.len()
        );

        for candidate in candidates {
            match self
                .call(&candidate.address, DhtMessage::FindSuccessor { id })
                .await
            {
                Ok(DhtMessage::FoundSuccessor { node }) => return Ok(node),
                Ok(other) => {
                    log_warn!(
                        self.info.address,
                        "Unexpected response from {} while routing {}: {:?}",
                        candidate,
                        id,
                        other
                    );
                }
                Err(e) if e.is_unreachable() => {
                    log_warn!(
                        self.info.address,
                        "Hop {} unreachable while routing {}: {}",
                        candidate,
                        id,
                        e
                    );
                    self.forget_finger(&candidate);
                }
                Err(e) => {
                    // The hop answered but could not route either.
                    log_debug!(self.info.address, "Hop {} failed: {}", candidate, e);
                }
            }
        }
        Err(ChordError::LookupFailed { id })
    }

    /// A forwarded lookup also times out when a node further down the chain
    /// is silent, so the hop itself may be alive. Only shortcut fingers are
    /// dropped here; the successor and successor list are left to `stabilize`.
    fn forget_finger(&self, hop: &NodeInfo) {
        let mut state = self.state();
        if state.successor.id == hop.id {
            return;
        }
        state.finger_table.evict(hop.id);
    }

    /// Every known node strictly inside (self, id), closest to `id` first.
    /// The successor sorts last.
    fn routing_candidates(&self, id: NodeId) -> Vec<NodeInfo> {
        let state = self.state();
        let mut candidates = state.finger_table.preceding_candidates(id);
        for node in state.successor_list.iter().chain(Some(&state.successor)) {
            if node.id != self.info.id
                && is_strictly_between(node.id, self.info.id, id)
                && !candidates.iter().any(|c| c.id == node.id)
            {
                candidates.push(node.clone());
            }
        }
        let space = self.space;
        candidates.sort_by_key(|n| std::cmp::Reverse(space.distance(self.info.id, n.id)));
        candidates
    }

    /// Closest node preceding `id` among fingers and the successor list, or
    /// this node when none is known.
    pub fn closest_preceding_node(&self, id: NodeId) -> NodeInfo {
        let state = self.state();
        let from_fingers = state.finger_table.closest_preceding(id).cloned();
        let from_list = state
            .successor_list
            .iter()
            .filter(|n| n.id != self.info.id && is_strictly_between(n.id, self.info.id, id))
            .max_by_key(|n| self.space.distance(self.info.id, n.id))
            .cloned();
        [from_fingers, from_list]
            .into_iter()
            .flatten()
            .max_by_key(|n| self.space.distance(self.info.id, n.id))
            .unwrap_or_else(|| self.info.clone())
    }

    /// Iterative lookup of the node whose (node, successor] contains `id`.
    /// Walks at most 2m hops by asking each node for its closest preceding
    /// node and its successor.
    pub async fn find_predecessor(&self, id: NodeId) -> Result<NodeInfo, ChordError> {
        let mut current = self.info.clone();
        let mut current_successor = self.successor();
        let max_hops = 2 * self.space.bits();

        for _ in 0..max_hops {
            if current_successor.id == current.id
                || is_between(id, current.id, current_successor.id)
            {
                return Ok(current);
            }

            let next = if current.id == self.info.id {
                self.closest_preceding_node(id)
            } else {
                match self
                    .call(&current.address, DhtMessage::ClosestPrecedingNode { id })
                    .await
                {
                    Ok(DhtMessage::FoundClosestPrecedingNode { node }) => node,
                    Ok(other) => {
                        log_warn!(
                            self.info.address,
                            "Unexpected closest preceding reply from {}: {:?}",
                            current,
                            other
                        );
                        return Err(ChordError::LookupFailed { id });
                    }
                    Err(e) => {
                        log_warn!(self.info.address, "find_predecessor({}) hop failed: {}", id, e);
                        return Err(ChordError::LookupFailed { id });
                    }
                }
            };

            // No closer node known: ask for the successor and step along the ring.
            let next = if next.id == current.id {
                current_successor.clone()
            } else {
                next
            };

            current_successor = if next.id == self.info.id {
                self.successor()
            } else {
                match self.call(&next.address, DhtMessage::GetSuccessor).await {
                    Ok(DhtMessage::FoundSuccessor { node }) => node,
                    Ok(other) => {
                        log_warn!(
                            self.info.address,
                            "Unexpected successor reply from {}: {:?}",
                            next,
                            other
                        );
                        return Err(ChordError::LookupFailed { id });
                    }
                    Err(e) => {
                        log_warn!(self.info.address, "find_predecessor({}) hop failed: {}", id, e);
                        return Err(ChordError::LookupFailed { id });
                    }
                }
            };
            current = next;
        }
        Err(ChordError::LookupFailed { id })
    }
}
