use chordkv_lib::{is_strictly_between, IdentifierSpace, NodeId, NodeInfo};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finger {
    /// (owner + 2^i) mod 2^m
    pub start: NodeId,
    /// Last known successor of `start`.
    pub node: NodeInfo,
}

/// Shortcut pointers of one node. Entry `i` points at the first node at or
/// after `start_i`; entries still pointing at the owner are unknown and are
/// never used as routing hops.
#[derive(Debug, Clone)]
pub struct FingerTable {
    owner: NodeInfo,
    entries: Vec<Finger>,
    next: usize,
}

impl FingerTable {
    pub fn new(owner: &NodeInfo, space: IdentifierSpace) -> Self {
        let entries = (0..space.bits())
            .map(|i| Finger {
                start: space.finger_start(owner.id, i),
                node: owner.clone(),
            })
            .collect();
        Self {
            owner: owner.clone(),
            entries,
            next: 0,
        }
    }

    pub fn entries(&self) -> &[Finger] {
        &self.entries
    }

    pub fn get(&self, i: usize) -> Option<&Finger> {
        self.entries.get(i)
    }

    /// Points entry `i` at `node`. Returns true if the entry changed.
    pub fn set(&mut self, i: usize, node: NodeInfo) -> bool {
        match self.entries.get_mut(i) {
            Some(finger) if finger.node != node => {
                finger.node = node;
                true
            }
            _ => false,
        }
    }

    /// Index and start of the next entry to refresh, cycling through the table.
    pub fn next_to_fix(&mut self) -> Option<(usize, NodeId)> {
        let index = self.next;
        let start = self.entries.get(index)?.start;
        self.next = (index + 1) % self.entries.len();
        Some((index, start))
    }

    /// Furthest known finger strictly inside (owner, id).
    pub fn closest_preceding(&self, id: NodeId) -> Option<&NodeInfo> {
        self.entries
            .iter()
            .rev()
            .map(|finger| &finger.node)
            .find(|node| node.id != self.owner.id && is_strictly_between(node.id, self.owner.id, id))
    }

    /// Every distinct finger strictly inside (owner, id), closest to `id` first.
    /// Routing tries these in order when a hop turns out to be unreachable.
    pub fn preceding_candidates(&self, id: NodeId) -> Vec<NodeInfo> {
        let mut candidates: Vec<NodeInfo> = Vec::new();
        for finger in self.entries.iter().rev() {
            let node = &finger.node;
            if node.id == self.owner.id || !is_strictly_between(node.id, self.owner.id, id) {
                continue;
            }
            if !candidates.iter().any(|c| c.id == node.id) {
                candidates.push(node.clone());
            }
        }
        candidates
    }

    /// Forgets a node that stopped answering. Returns how many entries pointed at it.
    pub fn evict(&mut self, id: NodeId) -> usize {
        let mut evicted = 0;
        for finger in self.entries.iter_mut().filter(|f| f.node.id == id) {
            finger.node = self.owner.clone();
            evicted += 1;
        }
        evicted
    }

    pub fn reset(&mut self) {
        for finger in self.entries.iter_mut() {
            finger.node = self.owner.clone();
        }
        self.next = 0;
    }
}
