use chordkv_lib::{is_between, NodeId};
use std::collections::BTreeMap;

/// Entries owned by one node, keyed by key identifier.
///
/// The store itself does not enforce ownership; callers move entries in and
/// out as the node's (predecessor, self] range changes.
#[derive(Debug, Clone, Default)]
pub struct KeyValueStore {
    entries: BTreeMap<NodeId, Vec<u8>>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last writer wins.
    pub fn insert(&mut self, key: NodeId, value: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: NodeId) -> Option<&Vec<u8>> {
        self.entries.get(&key)
    }

    pub fn remove(&mut self, key: NodeId) -> Option<Vec<u8>> {
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<NodeId> {
        self.entries.keys().copied().collect()
    }

    pub fn extend(&mut self, data: impl IntoIterator<Item = (NodeId, Vec<u8>)>) {
        self.entries.extend(data);
    }

    /// Removes and returns every entry whose key lies outside (start, end].
    pub fn take_outside(&mut self, start: NodeId, end: NodeId) -> Vec<(NodeId, Vec<u8>)> {
        let moving: Vec<NodeId> = self
            .entries
            .keys()
            .copied()
            .filter(|key| !is_between(*key, start, end))
            .collect();
        moving
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|value| (key, value)))
            .collect()
    }

    /// Removes and returns everything.
    pub fn drain(&mut self) -> Vec<(NodeId, Vec<u8>)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}
