use chordkv_lib::dht_messages::{DhtMessage, NodeId, NodeInfo};
use chordkv_lib::is_strictly_between;

use crate::error::ChordError;
use crate::network_client::NetworkClient;
use crate::node::{ChordNode, MembershipState};

impl<T: NetworkClient> ChordNode<T> {
    fn ensure_joined(&self) -> Result<(), ChordError> {
        match self.membership() {
            MembershipState::Stable => Ok(()),
            _ => Err(ChordError::NotJoined),
        }
    }

    pub fn key_id(&self, key: &str) -> NodeId {
        self.space.hash_key(key)
    }

    /// Stores `value` on the owner of `key` and returns that owner.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<NodeInfo, ChordError> {
        self.put_id(self.key_id(key), value).await
    }

    pub async fn put_id(&self, key: NodeId, value: Vec<u8>) -> Result<NodeInfo, ChordError> {
        self.ensure_joined()?;
        let owner = self.lookup(key).await?;
        if owner.id == self.info.id {
            self.store_local(key, value);
            return Ok(owner);
        }
        match self
            .call(&owner.address, DhtMessage::Store { key, value })
            .await?
        {
            DhtMessage::Ack => {
                log_debug!(self.info.address, "Stored key {} on {}", key, owner);
                Ok(owner)
            }
            other => Err(ChordError::unexpected(&owner.address, other)),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ChordError> {
        self.get_id(self.key_id(key)).await
    }

    pub async fn get_id(&self, key: NodeId) -> Result<Option<Vec<u8>>, ChordError> {
        self.ensure_joined()?;
        let owner = self.lookup(key).await?;
        if owner.id == self.info.id {
            return Ok(self.fetch_local(key));
        }
        match self.call(&owner.address, DhtMessage::Fetch { key }).await? {
            DhtMessage::Fetched { value, .. } => Ok(value),
            other => Err(ChordError::unexpected(&owner.address, other)),
        }
    }

    /// Returns whether the key existed. Deleting an absent key is not an error.
    pub async fn delete(&self, key: &str) -> Result<bool, ChordError> {
        self.delete_id(self.key_id(key)).await
    }

    pub async fn delete_id(&self, key: NodeId) -> Result<bool, ChordError> {
        self.ensure_joined()?;
        let owner = self.lookup(key).await?;
        if owner.id == self.info.id {
            return Ok(self.remove_local(key));
        }
        match self.call(&owner.address, DhtMessage::Remove { key }).await? {
            DhtMessage::Removed { existed, .. } => Ok(existed),
            other => Err(ChordError::unexpected(&owner.address, other)),
        }
    }

    pub fn key_count(&self) -> usize {
        self.state().store.len()
    }

    pub fn local_value(&self, key: NodeId) -> Option<Vec<u8>> {
        self.fetch_local(key)
    }

    pub(crate) fn store_local(&self, key: NodeId, value: Vec<u8>) {
        self.state().store.insert(key, value);
    }

    pub(crate) fn fetch_local(&self, key: NodeId) -> Option<Vec<u8>> {
        self.state().store.get(key).cloned()
    }

    pub(crate) fn remove_local(&self, key: NodeId) -> bool {
        self.state().store.remove(key).is_some()
    }

    pub(crate) fn accept_handoff(&self, data: Vec<(NodeId, Vec<u8>)>) {
        if data.is_empty() {
            return;
        }
        log_info!(self.info.address, "Accepted {} handed-off keys", data.len());
        self.state().store.extend(data);
    }

    /// A joining node claims (predecessor, claimant]. Gives up every entry
    /// outside (claimant, self]. Refused when the claimant is not between our
    /// current predecessor and us.
    pub(crate) fn release_range(&self, claimant: &NodeInfo) -> Vec<(NodeId, Vec<u8>)> {
        if claimant.id == self.info.id {
            return Vec::new();
        }
        let data = {
            let mut state = self.state();
            if let Some(predecessor) = &state.predecessor {
                if predecessor.id != claimant.id
                    && !is_strictly_between(claimant.id, predecessor.id, self.info.id)
                {
                    log_warn!(
                        self.info.address,
                        "Refusing range claim from {}: not between {} and us",
                        claimant,
                        predecessor
                    );
                    return Vec::new();
                }
            }
            state.store.take_outside(claimant.id, self.info.id)
        };
        if !data.is_empty() {
            log_info!(
                self.info.address,
                "Released {} keys to joining node {}",
                data.len(),
                claimant
            );
        }
        data
    }
}
