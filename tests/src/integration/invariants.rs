use crate::integration::TestHarness;
use chordkv_lib::dht_messages::NodeId;
use std::collections::{HashMap, HashSet};

/// Something that does not match the ideal ring over the live nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Following successor pointers does not visit every live node exactly once.
    RingBroken { start: NodeId, visited: Vec<NodeId> },
    WrongSuccessor {
        node: NodeId,
        expected: NodeId,
        actual: NodeId,
    },
    WrongPredecessor {
        node: NodeId,
        expected: NodeId,
        actual: Option<NodeId>,
    },
    WrongFinger {
        node: NodeId,
        index: usize,
        expected: NodeId,
        actual: NodeId,
    },
    MisplacedKey {
        key: NodeId,
        holder: NodeId,
        owner: NodeId,
    },
    DuplicateKey { key: NodeId, holders: Vec<NodeId> },
    /// A harness step failed before invariants could be checked.
    Operation(String),
}

/// Checks a harness against the ring its live identifiers should form.
pub struct NetworkInvariants;

impl NetworkInvariants {
    /// Node responsible for `id`: the first live node at or after it.
    pub fn expected_owner(live: &[NodeId], id: NodeId) -> Option<NodeId> {
        live.iter()
            .copied()
            .find(|&n| n >= id)
            .or_else(|| live.first().copied())
    }

    fn neighbours(live: &[NodeId]) -> HashMap<NodeId, (NodeId, NodeId)> {
        let len = live.len();
        live.iter()
            .enumerate()
            .map(|(i, &id)| {
                let successor = live[(i + 1) % len];
                let predecessor = live[(i + len - 1) % len];
                (id, (predecessor, successor))
            })
            .collect()
    }

    pub fn check_ring_connectivity(harness: &TestHarness) -> Vec<InvariantViolation> {
        let live = harness.live_ids();
        let Some(&start) = live.first() else {
            return Vec::new();
        };
        let successors: HashMap<NodeId, NodeId> = harness
            .live_nodes()
            .iter()
            .map(|n| (n.id(), n.successor().id))
            .collect();

        let mut visited = vec![start];
        let mut seen: HashSet<NodeId> = HashSet::from([start]);
        let mut current = start;
        for _ in 0..live.len() {
            let Some(&next) = successors.get(&current) else {
                break;
            };
            if next == start || !seen.insert(next) {
                break;
            }
            visited.push(next);
            current = next;
        }

        if visited.len() == live.len() && successors.get(&current) == Some(&start) {
            Vec::new()
        } else {
            vec![InvariantViolation::RingBroken { start, visited }]
        }
    }

    pub fn check_successor_consistency(harness: &TestHarness) -> Vec<InvariantViolation> {
        let live = harness.live_ids();
        let neighbours = Self::neighbours(&live);
        harness
            .live_nodes()
            .iter()
            .filter_map(|node| {
                let (_, expected) = neighbours.get(&node.id())?;
                let actual = node.successor().id;
                (actual != *expected).then_some(InvariantViolation::WrongSuccessor {
                    node: node.id(),
                    expected: *expected,
                    actual,
                })
            })
            .collect()
    }

    pub fn check_predecessor_consistency(harness: &TestHarness) -> Vec<InvariantViolation> {
        let live = harness.live_ids();
        if live.len() < 2 {
            return Vec::new();
        }
        let neighbours = Self::neighbours(&live);
        harness
            .live_nodes()
            .iter()
            .filter_map(|node| {
                let (expected, _) = neighbours.get(&node.id())?;
                let actual = node.predecessor().map(|p| p.id);
                (actual != Some(*expected)).then_some(InvariantViolation::WrongPredecessor {
                    node: node.id(),
                    expected: *expected,
                    actual,
                })
            })
            .collect()
    }

    pub fn check_finger_tables(harness: &TestHarness) -> Vec<InvariantViolation> {
        let live = harness.live_ids();
        let mut violations = Vec::new();
        for node in harness.live_nodes() {
            for (index, finger) in node.fingers().iter().enumerate() {
                let Some(expected) = Self::expected_owner(&live, finger.start) else {
                    continue;
                };
                if finger.node.id != expected {
                    violations.push(InvariantViolation::WrongFinger {
                        node: node.id(),
                        index,
                        expected,
                        actual: finger.node.id,
                    });
                }
            }
        }
        violations
    }

    /// Every key lives on exactly one node, the one whose range contains it.
    pub fn check_key_ownership(harness: &TestHarness) -> Vec<InvariantViolation> {
        let live = harness.live_ids();
        let mut holders: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut violations = Vec::new();
        for (key, holder) in harness.stored_keys() {
            holders.entry(key).or_default().push(holder);
            if let Some(owner) = Self::expected_owner(&live, key) {
                if owner != holder {
                    violations.push(InvariantViolation::MisplacedKey { key, holder, owner });
                }
            }
        }
        for (key, holders) in holders {
            if holders.len() > 1 {
                violations.push(InvariantViolation::DuplicateKey { key, holders });
            }
        }
        violations
    }

    pub fn check_all(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Self::check_ring_connectivity(harness);
        violations.extend(Self::check_successor_consistency(harness));
        violations.extend(Self::check_predecessor_consistency(harness));
        violations.extend(Self::check_finger_tables(harness));
        violations.extend(Self::check_key_ownership(harness));
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_owner_wraps() {
        let live = vec![10, 100, 200];
        assert_eq!(NetworkInvariants::expected_owner(&live, 150), Some(200));
        assert_eq!(NetworkInvariants::expected_owner(&live, 100), Some(100));
        assert_eq!(NetworkInvariants::expected_owner(&live, 5), Some(10));
        assert_eq!(NetworkInvariants::expected_owner(&live, 250), Some(10));
        assert_eq!(NetworkInvariants::expected_owner(&[], 5), None);
    }

    #[test]
    fn test_neighbours() {
        let neighbours = NetworkInvariants::neighbours(&[10, 100, 200]);
        assert_eq!(neighbours[&10], (200, 100));
        assert_eq!(neighbours[&200], (100, 10));
    }
}
