//! Slot partition snapshot
//!
//! Rebuilt from the live topology on every request, never cached.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::NodeId;
use crate::driver::{ClusterNodeEntry, SlotOwnership};

/// Total number of hash slots in a cluster
pub const TOTAL_SLOTS: u32 = 16384;

/// Contiguous slot range `[start, end]` (inclusive) and its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    /// Owning master (`host:port`)
    pub node_id: NodeId,
    pub replicas: Vec<NodeId>,
    /// Set while a slot of this range is being moved
    pub migrating_from: Option<NodeId>,
    pub migrating_to: Option<NodeId>,
}

impl SlotRange {
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    pub fn slot_count(&self) -> u32 {
        (self.end as u32) - (self.start as u32) + 1
    }
}

/// Slot layout of the cluster at the time of the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Ordered by `start`
    pub ranges: Vec<SlotRange>,
    /// Cluster node ID -> `host:port`
    pub nodes: BTreeMap<String, NodeId>,
    /// All slots assigned, nothing migrating and no master flagged as failing
    pub stable: bool,
    pub migrating: bool,
}

impl PartitionInfo {
    /// Combine `CLUSTER SLOTS` ownership with `CLUSTER NODES` migration markers
    pub fn build(slots: &[SlotOwnership], topology: &[ClusterNodeEntry]) -> Self {
        let nodes: BTreeMap<String, NodeId> = topology
            .iter()
            .map(|entry| (entry.id.clone(), entry.addr.clone()))
            .collect();

        // slot -> (source, target)
        let mut moving: HashMap<u16, (Option<NodeId>, Option<NodeId>)> = HashMap::new();
        for entry in topology {
            for (slot, target) in &entry.migrating {
                let e = moving.entry(*slot).or_default();
                e.0 = Some(entry.addr.clone());
                if e.1.is_none() {
                    e.1 = nodes.get(target).cloned();
                }
            }
            for (slot, source) in &entry.importing {
                let e = moving.entry(*slot).or_default();
                e.1 = Some(entry.addr.clone());
                if e.0.is_none() {
                    e.0 = nodes.get(source).cloned();
                }
            }
        }

        let mut ranges: Vec<SlotRange> = slots
            .iter()
            .map(|owner| {
                let migration = moving
                    .iter()
                    .filter(|(slot, _)| **slot >= owner.start && **slot <= owner.end)
                    .min_by_key(|(slot, _)| **slot)
                    .map(|(_, m)| m.clone());
                let (migrating_from, migrating_to) = migration.unwrap_or((None, None));
                SlotRange {
                    start: owner.start,
                    end: owner.end,
                    node_id: owner.master.clone(),
                    replicas: owner.replicas.clone(),
                    migrating_from,
                    migrating_to,
                }
            })
            .collect();
        ranges.sort_by_key(|r| r.start);

        let migrating = !moving.is_empty();
        let assigned: u32 = ranges.iter().map(SlotRange::slot_count).sum();
        let failing_master = topology.iter().any(|e| e.is_master() && e.is_failing());

        Self {
            ranges,
            nodes,
            stable: assigned == TOTAL_SLOTS && !migrating && !failing_master,
            migrating,
        }
    }

    /// Range owning `slot`
    pub fn owner_of(&self, slot: u16) -> Option<&SlotRange> {
        self.ranges.iter().find(|r| r.contains(slot))
    }

    /// Range owning the slot `key` hashes to
    pub fn owner_of_key(&self, key: &[u8]) -> Option<&SlotRange> {
        self.owner_of(slot_for_key(key))
    }

    /// Distinct owning masters
    pub fn owners(&self) -> BTreeSet<NodeId> {
        self.ranges.iter().map(|r| r.node_id.clone()).collect()
    }

    pub fn assigned_slots(&self) -> u32 {
        self.ranges.iter().map(SlotRange::slot_count).sum()
    }
}

/// Hash slot of a key, honouring `{hash tags}`
pub fn slot_for_key(key: &[u8]) -> u16 {
    let hashed = match key.iter().position(|&b| b == b'{') {
        Some(open) => match key[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &key[open + 1..open + 1 + len],
            _ => key,
        },
        None => key,
    };
    (crc16(hashed) as u32 % TOTAL_SLOTS) as u16
}

/// CRC16 (XMODEM), as used by cluster key hashing
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::parse_cluster_nodes;

    fn owner(start: u16, end: u16, master: &str) -> SlotOwnership {
        SlotOwnership {
            start,
            end,
            master: master.to_string(),
            replicas: Vec::new(),
        }
    }

    #[test]
    fn test_slot_for_key() {
        // Known CRC16 (XMODEM) check values
        assert_eq!(slot_for_key(b"123456789"), 12739);
        assert_eq!(slot_for_key(b"{user1000}.following"), slot_for_key(b"{user1000}.followers"));
        assert!(slot_for_key(b"anything") < TOTAL_SLOTS as u16);
    }

    #[test]
    fn test_stable_layout() {
        let topology = parse_cluster_nodes(
            "a1 10.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-8191\n\
             b2 10.0.0.2:7000@17000 master - 0 0 2 connected 8192-16383\n",
        );
        let slots = vec![owner(8192, 16383, "10.0.0.2:7000"), owner(0, 8191, "10.0.0.1:7000")];
        let info = PartitionInfo::build(&slots, &topology);

        assert!(info.stable);
        assert!(!info.migrating);
        assert_eq!(info.ranges[0].start, 0);
        assert_eq!(info.assigned_slots(), TOTAL_SLOTS);
        assert_eq!(info.owner_of(9000).unwrap().node_id, "10.0.0.2:7000");
        assert_eq!(info.nodes.get("a1").unwrap(), "10.0.0.1:7000");
    }

    #[test]
    fn test_migration_marks_range() {
        let topology = parse_cluster_nodes(
            "a1 10.0.0.1:7000@17000 master - 0 0 1 connected 0-8191 [100->-b2]\n\
             b2 10.0.0.2:7000@17000 master - 0 0 2 connected 8192-16383 [100-<-a1]\n",
        );
        let slots = vec![owner(0, 8191, "10.0.0.1:7000"), owner(8192, 16383, "10.0.0.2:7000")];
        let info = PartitionInfo::build(&slots, &topology);

        assert!(info.migrating);
        assert!(!info.stable);
        let range = info.owner_of(100).unwrap();
        assert_eq!(range.migrating_from.as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(range.migrating_to.as_deref(), Some("10.0.0.2:7000"));
        assert!(info.owner_of(9000).unwrap().migrating_to.is_none());
    }

    #[test]
    fn test_incomplete_coverage_is_unstable() {
        let info = PartitionInfo::build(&[owner(0, 100, "10.0.0.1:7000")], &[]);
        assert!(!info.stable);
        assert!(info.owner_of(101).is_none());
    }
}
