//! `CLUSTER NODES` parsing

use serde::{Deserialize, Serialize};

use crate::metadata::NodeId;

/// One line of `CLUSTER NODES`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeEntry {
    /// 40-character cluster node ID
    pub id: String,
    /// `host:port`, without cluster bus port or hostname
    pub addr: NodeId,
    pub flags: Vec<String>,
    pub master_id: Option<String>,
    pub link_connected: bool,
    /// Owned slot ranges, inclusive
    pub slots: Vec<(u16, u16)>,
    /// Slots this node is handing to another node ID
    pub migrating: Vec<(u16, String)>,
    /// Slots this node is receiving from another node ID
    pub importing: Vec<(u16, String)>,
}

impl ClusterNodeEntry {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_master(&self) -> bool {
        self.has_flag("master")
    }

    pub fn is_myself(&self) -> bool {
        self.has_flag("myself")
    }

    /// Flagged `fail` or `fail?`
    pub fn is_failing(&self) -> bool {
        self.has_flag("fail") || self.has_flag("fail?")
    }
}

/// Parse `CLUSTER NODES` output; malformed lines are skipped
pub fn parse_cluster_nodes(text: &str) -> Vec<ClusterNodeEntry> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ClusterNodeEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return None;
    }

    let mut entry = ClusterNodeEntry {
        id: fields[0].to_string(),
        addr: normalize_addr(fields[1]),
        flags: fields[2]
            .split(',')
            .filter(|f| !f.is_empty() && *f != "noflags")
            .map(str::to_string)
            .collect(),
        master_id: match fields[3] {
            "-" => None,
            id => Some(id.to_string()),
        },
        link_connected: fields[7] == "connected",
        slots: Vec::new(),
        migrating: Vec::new(),
        importing: Vec::new(),
    };

    for token in &fields[8..] {
        if let Some(marker) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if let Some((slot, target)) = marker.split_once("->-") {
                if let Ok(slot) = slot.parse() {
                    entry.migrating.push((slot, target.to_string()));
                }
            } else if let Some((slot, source)) = marker.split_once("-<-") {
                if let Ok(slot) = slot.parse() {
                    entry.importing.push((slot, source.to_string()));
                }
            }
        } else if let Some((start, end)) = token.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse(), end.parse()) {
                entry.slots.push((start, end));
            }
        } else if let Ok(slot) = token.parse() {
            entry.slots.push((slot, slot));
        }
    }

    Some(entry)
}

/// `10.0.0.1:7000@17000,host.example` -> `10.0.0.1:7000`
fn normalize_addr(raw: &str) -> NodeId {
    let without_hostname = raw.split(',').next().unwrap_or(raw);
    without_hostname
        .split('@')
        .next()
        .unwrap_or(without_hostname)
        .to_string()
}
