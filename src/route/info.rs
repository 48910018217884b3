//! Cached cluster topology for one application key

use crate::types::ServerAddr;

/// Number of tracked operation kinds (invalid, read, write, unlink)
pub const OPER_COUNT: usize = 4;

/// Operation kinds reported back to the RC tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum OperKind {
    Invalid = 0,
    Read = 1,
    Write = 2,
    Unlink = 3,
}

/// Per-operation-kind counters batched into keepalive requests.
///
/// Counters are optimistic: they are snapshotted and zeroed while the
/// keepalive request is serialized, so an increment landing in that window
/// is lost rather than double-counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperStat {
    pub times: u64,
    pub bytes: u64,
    pub rt_sum: u64,
    pub succ: u64,
}

impl OperStat {
    pub fn record(&mut self, bytes: u64, rt_ms: u64, success: bool) {
        self.times += 1;
        self.bytes += bytes;
        self.rt_sum += rt_ms;
        if success {
            self.succ += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.times == 0
    }
}

/// Cluster health as reported by the RC tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStat {
    Normal,
    Down,
    Unknown(u32),
}

impl ClusterStat {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ClusterStat::Normal,
            2 => ClusterStat::Down,
            other => ClusterStat::Unknown(other),
        }
    }
}

/// What a physical cluster may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Forbidden,
    ReadOnly,
    ReadWrite,
}

impl AccessType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => AccessType::ReadOnly,
            2 => AccessType::ReadWrite,
            _ => AccessType::Forbidden,
        }
    }

    pub fn readable(self) -> bool {
        !matches!(self, AccessType::Forbidden)
    }

    pub fn writable(self) -> bool {
        matches!(self, AccessType::ReadWrite)
    }
}

/// One physical cluster: an NS endpoint plus its role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalCluster {
    pub stat: ClusterStat,
    pub access: AccessType,
    /// Cluster id text as delivered by RC; the numeric id is assigned by the
    /// NS tier later and starts unknown.
    pub cluster_id_text: String,
    pub cluster_id: u32,
    pub ns_vip: ServerAddr,
}

impl PhysicalCluster {
    pub fn usable(&self) -> bool {
        self.stat == ClusterStat::Normal
    }
}

/// Remote key-value cache endpoints used by the dedup path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupServerInfo {
    /// master config server, slave config server, group name
    pub servers: Vec<String>,
    pub area: i32,
}

/// One logical cluster: rw physical clusters plus optional dedup servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalCluster {
    pub need_dedup: bool,
    pub dedup_server_info: Option<DedupServerInfo>,
    pub dedup_server_hash: u32,
    pub rw_clusters: Vec<PhysicalCluster>,
}

/// NS group membership used for unlink/update routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// -1 until fetched from the NS tier
    pub group_seq: i32,
    pub ns_vip: ServerAddr,
}

/// Per-cluster-id group table for unlink routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterGroup {
    pub cluster_id: u32,
    /// -1 until fetched from the NS tier
    pub group_count: i32,
    pub groups: Vec<GroupInfo>,
}

impl ClusterGroup {
    /// NS endpoint owning `block_id` once group data is known.
    pub fn ns_for_block(&self, block_id: u32) -> Option<ServerAddr> {
        if self.group_count <= 0 {
            return None;
        }
        self.groups
            .iter()
            .find(|g| {
                g.group_seq >= 0
                    && block_id % self.group_count as u32 == g.group_seq as u32
            })
            .map(|g| g.ns_vip)
    }
}

/// Cached topology and session state for one application key.
///
/// Refreshes replace the whole value; in-flight operations keep the snapshot
/// they resolved and observe the new topology on their next lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub app_key: String,
    pub app_id: u64,
    pub session_id: String,
    pub rc_servers: Vec<ServerAddr>,
    pub logical_clusters: Vec<LogicalCluster>,
    pub need_dedup: bool,
    pub report_interval: u32,
    pub modify_time: u64,
    /// Monotonic per-entry refresh counter, bumped on every applied refresh
    pub version: u64,
    pub meta_root_server: Option<ServerAddr>,
    pub unlink_cluster_groups: Vec<ClusterGroup>,
}

impl RouteInfo {
    /// First healthy writable cluster.
    pub fn write_cluster(&self) -> Option<&PhysicalCluster> {
        self.logical_clusters
            .iter()
            .flat_map(|lc| lc.rw_clusters.iter())
            .find(|pc| pc.usable() && pc.access.writable())
    }

    /// Healthy readable cluster, `hint` rotating across candidates.
    pub fn read_cluster(&self, hint: usize) -> Option<&PhysicalCluster> {
        let candidates: Vec<&PhysicalCluster> = self
            .logical_clusters
            .iter()
            .flat_map(|lc| lc.rw_clusters.iter())
            .filter(|pc| pc.usable() && pc.access.readable())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[hint % candidates.len()])
    }

    /// Dedup endpoints for the cluster the write path selected, if any.
    pub fn dedup_servers(&self) -> Option<(&DedupServerInfo, u32)> {
        self.logical_clusters
            .iter()
            .filter(|lc| lc.need_dedup)
            .find_map(|lc| lc.dedup_server_info.as_ref().map(|i| (i, lc.dedup_server_hash)))
    }

    /// NS endpoint responsible for unlinking `block_id` in `cluster_id`.
    pub fn unlink_ns_for_block(&self, cluster_id: u32, block_id: u32) -> Option<ServerAddr> {
        self.unlink_cluster_groups
            .iter()
            .find(|g| g.cluster_id == cluster_id)
            .and_then(|g| g.ns_for_block(block_id))
    }

    /// Record an NS-provided group count/seq for the matching group entry.
    pub fn set_group_info(&mut self, ns_vip: ServerAddr, group_count: i32, group_seq: i32) {
        for group in &mut self.unlink_cluster_groups {
            for info in &mut group.groups {
                if info.ns_vip == ns_vip {
                    info.group_seq = group_seq;
                    group.group_count = group_count;
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
