//! Route/cluster-cache server messages: login and keepalive
//!
//! A login establishes a session for an application key and returns the full
//! cluster topology blob. Keepalives report per-operation counters and carry
//! back either "unchanged", a fresh topology blob, or a session failure.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::codec::{Frame, MessageType, StatusMsg, WireReader, WireWriter};
use crate::error::{Error, ProtocolError, Result, EXIT_SESSION_INVALID};
use crate::route::{
    appkey_hash, AccessType, ClusterGroup, ClusterStat, DedupServerInfo, GroupInfo, KeepaliveTick,
    LogicalCluster, PhysicalCluster, RouteInfo, OPER_COUNT,
};
use crate::types::ServerAddr;

/// Client software tag reported in keepalives
pub const CLIENT_VERSION: &str = "TIERFS";

/// Numeric cluster id convention: second character of the cluster id text.
fn cluster_id_of(text: &str) -> u32 {
    text.as_bytes()
        .get(1)
        .filter(|b| b.is_ascii_digit())
        .map(|b| (b - b'0') as u32)
        .unwrap_or(0)
}

/// The app id is the numeric prefix of the session id (`<app_id>-...`).
pub fn app_id_of_session(session_id: &str) -> Result<u64> {
    session_id
        .split_once('-')
        .and_then(|(prefix, _)| prefix.parse().ok())
        .ok_or_else(|| Error::InvalidSessionId(session_id.to_string()))
}

/// Build a login request for `app_key` originating from `client_ip`.
pub fn build_login(app_key: &str, client_ip: ServerAddr) -> Frame {
    let mut w = WireWriter::new();
    w.put_string(app_key.as_bytes());
    w.put_u64(client_ip.to_packed());
    Frame::request(MessageType::RcLogin, w.into_bytes())
}

/// Parse a login response into a fresh route entry.
pub fn parse_login(app_key: &str, frame: &Frame) -> Result<RouteInfo> {
    crate::proto::require(frame, MessageType::RespRcLogin)?;
    let mut r = WireReader::new(&frame.payload);
    let session_id = r.get_string_owned()?;
    if session_id.is_empty() {
        return Err(ProtocolError::MalformedField("login without session id").into());
    }
    let app_id = app_id_of_session(&session_id)?;
    let mut info = parse_route_blob(&mut r, app_key)?;
    info.session_id = session_id;
    info.app_id = app_id;
    debug!(app_key, app_id, "rc login complete");
    Ok(info)
}

/// Parse the topology blob shared by login and keepalive responses.
fn parse_route_blob(r: &mut WireReader<'_>, app_key: &str) -> Result<RouteInfo> {
    let rc_count = r.get_u32()? as usize;
    let mut rc_servers = Vec::with_capacity(rc_count);
    for _ in 0..rc_count {
        rc_servers.push(ServerAddr::from_packed(r.get_u64()?));
    }

    let logical_count = r.get_u32()? as usize;
    let mut logical_clusters = Vec::with_capacity(logical_count);
    let mut need_dedup = false;
    for _ in 0..logical_count {
        let cluster_dedup = r.get_u8()? != 0;
        let mut dedup_server_info = None;
        let mut dedup_server_hash = 0;
        if cluster_dedup {
            let raw = r.get_string()?;
            if !raw.is_empty() {
                dedup_server_hash = appkey_hash(raw);
                dedup_server_info = Some(parse_dedup_servers(raw));
                need_dedup = true;
            }
        }

        let rw_count = r.get_u32()? as usize;
        let mut rw_clusters = Vec::with_capacity(rw_count);
        for _ in 0..rw_count {
            let stat = ClusterStat::from_raw(r.get_u32()?);
            let access = AccessType::from_raw(r.get_u32()?);
            let cluster_id_text = r.get_string_owned()?;
            if cluster_id_text.is_empty() {
                return Err(ProtocolError::MalformedField("cluster without id").into());
            }
            let ns_text = r.get_string_owned()?;
            let ns_vip = ServerAddr::parse(&ns_text)
                .ok_or(ProtocolError::MalformedField("unparsable ns address"))?;
            rw_clusters.push(PhysicalCluster {
                stat,
                access,
                cluster_id: 0, // assigned by the NS tier
                cluster_id_text,
                ns_vip,
            });
        }
        logical_clusters.push(LogicalCluster {
            need_dedup: cluster_dedup,
            dedup_server_info,
            dedup_server_hash,
            rw_clusters,
        });
    }

    let report_interval = r.get_u32()?;
    let modify_time = r.get_u64()?;
    let meta_root_raw = r.get_u64()?;
    let meta_root_server = (meta_root_raw != 0).then(|| ServerAddr::from_packed(meta_root_raw));

    // remote block cache config is a collaborator concern; skip over it
    let _ = r.get_string()?;

    let unlink_count = r.get_u32()? as usize;
    let mut unlink_cluster_groups: Vec<ClusterGroup> = Vec::new();
    for _ in 0..unlink_count {
        let _stat = r.get_u32()?;
        let _access = r.get_u32()?;
        let cluster_id_text = r.get_string_owned()?;
        let cluster_id = cluster_id_of(&cluster_id_text);
        let ns_text = r.get_string_owned()?;
        let ns_vip = ServerAddr::parse(&ns_text)
            .ok_or(ProtocolError::MalformedField("unparsable unlink ns address"))?;
        let group = GroupInfo {
            group_seq: -1,
            ns_vip,
        };
        match unlink_cluster_groups
            .iter_mut()
            .find(|g| g.cluster_id == cluster_id)
        {
            Some(existing) => existing.groups.push(group),
            None => unlink_cluster_groups.push(ClusterGroup {
                cluster_id,
                group_count: -1,
                groups: vec![group],
            }),
        }
    }

    let _use_remote_cache = r.get_u32()?;

    Ok(RouteInfo {
        app_key: app_key.to_string(),
        app_id: 0,
        session_id: String::new(),
        rc_servers,
        logical_clusters,
        need_dedup,
        report_interval,
        modify_time,
        version: 0,
        meta_root_server,
        unlink_cluster_groups,
    })
}

/// Dedup server config travels as "master;slave;group[;area]".
fn parse_dedup_servers(raw: &[u8]) -> DedupServerInfo {
    let text = String::from_utf8_lossy(raw);
    let mut parts: Vec<&str> = text.split(';').collect();
    let area = parts
        .get(3)
        .and_then(|p| p.parse().ok())
        .unwrap_or_default();
    parts.truncate(3);
    DedupServerInfo {
        servers: parts.into_iter().map(str::to_string).collect(),
        area,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Build a keepalive for the entry selected this tick. The tick carries the
/// already-snapshotted counters; they were zeroed when it was taken.
pub fn build_keepalive(tick: &KeepaliveTick) -> Frame {
    let mut w = WireWriter::new();
    w.put_string(tick.session_id.as_bytes());
    w.put_string(CLIENT_VERSION.as_bytes());
    w.put_u64(0); // cache size
    w.put_u64(0); // cache time
    w.put_u64(tick.modify_time);
    w.put_u8(0); // not a logout

    let reported: Vec<(usize, _)> = tick
        .stats
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_empty())
        .collect();
    w.put_u32(reported.len() as u32);
    for (kind, stat) in reported {
        w.put_u32(((tick.app_id as u32) << 16) | kind as u32);
        w.put_u32(kind as u32);
        w.put_u64(stat.times);
        w.put_u64(stat.bytes);
        w.put_u64(stat.rt_sum);
        w.put_u64(stat.succ);
    }
    w.put_u64(unix_now());
    Frame::request(MessageType::RcKeepalive, w.into_bytes())
}

/// Outcome of one keepalive exchange
#[derive(Debug, PartialEq, Eq)]
pub enum KeepaliveReply {
    /// Topology unchanged; only the counters were delivered
    Unchanged,
    /// Server shipped a fresh topology for this entry
    Updated(RouteInfo),
    /// The session no longer exists server-side
    SessionGone,
}

/// Parse a keepalive response in the context of the entry it refreshed.
pub fn parse_keepalive(tick: &KeepaliveTick, frame: &Frame) -> Result<KeepaliveReply> {
    if frame.msg_type == MessageType::Status {
        let status = StatusMsg::decode(&frame.payload)?;
        if status.code == EXIT_SESSION_INVALID {
            return Ok(KeepaliveReply::SessionGone);
        }
        if !status.is_ok() {
            return Err(Error::TierStatus {
                code: status.code,
                message: status.message,
            });
        }
        return Ok(KeepaliveReply::Unchanged);
    }
    crate::proto::require(frame, MessageType::RespRcKeepalive)?;
    let mut r = WireReader::new(&frame.payload);
    let update = r.get_u8()? != 0;
    if !update {
        return Ok(KeepaliveReply::Unchanged);
    }
    let mut info = parse_route_blob(&mut r, &tick.app_key)?;
    info.session_id = tick.session_id.clone();
    info.app_id = tick.app_id;
    Ok(KeepaliveReply::Updated(info))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::OperStat;
    use assert_matches::assert_matches;
    use std::net::Ipv4Addr;

    pub(crate) fn encode_route_blob(w: &mut WireWriter, dedup: bool) {
        // rc servers
        w.put_u32(1);
        w.put_u64(ServerAddr::new(Ipv4Addr::new(10, 0, 0, 1), 6100).to_packed());
        // one logical cluster
        w.put_u32(1);
        w.put_u8(dedup as u8);
        if dedup {
            w.put_string(b"10.0.0.9:5198;10.0.0.10:5198;group_dedup;1");
        }
        w.put_u32(2);
        // rw cluster 1: read-only
        w.put_u32(1);
        w.put_u32(1);
        w.put_string(b"T1");
        w.put_string(b"10.0.0.2:8100");
        // rw cluster 2: read-write
        w.put_u32(1);
        w.put_u32(2);
        w.put_string(b"T1");
        w.put_string(b"10.0.0.3:8100");
        // report interval, modify time, meta root
        w.put_u32(10);
        w.put_u64(1234);
        w.put_u64(ServerAddr::new(Ipv4Addr::new(10, 0, 0, 4), 7100).to_packed());
        // remote block cache config (unused here)
        w.put_string(b"");
        // unlink clusters: two groups of cluster 1
        w.put_u32(2);
        for last in [2u8, 3u8] {
            w.put_u32(1);
            w.put_u32(2);
            w.put_string(b"T1");
            w.put_string(format!("10.0.0.{last}:8100").as_bytes());
        }
        // use remote cache flag
        w.put_u32(0);
    }

    fn login_frame(session: &str, dedup: bool) -> Frame {
        let mut w = WireWriter::new();
        w.put_string(session.as_bytes());
        encode_route_blob(&mut w, dedup);
        Frame::request(MessageType::RespRcLogin, w.into_bytes())
    }

    fn tick() -> KeepaliveTick {
        KeepaliveTick {
            app_key: "app".into(),
            app_id: 55,
            session_id: "55-100-1".into(),
            modify_time: 1234,
            rc_servers: Vec::new(),
            stats: [OperStat::default(); OPER_COUNT],
        }
    }

    #[test]
    fn test_parse_login() {
        let info = parse_login("app", &login_frame("55-100-1", false)).unwrap();
        assert_eq!(info.app_id, 55);
        assert_eq!(info.session_id, "55-100-1");
        assert_eq!(info.rc_servers.len(), 1);
        assert_eq!(info.logical_clusters[0].rw_clusters.len(), 2);
        assert!(!info.need_dedup);
        assert_eq!(info.unlink_cluster_groups.len(), 1);
        assert_eq!(info.unlink_cluster_groups[0].groups.len(), 2);
        assert!(info.meta_root_server.is_some());
    }

    #[test]
    fn test_parse_login_with_dedup_servers() {
        let info = parse_login("app", &login_frame("55-100-1", true)).unwrap();
        assert!(info.need_dedup);
        let (dedup, hash) = info.dedup_servers().unwrap();
        assert_eq!(dedup.servers.len(), 3);
        assert_eq!(dedup.area, 1);
        assert_ne!(hash, 0);
    }

    #[test]
    fn test_login_rejects_bad_session() {
        let frame = login_frame("nodash", false);
        assert_matches!(parse_login("app", &frame), Err(Error::InvalidSessionId(_)));
    }

    #[test]
    fn test_keepalive_reports_only_active_counters() {
        let mut t = tick();
        t.stats[1].record(4096, 3, true);
        let frame = build_keepalive(&t);
        let mut r = WireReader::new(&frame.payload);
        r.get_string().unwrap(); // session
        r.get_string().unwrap(); // client version
        r.get_u64().unwrap();
        r.get_u64().unwrap();
        assert_eq!(r.get_u64().unwrap(), 1234); // modify time
        r.get_u8().unwrap();
        assert_eq!(r.get_u32().unwrap(), 1); // one counter block
        assert_eq!(r.get_u32().unwrap(), (55 << 16) | 1);
    }

    #[test]
    fn test_keepalive_unchanged() {
        let mut w = WireWriter::new();
        w.put_u8(0);
        let frame = Frame::request(MessageType::RespRcKeepalive, w.into_bytes());
        assert_eq!(
            parse_keepalive(&tick(), &frame).unwrap(),
            KeepaliveReply::Unchanged
        );
    }

    #[test]
    fn test_keepalive_update_rebuilds_entry() {
        let mut w = WireWriter::new();
        w.put_u8(1);
        encode_route_blob(&mut w, false);
        let frame = Frame::request(MessageType::RespRcKeepalive, w.into_bytes());
        let reply = parse_keepalive(&tick(), &frame).unwrap();
        let KeepaliveReply::Updated(info) = reply else {
            panic!("expected update");
        };
        assert_eq!(info.session_id, "55-100-1");
        assert_eq!(info.modify_time, 1234);
    }

    #[test]
    fn test_keepalive_session_gone() {
        let status = StatusMsg {
            code: EXIT_SESSION_INVALID,
            message: "session not found".into(),
        };
        let frame = Frame::request(MessageType::Status, status.encode());
        assert_eq!(
            parse_keepalive(&tick(), &frame).unwrap(),
            KeepaliveReply::SessionGone
        );
    }
}
