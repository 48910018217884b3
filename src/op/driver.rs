//! Operation state-machine driver
//!
//! One driver serves a worker: it resolves route info, walks each operation
//! context through its states, dispatches tier round trips through the
//! transport seam, and owns the NS/DS retry handlers and the dedup hooks.
//! The driver suspends between states only; no lock is held across an await.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::blockcache::BlockCache;
use crate::config::EngineConfig;
use crate::dedup::{DedupClient, DedupContext, KvCache, RemoveLookup, WriteLookup};
use crate::error::{Error, Result};
use crate::fsname::{FileType, FsName};
use crate::op::{
    child, Action, OpOutput, OperationContext, RequestCtx, Segment, SegmentInfo, State,
    StepOutcome,
};
use crate::proto::{self, rc, ns, RetryPolicy, Tier, TierOp};
use crate::route::{OperKind, RouteCache};
use crate::transport::Transport;
use crate::types::{FileFlag, ServerAddr, UnlinkType};

/// Payload bytes per write segment
pub const MAX_FRAGMENT_SIZE: usize = 2 * 1024 * 1024;

pub struct Driver {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn Transport>,
    routes: Arc<RouteCache>,
    blocks: Arc<BlockCache>,
    dedup: Option<Arc<DedupClient>>,
    rc_cursor: AtomicUsize,
}

impl Driver {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        kv: Option<Arc<dyn KvCache>>,
    ) -> Self {
        let dedup = if config.enable_dedup {
            kv.map(|kv| Arc::new(DedupClient::new(kv)))
        } else {
            None
        };
        Self {
            routes: Arc::new(RouteCache::new(config.route_cache_capacity)),
            blocks: Arc::new(BlockCache::new(config.block_cache_capacity)),
            dedup,
            transport,
            config,
            rc_cursor: AtomicUsize::new(0),
        }
    }

    pub fn routes(&self) -> &Arc<RouteCache> {
        &self.routes
    }

    pub fn blocks(&self) -> &Arc<BlockCache> {
        &self.blocks
    }

    /// Run one logical operation to its terminal state.
    pub async fn run(&self, req: RequestCtx) -> Result<OpOutput> {
        let started = Instant::now();
        let mut ctx = OperationContext::new(req, self.config.retry_budget);
        let result = self.drive(&mut ctx).await;
        self.account(&ctx, started, result.is_ok());
        result
    }

    async fn drive(&self, ctx: &mut OperationContext) -> Result<OpOutput> {
        if ctx.req.action == Action::Keepalive {
            crate::keepalive::tick_once(self).await?;
            ctx.state = State::RcDone;
            return Ok(OpOutput::KeepaliveDone);
        }

        self.ensure_route(ctx).await?;

        if ctx.req.action == Action::GetAppId {
            ctx.state = State::RcDone;
            let app_id = ctx.route.as_ref().map(|r| r.app_id).unwrap_or_default();
            return Ok(OpOutput::AppId(app_id));
        }

        self.prepare(ctx)?;

        loop {
            if ctx.state.is_terminal() {
                break;
            }
            // per-segment fan-out once more than one segment is in play
            if !ctx.is_child
                && ctx.segments.len() > 1
                && matches!(ctx.state, State::ReadData | State::WriteCreateFileName)
            {
                child::fan_out(self, ctx).await?;
                continue;
            }
            if let Err(err) = self.step(ctx).await {
                if self.should_roll_back(ctx, &err) {
                    debug!(error = %err, "write failed after create, rolling back");
                    ctx.last_error = Some(err);
                    ctx.segment_index = 0;
                    ctx.state = State::WriteDeleteData;
                    continue;
                }
                return Err(err);
            }
        }

        if let Some(err) = ctx.last_error.take() {
            return Err(err);
        }
        self.output(ctx)
    }

    /// A failed write whose file name was already created unlinks what it
    /// wrote before surfacing the error.
    fn should_roll_back(&self, ctx: &OperationContext, err: &Error) -> bool {
        ctx.req.action == Action::Write
            && ctx.last_error.is_none()
            && matches!(
                ctx.state,
                State::WriteData | State::WriteCloseFile | State::WriteMs
            )
            && ctx.segments.iter().any(|s| s.file_number != 0)
            && !matches!(err, Error::SegmentFailed { .. })
    }

    /// Resolve cached route info or log in to the RC tier for it.
    pub(crate) async fn ensure_route(&self, ctx: &mut OperationContext) -> Result<()> {
        if let Some(info) = self.routes.lookup(&ctx.req.app_key) {
            ctx.route = Some(info);
            return Ok(());
        }
        if self.config.rc_servers.is_empty() {
            return Err(Error::NoEndpoint { tier: "rc server" });
        }

        let mut last_err = None;
        for _ in 0..self.config.rc_servers.len() {
            let idx = self.rc_cursor.fetch_add(1, Ordering::Relaxed);
            let peer = self.config.rc_servers[idx % self.config.rc_servers.len()];
            let frame = rc::build_login(&ctx.req.app_key, self.config.local_addr);
            match self.transport.call(peer, frame).await {
                Ok(resp) => {
                    let info = rc::parse_login(&ctx.req.app_key, &resp)?;
                    ctx.route = Some(self.routes.insert(info)?);
                    return Ok(());
                }
                Err(err) if err.is_recoverable() => {
                    warn!(%peer, error = %err, "rc login failed, trying next endpoint");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(Error::NoEndpoint { tier: "rc server" }))
    }

    /// Per-action setup: segment seeding and the jump out of the start state.
    fn prepare(&self, ctx: &mut OperationContext) -> Result<()> {
        let custom = !ctx.req.file_path.is_empty() || ctx.req.action.is_custom();
        match ctx.req.action {
            Action::Read => {
                ctx.want_stat_tail = true;
                if custom {
                    ctx.state = State::ReadGetMetaTable;
                } else {
                    self.seed_raw_segment(ctx)?;
                    ctx.state = if ctx.req.large_file {
                        State::ReadGetFragInfo
                    } else {
                        State::ReadGetBlkInfo
                    };
                }
            }
            Action::Write => {
                if custom {
                    self.seed_write_segments(ctx)?;
                    ctx.state = State::WriteGetMetaTable;
                } else {
                    if ctx.req.data.len() > MAX_FRAGMENT_SIZE {
                        return Err(Error::Config(
                            "raw writes are bounded by one fragment; use a path write".into(),
                        ));
                    }
                    self.seed_write_segments(ctx)?;
                    ctx.state = State::WriteClusterIdNs;
                }
            }
            Action::Remove => {
                if custom {
                    ctx.state = State::RemoveGetMetaTable;
                } else {
                    self.seed_raw_segment(ctx)?;
                    if self.dedup_eligible(ctx) {
                        ctx.is_stat_dup_file = true;
                        ctx.use_dedup = true;
                    }
                    ctx.state = if self.needs_group_probe(ctx) {
                        State::RemoveGetGroupCount
                    } else {
                        State::RemoveGetBlkInfo
                    };
                }
            }
            Action::Stat => {
                self.seed_raw_segment(ctx)?;
                ctx.state = State::StatGetBlkInfo;
            }
            Action::LsFile
            | Action::LsDir
            | Action::CreateFile
            | Action::CreateDir
            | Action::MoveFile
            | Action::MoveDir
            | Action::RemoveDir => {
                ctx.state = State::ActionGetMetaTable;
            }
            Action::Keepalive | Action::GetAppId => {}
        }
        Ok(())
    }

    fn dedup_eligible(&self, ctx: &OperationContext) -> bool {
        self.dedup.is_some()
            && ctx.req.unlink_type == UnlinkType::Delete
            && ctx
                .route
                .as_ref()
                .map(|r| r.need_dedup)
                .unwrap_or(false)
    }

    fn needs_group_probe(&self, ctx: &OperationContext) -> bool {
        ctx.route
            .as_ref()
            .map(|r| {
                !r.unlink_cluster_groups.is_empty()
                    && r.unlink_cluster_groups.iter().any(|g| g.group_count <= 0)
            })
            .unwrap_or(false)
    }

    /// Build the single raw-namespace segment from the request file name.
    fn seed_raw_segment(&self, ctx: &mut OperationContext) -> Result<()> {
        let fsname = FsName::parse(&ctx.req.file_name, &ctx.req.suffix)?;
        ctx.req.large_file = fsname.file_type == FileType::Large;
        ctx.cluster_id = fsname.cluster_id;
        if !ctx.req.large_file {
            ctx.segments = vec![Segment {
                info: SegmentInfo {
                    block_id: fsname.block_id,
                    file_id: fsname.file_id(),
                    offset: 0,
                    size: 0,
                    crc: 0,
                },
                oper_offset: ctx.req.offset.max(0) as u64,
                oper_size: ctx.req.length,
                ..Segment::default()
            }];
        }
        ctx.fsname = Some(fsname);
        Ok(())
    }

    /// Split the write payload into fragment-sized segments.
    fn seed_write_segments(&self, ctx: &mut OperationContext) -> Result<()> {
        if ctx.req.data.is_empty() {
            return Err(Error::Config("write without payload".into()));
        }
        let data = ctx.req.data.clone();
        let mut segments = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + MAX_FRAGMENT_SIZE).min(data.len());
            segments.push(Segment {
                info: SegmentInfo {
                    block_id: 0,
                    file_id: 0,
                    offset: offset as i64,
                    size: (end - offset) as u32,
                    crc: 0,
                },
                data: data.slice(offset..end),
                ..Segment::default()
            });
            offset = end;
        }
        ctx.req.large_file = segments.len() > 1;
        ctx.segments = segments;
        Ok(())
    }

    /// Execute one state: dedup pre-hook, build, dispatch with retry, parse,
    /// post-hooks, state advance.
    pub(crate) async fn step(&self, ctx: &mut OperationContext) -> Result<()> {
        self.dedup_pre_hook(ctx).await;

        // cached block locations can satisfy a read's NS round trip
        if ctx.state == State::ReadGetBlkInfo && self.fill_from_block_cache(ctx) {
            ctx.state = State::ReadData;
            return Ok(());
        }

        // large raw reads resolve the meta segment's block inline
        if ctx.state == State::ReadGetFragInfo && ctx.req.large_file && ctx.segments.is_empty() {
            self.seed_meta_segment(ctx)?;
            self.resolve_blocks_inline(ctx).await?;
        }

        let entered = ctx.state;
        let op = proto::select_op(ctx)?;
        let result = self.exec(ctx, op).await;

        // dedup stat failures fall back to a plain write instead of failing
        if entered == State::WriteStatDupFile {
            return self.after_dup_stat(ctx, result).await;
        }
        let outcome = result?;

        match entered {
            State::WriteGetGroupSeq | State::RemoveGetGroupSeq => {
                self.apply_group_probe(ctx);
            }
            State::ReadGetBlkInfo => self.store_block_locations(ctx),
            _ => {}
        }

        // remove-path dedup decision once the file content is in hand
        if entered == State::RemoveReadMetaSegment && ctx.use_dedup {
            return self.after_remove_content(ctx).await;
        }

        self.advance(ctx, outcome);

        // a finished write records the new content mapping
        if ctx.state == State::WriteDone && !ctx.is_stat_dup_file {
            self.store_write_mapping(ctx).await;
        }
        Ok(())
    }

    async fn exec(&self, ctx: &mut OperationContext, op: TierOp) -> Result<StepOutcome> {
        let mut attempts = 0u32;
        loop {
            let peer = self.peer_for(ctx, op.tier)?;
            let frame = (op.build)(ctx)?;
            debug!(
                state = ?ctx.state,
                tier = op.tier.name(),
                %peer,
                msg = ?frame.msg_type,
                "dispatch"
            );
            let result = match self.transport.call(peer, frame).await {
                Ok(resp) => (op.parse)(ctx, &resp),
                Err(err) => Err(err),
            };
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    attempts += 1;
                    let retryable = op.retry == RetryPolicy::SameTier
                        && err.is_recoverable()
                        && attempts <= ctx.retry_budget;
                    if !retryable {
                        if attempts > ctx.retry_budget && op.retry == RetryPolicy::SameTier {
                            return Err(Error::RetryExhausted {
                                tier: op.tier.name(),
                                attempts,
                            });
                        }
                        return Err(err);
                    }
                    warn!(tier = op.tier.name(), %peer, error = %err, "retrying against another endpoint");
                    self.re_target(ctx, op.tier, peer);
                }
            }
        }
    }

    /// Rotate to a different endpoint of the same role after a failure.
    fn re_target(&self, ctx: &mut OperationContext, tier: Tier, failed: ServerAddr) {
        match tier {
            Tier::Ds => {
                if let Some(ns) = ctx.ns_addr {
                    if let Some(seg) = ctx.current_segment() {
                        self.blocks.invalidate(ns, seg.info.block_id);
                    }
                }
                if let Some(seg) = ctx.current_segment_mut() {
                    seg.next_ds();
                }
            }
            Tier::Ns => {
                ctx.read_cluster_hint += 1;
                ctx.ns_addr = None;
            }
            _ => {
                let _ = failed;
            }
        }
    }

    fn peer_for(&self, ctx: &mut OperationContext, tier: Tier) -> Result<ServerAddr> {
        let route = ctx.route.clone();
        match tier {
            Tier::Rc => {
                let servers = route
                    .as_ref()
                    .map(|r| r.rc_servers.clone())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| self.config.rc_servers.clone());
                if servers.is_empty() {
                    return Err(Error::NoEndpoint { tier: "rc server" });
                }
                let idx = self.rc_cursor.fetch_add(1, Ordering::Relaxed);
                Ok(servers[idx % servers.len()])
            }
            Tier::Rs => route
                .as_ref()
                .and_then(|r| r.meta_root_server)
                .ok_or(Error::NoEndpoint { tier: "root server" }),
            Tier::Ms => ctx
                .select_meta_server()
                .ok_or(Error::NoEndpoint { tier: "meta server" }),
            Tier::Ds => ctx
                .current_segment()
                .and_then(|s| s.current_ds())
                .ok_or(Error::NoEndpoint { tier: "data server" }),
            Tier::Ns => {
                if let Some(addr) = ctx.ns_addr {
                    return Ok(addr);
                }
                let route = route.as_ref().ok_or(Error::NoEndpoint { tier: "name server" })?;
                let addr = match ctx.req.action {
                    Action::Write => route.write_cluster().map(|c| c.ns_vip),
                    Action::Remove => {
                        // group probes target the first group whose seq is
                        // unknown; unlinks prefer the group owning the block
                        let probe = route
                            .unlink_cluster_groups
                            .iter()
                            .flat_map(|g| g.groups.iter())
                            .find(|g| g.group_seq < 0)
                            .map(|g| g.ns_vip);
                        let block = ctx.segments.first().map(|s| s.info.block_id).unwrap_or(0);
                        match ctx.state {
                            State::RemoveGetGroupCount | State::RemoveGetGroupSeq => probe,
                            _ => route
                                .unlink_ns_for_block(ctx.cluster_id, block)
                                .or_else(|| route.write_cluster().map(|c| c.ns_vip)),
                        }
                    }
                    _ => route.read_cluster(ctx.read_cluster_hint).map(|c| c.ns_vip),
                }
                .ok_or(Error::NoEndpoint { tier: "name server" })?;
                ctx.ns_addr = Some(addr);
                Ok(addr)
            }
        }
    }

    fn advance(&self, ctx: &mut OperationContext, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Next(state) => ctx.state = state,
            StepOutcome::Stay => {}
            StepOutcome::Done => ctx.state = terminal_for(ctx.req.action),
        }
    }

    // --- block cache -----------------------------------------------------

    fn fill_from_block_cache(&self, ctx: &mut OperationContext) -> bool {
        if ctx.req.action != Action::Read {
            return false;
        }
        let Some(ns) = ctx.ns_addr.or_else(|| {
            ctx.route
                .as_ref()
                .and_then(|r| r.read_cluster(ctx.read_cluster_hint))
                .map(|c| c.ns_vip)
        }) else {
            return false;
        };
        ctx.ns_addr = Some(ns);
        let mut all = true;
        for seg in &mut ctx.segments {
            if seg.ds_list.is_empty() {
                match self.blocks.get(ns, seg.info.block_id) {
                    Some(ds_list) => {
                        seg.ds_list = ds_list;
                        seg.ds_index = 0;
                    }
                    None => all = false,
                }
            }
        }
        all
    }

    fn store_block_locations(&self, ctx: &OperationContext) {
        if ctx.req.action != Action::Read {
            return;
        }
        let Some(ns) = ctx.ns_addr else { return };
        for seg in &ctx.segments {
            if !seg.ds_list.is_empty() {
                self.blocks.insert(ns, seg.info.block_id, seg.ds_list.clone());
            }
        }
    }

    // --- large-file helpers ----------------------------------------------

    fn seed_meta_segment(&self, ctx: &mut OperationContext) -> Result<()> {
        let fsname = ctx
            .fsname
            .as_ref()
            .ok_or_else(|| Error::InvalidState("large read without file name".into()))?;
        ctx.segments = vec![Segment {
            info: SegmentInfo {
                block_id: fsname.block_id,
                file_id: fsname.file_id(),
                offset: 0,
                size: 0,
                crc: 0,
            },
            ..Segment::default()
        }];
        ctx.segment_index = 0;
        Ok(())
    }

    /// Resolve DS lists for the pending segments without leaving the current
    /// state (used for the large-file meta segment).
    async fn resolve_blocks_inline(&self, ctx: &mut OperationContext) -> Result<()> {
        loop {
            let peer = self.peer_for(ctx, Tier::Ns)?;
            let frame = ns::build_get_block_info(ctx)?;
            let resp = self.transport.call(peer, frame).await?;
            match ns::parse_get_block_info(ctx, &resp)? {
                StepOutcome::Stay => continue,
                _ => return Ok(()),
            }
        }
    }

    // --- dedup hooks -----------------------------------------------------

    async fn dedup_pre_hook(&self, ctx: &mut OperationContext) {
        if ctx.dedup.is_some() || ctx.req.action != Action::Write {
            return;
        }
        // only single-fragment payloads are content-addressable
        if ctx.segments.len() > 1 {
            return;
        }
        if !matches!(
            ctx.state,
            State::WriteClusterIdNs | State::WriteClusterIdMs | State::WriteGetBlkInfo
        ) {
            return;
        }
        let Some(client) = &self.dedup else { return };
        if !ctx.route.as_ref().map(|r| r.need_dedup).unwrap_or(false) {
            return;
        }

        let mut dctx = DedupContext::default();
        let data = ctx.req.data.clone();
        let found = match client.fetch(&mut dctx, &data).await {
            Ok(found) => found,
            Err(_) => false,
        };
        match client.classify_write(found, &dctx, &ctx.req.suffix) {
            WriteLookup::Candidate(fsname) => {
                ctx.cluster_id = fsname.cluster_id;
                if let Some(seg) = ctx.segments.first_mut() {
                    seg.info.block_id = fsname.block_id;
                    seg.info.file_id = fsname.file_id();
                }
                ctx.fsname = Some(fsname);
                ctx.is_stat_dup_file = true;
                ctx.use_dedup = true;
            }
            WriteLookup::Store => ctx.use_dedup = true,
            WriteLookup::Skip => ctx.use_dedup = false,
        }
        ctx.dedup = Some(dctx);
    }

    /// Decide the outcome of statting a dedup candidate: a live file bumps
    /// the reference count; anything else restarts as a plain write.
    async fn after_dup_stat(
        &self,
        ctx: &mut OperationContext,
        result: Result<StepOutcome>,
    ) -> Result<()> {
        let healthy = match result {
            Ok(_) => ctx
                .file_stat
                .map(|s| s.flag() == FileFlag::Normal)
                .unwrap_or(false),
            Err(err) if err.is_recoverable() || matches!(err, Error::TierStatus { .. }) => {
                debug!(error = %err, "dedup candidate stat failed");
                false
            }
            Err(err) => return Err(err),
        };

        if healthy {
            if let (Some(client), Some(dctx)) = (&self.dedup, ctx.dedup.as_mut()) {
                dctx.ref_count += 1;
                let data = ctx.req.data.clone();
                match client.store(dctx, &data).await {
                    Ok(()) => {
                        ctx.state = State::WriteDone;
                        return Ok(());
                    }
                    Err(err) => {
                        debug!(error = %err, "dedup ref-count bump rejected");
                    }
                }
            }
        }

        // fall back to the non-deduplicated path: restart the write sub-step
        warn!(error = %crate::dedup::inconsistent("candidate file unusable"), "dedup disabled for this write");
        ctx.is_stat_dup_file = false;
        ctx.use_dedup = false;
        ctx.fsname = None;
        ctx.file_stat = None;
        if let Some(seg) = ctx.segments.first_mut() {
            seg.info.block_id = 0;
            seg.info.file_id = 0;
            seg.ds_list.clear();
        }
        ctx.ns_addr = None;
        ctx.state = if ctx.req.file_path.is_empty() {
            State::WriteClusterIdNs
        } else {
            State::WriteClusterIdMs
        };
        Ok(())
    }

    /// Remove-path dedup decision once the file's bytes were read back.
    async fn after_remove_content(&self, ctx: &mut OperationContext) -> Result<()> {
        let (Some(client), Some(target)) = (&self.dedup, ctx.fsname.clone()) else {
            ctx.state = State::RemoveDeleteData;
            self.reset_for_unlink(ctx);
            return Ok(());
        };
        let content: Bytes = concat_bytes(&ctx.out_data);
        let mut dctx = ctx.dedup.take().unwrap_or_default();
        let found = client.fetch(&mut dctx, &content).await.unwrap_or(false);
        let lookup = client.classify_remove(found, &mut dctx, &target, ctx.req.unlink_type);
        match lookup {
            RemoveLookup::KeepData => {
                // other names still reference the bytes; a failed counter
                // update is tolerated, the remove still succeeds
                if let Err(err) = client.store(&mut dctx, &content).await {
                    warn!(error = %err, "dedup ref-count decrement not stored");
                }
                ctx.dedup = Some(dctx);
                ctx.state = State::RemoveDone;
                return Ok(());
            }
            RemoveLookup::DeleteThenUnlink => {
                if let Err(err) = client.remove(&mut dctx, &content).await {
                    warn!(error = %err, "dedup entry delete failed, unlinking anyway");
                }
            }
            RemoveLookup::UnlinkOnly => {}
        }
        ctx.dedup = Some(dctx);
        self.reset_for_unlink(ctx);
        ctx.state = State::RemoveDeleteData;
        Ok(())
    }

    fn reset_for_unlink(&self, ctx: &mut OperationContext) {
        ctx.segment_index = 0;
        ctx.out_data.clear();
    }

    /// After a plain write succeeds, publish the content mapping.
    async fn store_write_mapping(&self, ctx: &mut OperationContext) {
        if !ctx.use_dedup {
            return;
        }
        let (Some(client), Some(dctx), Some(fsname)) =
            (&self.dedup, ctx.dedup.as_mut(), ctx.fsname.as_ref())
        else {
            return;
        };
        dctx.ref_count = 1;
        dctx.file_name = fsname.encode(&ctx.req.suffix);
        let data = ctx.req.data.clone();
        if let Err(err) = client.store(dctx, &data).await {
            warn!(error = %err, "content mapping not stored, file written without dedup");
        }
    }

    // --- group probes ----------------------------------------------------

    fn apply_group_probe(&self, ctx: &mut OperationContext) {
        let Some(ns) = ctx.ns_addr else { return };
        if ctx.group_count > 0 && ctx.group_seq >= 0 {
            self.routes
                .set_group_info(&ctx.req.app_key, ns, ctx.group_count, ctx.group_seq);
            if let Some(info) = self.routes.lookup(&ctx.req.app_key) {
                ctx.route = Some(info);
            }
        }
        // the probe endpoint is not necessarily the unlink endpoint
        ctx.ns_addr = None;
    }

    // --- completion ------------------------------------------------------

    fn output(&self, ctx: &mut OperationContext) -> Result<OpOutput> {
        Ok(match ctx.req.action {
            Action::Read => OpOutput::Read {
                data: concat_bytes(&ctx.out_data),
                stat: ctx.file_stat,
                holes: std::mem::take(&mut ctx.file_holes),
            },
            Action::Write => {
                let fsname = ctx
                    .fsname
                    .as_ref()
                    .ok_or_else(|| Error::InvalidState("write finished without a name".into()))?;
                OpOutput::Written {
                    file_name: fsname.encode(&ctx.req.suffix),
                    deduplicated: ctx.is_stat_dup_file,
                }
            }
            Action::Remove | Action::RemoveDir => OpOutput::Removed,
            Action::Stat => OpOutput::Stat(
                ctx.file_stat
                    .ok_or_else(|| Error::InvalidState("stat finished without data".into()))?,
            ),
            Action::LsFile | Action::LsDir => OpOutput::List {
                entries: std::mem::take(&mut ctx.entries),
            },
            Action::CreateFile | Action::CreateDir | Action::MoveFile | Action::MoveDir => {
                OpOutput::ActionDone
            }
            Action::Keepalive => OpOutput::KeepaliveDone,
            Action::GetAppId => {
                OpOutput::AppId(ctx.route.as_ref().map(|r| r.app_id).unwrap_or_default())
            }
        })
    }

    fn account(&self, ctx: &OperationContext, started: Instant, success: bool) {
        let kind = match ctx.req.action {
            Action::Read => OperKind::Read,
            Action::Write => OperKind::Write,
            Action::Remove => OperKind::Unlink,
            _ => return,
        };
        let bytes = match ctx.req.action {
            Action::Read => ctx.out_data.iter().map(|b| b.len() as u64).sum(),
            Action::Write => ctx.req.data.len() as u64,
            _ => 0,
        };
        self.routes.record_stat(
            &ctx.req.app_key,
            kind,
            bytes,
            started.elapsed().as_millis() as u64,
            success,
        );
    }
}

pub(crate) fn terminal_for(action: Action) -> State {
    match action {
        Action::Read => State::ReadDone,
        Action::Write => State::WriteDone,
        Action::Remove => State::RemoveDone,
        Action::Stat => State::StatDone,
        Action::Keepalive | Action::GetAppId => State::RcDone,
        _ => State::ActionDone,
    }
}

fn concat_bytes(parts: &[Bytes]) -> Bytes {
    match parts.len() {
        0 => Bytes::new(),
        1 => parts[0].clone(),
        _ => {
            let mut buf = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
            for part in parts {
                buf.extend_from_slice(part);
            }
            buf.freeze()
        }
    }
}
