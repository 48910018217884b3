//! Operation contexts and the per-action state model

pub mod child;
pub mod driver;

use std::sync::Arc;

use bytes::Bytes;

use crate::dedup::DedupContext;
use crate::error::Error;
use crate::fsname::FsName;
use crate::route::RouteInfo;
use crate::types::{CustomFileInfo, DirEntry, FileStat, ServerAddr, UnlinkType};

/// Logical file operations the engine performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Remove,
    Stat,
    LsFile,
    LsDir,
    CreateFile,
    CreateDir,
    MoveFile,
    MoveDir,
    RemoveDir,
    Keepalive,
    GetAppId,
}

impl Action {
    /// Whether the action addresses the custom (path-based) namespace and
    /// therefore the RS/MS tiers.
    pub fn is_custom(self) -> bool {
        matches!(
            self,
            Action::LsFile
                | Action::LsDir
                | Action::CreateFile
                | Action::CreateDir
                | Action::MoveFile
                | Action::MoveDir
                | Action::RemoveDir
        )
    }
}

/// Driver states. Transitions only move forward; every action ends in its
/// `*Done` state or short-circuits to finalize on an unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    // read
    ReadStart,
    ReadGetMetaTable,
    ReadGetFragInfo,
    ReadGetBlkInfo,
    ReadData,
    ReadDone,
    // write
    WriteStart,
    WriteGetMetaTable,
    WriteClusterIdMs,
    WriteGetGroupCount,
    WriteGetGroupSeq,
    WriteClusterIdNs,
    WriteGetBlkInfo,
    WriteStatDupFile,
    WriteCreateFileName,
    WriteData,
    WriteCloseFile,
    WriteMs,
    WriteDone,
    WriteDeleteData,
    // remove
    RemoveStart,
    RemoveGetMetaTable,
    RemoveGetFragInfo,
    RemoveGetGroupCount,
    RemoveGetGroupSeq,
    RemoveGetBlkInfo,
    RemoveStatFile,
    RemoveReadMetaSegment,
    RemoveDeleteData,
    RemoveNotifyMs,
    RemoveDone,
    // stat
    StatStart,
    StatGetBlkInfo,
    StatFile,
    StatDone,
    // custom-namespace actions (create/move/remove dir+file, ls)
    ActionStart,
    ActionGetMetaTable,
    ActionProcess,
    ActionDone,
    // rc-only actions (keepalive, get-appid)
    RcStart,
    RcDone,
}

impl State {
    pub fn initial(action: Action) -> State {
        match action {
            Action::Read => State::ReadStart,
            Action::Write => State::WriteStart,
            Action::Remove => State::RemoveStart,
            Action::Stat => State::StatStart,
            Action::Keepalive | Action::GetAppId => State::RcStart,
            _ => State::ActionStart,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::ReadDone
                | State::WriteDone
                | State::RemoveDone
                | State::StatDone
                | State::ActionDone
                | State::RcDone
        )
    }
}

/// What a response parser tells the driver to do next
#[derive(Debug)]
pub enum StepOutcome {
    /// Advance to the given state
    Next(State),
    /// Re-enter the current state (another round trip is needed)
    Stay,
    /// The operation is complete
    Done,
}

/// Populated request context handed over by the front-end collaborator
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub action: Action,
    pub app_key: String,
    pub user_id: u64,
    /// Custom-namespace path (MS tier operations)
    pub file_path: String,
    /// Destination path for move actions
    pub second_path: String,
    /// Raw-namespace file name (read/stat/remove of T/L files)
    pub file_name: String,
    pub suffix: String,
    pub offset: i64,
    pub length: u64,
    /// Write payload
    pub data: Bytes,
    pub unlink_type: UnlinkType,
    pub check_file_hole: bool,
    pub large_file: bool,
}

impl Default for RequestCtx {
    fn default() -> Self {
        Self {
            action: Action::Stat,
            app_key: String::new(),
            user_id: 0,
            file_path: String::new(),
            second_path: String::new(),
            file_name: String::new(),
            suffix: String::new(),
            offset: 0,
            length: 0,
            data: Bytes::new(),
            unlink_type: UnlinkType::Delete,
            check_file_hole: false,
            large_file: false,
        }
    }
}

/// Identity and location of one file fragment inside a storage block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentInfo {
    pub block_id: u32,
    pub file_id: u64,
    pub offset: i64,
    pub size: u32,
    pub crc: u32,
}

/// One physical fragment plus its per-operation bookkeeping
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub info: SegmentInfo,
    /// Sub-range of the fragment the caller actually asked for; differs from
    /// the fragment bounds only on the first and last segment of a read
    /// window.
    pub oper_offset: u64,
    pub oper_size: u64,
    /// DS replicas holding the block, with a rotation cursor for retries
    pub ds_list: Vec<ServerAddr>,
    pub ds_index: usize,
    /// Write payload slice or read result for this segment
    pub data: Bytes,
    /// DS-assigned lease for the write/close pair
    pub file_number: u64,
}

impl Segment {
    pub fn current_ds(&self) -> Option<ServerAddr> {
        if self.ds_list.is_empty() {
            return None;
        }
        Some(self.ds_list[self.ds_index % self.ds_list.len()])
    }

    /// Rotate to another replica for a retry.
    pub fn next_ds(&mut self) {
        if !self.ds_list.is_empty() {
            self.ds_index = (self.ds_index + 1) % self.ds_list.len();
        }
    }
}

/// A skipped byte range discovered during read-window resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHole {
    pub offset: u64,
    pub length: u64,
}

/// Client-visible result of a finished operation
#[derive(Debug, Clone)]
pub enum OpOutput {
    Read {
        data: Bytes,
        stat: Option<FileStat>,
        holes: Vec<FileHole>,
    },
    Written {
        file_name: String,
        deduplicated: bool,
    },
    Removed,
    Stat(FileStat),
    List {
        entries: Vec<DirEntry>,
    },
    ActionDone,
    AppId(u64),
    KeepaliveDone,
}

/// One logical file operation in flight.
///
/// Children (see [`child`]) are shallow per-segment copies that own their
/// buffer and peer but share the parent's route snapshot.
#[derive(Debug)]
pub struct OperationContext {
    pub req: RequestCtx,
    pub state: State,
    pub route: Option<Arc<RouteInfo>>,

    pub segments: Vec<Segment>,
    pub segment_index: usize,
    pub last_write_segment_index: usize,
    pub still_have: bool,
    pub is_first_segment: bool,

    /// Running absolute offset / remaining length for hole accounting
    pub file_offset: u64,
    pub left_length: u64,
    pub file_holes: Vec<FileHole>,

    pub cluster_id: u32,
    pub fsname: Option<FsName>,
    pub file_stat: Option<FileStat>,

    /// RS-provided meta server table (custom namespace)
    pub meta_table: Vec<ServerAddr>,
    pub meta_table_version: u64,

    pub dedup: Option<DedupContext>,
    pub use_dedup: bool,
    pub is_stat_dup_file: bool,

    pub retry_budget: u32,
    pub last_error: Option<Error>,

    /// NS endpoint the operation resolved, kept for block-cache scoping
    pub ns_addr: Option<ServerAddr>,
    pub read_cluster_hint: usize,
    /// NS group topology for unlink routing; -1 until fetched
    pub group_count: i32,
    pub group_seq: i32,

    /// Assembled read data, in segment order
    pub out_data: Vec<Bytes>,
    /// Directory entries accumulated across ls pages
    pub entries: Vec<DirEntry>,
    pub last_file_path: String,
    pub last_file_pid: i64,

    /// Whether the next DS read should request the file-metadata tail
    pub want_stat_tail: bool,

    /// True for a per-segment child context; children never nest
    pub is_child: bool,
}

impl OperationContext {
    pub fn new(req: RequestCtx, retry_budget: u32) -> Self {
        let state = State::initial(req.action);
        let left_length = req.length;
        let file_offset = req.offset.max(0) as u64;
        Self {
            req,
            state,
            route: None,
            segments: Vec::new(),
            segment_index: 0,
            last_write_segment_index: 0,
            still_have: false,
            is_first_segment: true,
            file_offset,
            left_length,
            file_holes: Vec::new(),
            cluster_id: 0,
            fsname: None,
            file_stat: None,
            meta_table: Vec::new(),
            meta_table_version: 0,
            dedup: None,
            use_dedup: false,
            is_stat_dup_file: false,
            retry_budget,
            last_error: None,
            ns_addr: None,
            read_cluster_hint: 0,
            group_count: -1,
            group_seq: -1,
            out_data: Vec::new(),
            entries: Vec::new(),
            last_file_path: String::new(),
            last_file_pid: 0,
            want_stat_tail: false,
            is_child: false,
        }
    }

    /// Meta server responsible for this operation's (app, user) pair.
    pub fn select_meta_server(&self) -> Option<ServerAddr> {
        if self.meta_table.is_empty() {
            return None;
        }
        let app_id = self.route.as_ref().map(|r| r.app_id).unwrap_or_default();
        let idx = (app_id.wrapping_add(self.req.user_id)) as usize % self.meta_table.len();
        Some(self.meta_table[idx])
    }

    /// The segment currently being worked.
    pub fn current_segment(&self) -> Option<&Segment> {
        self.segments.get(self.segment_index)
    }

    pub fn current_segment_mut(&mut self) -> Option<&mut Segment> {
        self.segments.get_mut(self.segment_index)
    }

    /// Record a directory entry batch bookmark for the follow-up request.
    pub fn mark_ls_continuation(&mut self) {
        if let Some(last) = self.entries.last() {
            self.last_file_path = last.name.clone();
            self.last_file_pid = last.info.pid;
        }
    }
}

/// Convenience constructor for list metadata rows.
pub fn dir_entry(name: String, info: CustomFileInfo) -> DirEntry {
    DirEntry { name, info }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_states() {
        assert_eq!(State::initial(Action::Read), State::ReadStart);
        assert_eq!(State::initial(Action::Write), State::WriteStart);
        assert_eq!(State::initial(Action::Remove), State::RemoveStart);
        assert_eq!(State::initial(Action::Stat), State::StatStart);
        assert_eq!(State::initial(Action::LsDir), State::ActionStart);
        assert_eq!(State::initial(Action::Keepalive), State::RcStart);
    }

    #[test]
    fn test_terminal_states() {
        assert!(State::ReadDone.is_terminal());
        assert!(State::ActionDone.is_terminal());
        assert!(!State::ReadData.is_terminal());
        assert!(!State::WriteCloseFile.is_terminal());
    }

    #[test]
    fn test_segment_ds_rotation() {
        let mut seg = Segment::default();
        assert!(seg.current_ds().is_none());

        seg.ds_list = vec![
            ServerAddr::from_packed(1 | (3200u64 << 32)),
            ServerAddr::from_packed(2 | (3200u64 << 32)),
        ];
        let first = seg.current_ds().unwrap();
        seg.next_ds();
        let second = seg.current_ds().unwrap();
        assert_ne!(first, second);
        seg.next_ds();
        assert_eq!(seg.current_ds().unwrap(), first);
    }

    #[test]
    fn test_meta_server_selection_is_stable() {
        let mut ctx = OperationContext::new(RequestCtx::default(), 2);
        assert!(ctx.select_meta_server().is_none());
        ctx.meta_table = vec![
            ServerAddr::from_packed(1),
            ServerAddr::from_packed(2),
            ServerAddr::from_packed(3),
        ];
        let a = ctx.select_meta_server();
        let b = ctx.select_meta_server();
        assert_eq!(a, b);
    }

    #[test]
    fn test_custom_action_classification() {
        assert!(Action::LsDir.is_custom());
        assert!(Action::MoveFile.is_custom());
        assert!(!Action::Read.is_custom());
        assert!(!Action::Keepalive.is_custom());
    }
}
