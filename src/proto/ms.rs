//! Meta-server messages: fragment maps, path actions, directory listing
//!
//! The read-meta parser owns read-window resolution: clamping the first and
//! last segment to the requested byte range and accounting file holes.

use tracing::debug;

use crate::codec::{Frame, MessageType, WireReader, WireWriter};
use crate::error::{Error, ProtocolError, Result};
use crate::op::{Action, FileHole, OperationContext, Segment, SegmentInfo, State, StepOutcome};
use crate::proto::{require, require_status_ok};
use crate::types::CustomFileInfo;

/// Fragment records committed per write-meta message, bounding message size
pub const MAX_WRITE_FRAGS: usize = 8;

const SPLIT_FLAG: u32 = 1 << 31;

const ACTION_CREATE_DIR: u32 = 1;
const ACTION_CREATE_FILE: u32 = 2;
const ACTION_REMOVE_DIR: u32 = 3;
const ACTION_REMOVE_FILE: u32 = 4;
const ACTION_MOVE_DIR: u32 = 5;
const ACTION_MOVE_FILE: u32 = 6;

const FILE_TYPE_FILE: u8 = 1;
const FILE_TYPE_DIR: u8 = 2;

fn put_msg_prefix(w: &mut WireWriter, ctx: &OperationContext, path: &str) {
    let app_id = ctx.route.as_ref().map(|r| r.app_id).unwrap_or_default();
    w.put_u64(app_id);
    w.put_u64(ctx.req.user_id);
    w.put_string(path.as_bytes());
}

/// Request the fragment map covering the operation's remaining range; an
/// unset range (removes) asks for the whole file.
pub fn build_read_meta(ctx: &mut OperationContext) -> Result<Frame> {
    let path = ctx.req.file_path.clone();
    let size = if ctx.left_length == 0 {
        u64::MAX
    } else {
        ctx.left_length
    };
    let mut w = WireWriter::new();
    put_msg_prefix(&mut w, ctx, &path);
    w.put_i64(ctx.file_offset as i64);
    w.put_u64(size);
    Ok(Frame::request(MessageType::ReadFilepath, w.into_bytes()))
}

/// A zero-length read-meta probe; only the cluster id in the response is
/// consumed.
pub fn build_cluster_id_probe(ctx: &mut OperationContext) -> Result<Frame> {
    let path = ctx.req.file_path.clone();
    let mut w = WireWriter::new();
    put_msg_prefix(&mut w, ctx, &path);
    w.put_i64(0);
    w.put_u64(0);
    Ok(Frame::request(MessageType::ReadFilepath, w.into_bytes()))
}

pub fn parse_cluster_id_probe(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require(frame, MessageType::RespReadFilepath)?;
    let mut r = WireReader::new(&frame.payload);
    let _still_have = r.get_u8()?;
    ctx.cluster_id = r.get_u32()?;
    Ok(StepOutcome::Next(State::WriteGetBlkInfo))
}

/// Parse a fragment map and, for reads, resolve the read window over it.
pub fn parse_read_meta(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require(frame, MessageType::RespReadFilepath)?;
    let mut r = WireReader::new(&frame.payload);
    let still_have = r.get_u8()? != 0;
    ctx.cluster_id = r.get_u32()?;
    let raw_count = r.get_u32()?;
    let has_split = raw_count & SPLIT_FLAG != 0;
    let count = (raw_count & !SPLIT_FLAG) as usize;

    if count == 0 {
        return Err(Error::TierStatus {
            code: crate::error::EXIT_META_NOT_FOUND,
            message: "no fragments for path".into(),
        });
    }

    ctx.segments.clear();
    for _ in 0..count {
        let info = SegmentInfo {
            block_id: r.get_u32()?,
            file_id: r.get_u64()?,
            offset: r.get_i64()?,
            size: r.get_u32()?,
            crc: 0,
        };
        ctx.segments.push(Segment {
            info,
            oper_size: info.size as u64,
            ..Segment::default()
        });
    }
    ctx.segment_index = 0;
    ctx.still_have = still_have || has_split;

    if ctx.req.action == Action::Read && resolve_read_window(ctx)? {
        // the remaining range is all holes; nothing left to read
        return Ok(StepOutcome::Done);
    }

    Ok(StepOutcome::Next(match ctx.state {
        State::RemoveGetFragInfo => State::RemoveGetBlkInfo,
        _ => State::ReadGetBlkInfo,
    }))
}

/// Clamp the segment list to the requested window and account holes.
///
/// Returns true when the remaining request length is satisfied without any
/// segment data (the window lies entirely in holes).
pub fn resolve_read_window(ctx: &mut OperationContext) -> Result<bool> {
    if ctx.segments.is_empty() {
        return Ok(true);
    }

    // the first segment of the whole read recovers the intra-fragment offset
    if ctx.is_first_segment {
        let first = &mut ctx.segments[0];
        let mut oper_offset = (ctx.req.offset.max(0) as u64).max(first.info.offset.max(0) as u64);
        if first.info.offset > 0 {
            oper_offset %= first.info.offset as u64;
        }
        if oper_offset > first.info.size as u64 {
            return Err(ProtocolError::MalformedField("request offset beyond fragment").into());
        }
        first.oper_offset = oper_offset;
        first.oper_size = first.info.size as u64 - oper_offset;
        ctx.is_first_segment = false;
    }

    // the last segment is clamped to the requested end offset
    if !ctx.still_have {
        let end_offset = ctx.file_offset + ctx.left_length;
        if let Some(last) = ctx.segments.last_mut() {
            let last_start = last.info.offset.max(0) as u64 + last.oper_offset;
            if end_offset > last_start {
                last.oper_size = (end_offset - last_start).min(last.info.size as u64);
            } else {
                // requested end lies inside a hole before this fragment
                last.oper_size = 0;
            }
        }
    }

    if ctx.req.check_file_hole {
        let mut file_offset = ctx.file_offset;
        let mut left = ctx.left_length;
        for seg in &ctx.segments {
            let seg_offset = seg.info.offset.max(0) as u64;
            if file_offset < seg_offset {
                let hole_len = left.min(seg_offset - file_offset);
                ctx.file_holes.push(FileHole {
                    offset: file_offset,
                    length: hole_len,
                });
                debug!(offset = file_offset, length = hole_len, "file hole");
                file_offset += hole_len;
                left -= hole_len;
                if left == 0 {
                    break;
                }
            }
            file_offset += seg.oper_size;
            left = left.saturating_sub(seg.oper_size);
            if left == 0 {
                break;
            }
        }
        ctx.file_offset = file_offset;
        ctx.left_length = left;
    }

    // fragments fully past the requested end contribute nothing
    ctx.segments.retain(|s| s.oper_size > 0);
    Ok(ctx.segments.is_empty())
}

/// Commit fragment metadata written since the last commit. The cursor
/// advances when the message is built; a failed send must restart the whole
/// write sub-step rather than rebuild from the old cursor.
pub fn build_write_meta(ctx: &mut OperationContext) -> Result<Frame> {
    let pending = ctx
        .segment_index
        .saturating_sub(ctx.last_write_segment_index)
        .min(MAX_WRITE_FRAGS);
    if pending == 0 {
        return Err(Error::InvalidState("no fragments to commit".into()));
    }
    let start = ctx.last_write_segment_index;
    let path = ctx.req.file_path.clone();

    let mut w = WireWriter::new();
    put_msg_prefix(&mut w, ctx, &path);
    w.put_u64(ctx.meta_table_version);
    w.put_u32(ctx.cluster_id);
    let mut frag_count = pending as u32;
    if ctx.req.large_file {
        frag_count |= SPLIT_FLAG;
    }
    w.put_u32(frag_count);
    for seg in &ctx.segments[start..start + pending] {
        w.put_u32(seg.info.block_id);
        w.put_u64(seg.info.file_id);
        w.put_i64(seg.info.offset);
        w.put_u32(seg.info.size);
    }
    ctx.last_write_segment_index += pending;
    debug!(
        committed = ctx.last_write_segment_index,
        total = ctx.segment_index,
        "write meta commit"
    );
    Ok(Frame::request(MessageType::WriteFilepath, w.into_bytes()))
}

pub fn parse_write_meta(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require_status_ok(frame)?;
    if ctx.last_write_segment_index < ctx.segment_index {
        return Ok(StepOutcome::Stay);
    }
    Ok(StepOutcome::Done)
}

/// One page of a directory (or single-file) listing. Follow-up pages carry
/// the last seen name and parent id as the continuation key.
pub fn build_ls(ctx: &mut OperationContext) -> Result<Frame> {
    let (path, pid) = if ctx.last_file_path.is_empty() {
        (ctx.req.file_path.clone(), -1i64)
    } else {
        (ctx.last_file_path.clone(), ctx.last_file_pid)
    };
    let app_id = ctx.route.as_ref().map(|r| r.app_id).unwrap_or_default();
    let mut w = WireWriter::new();
    w.put_u64(app_id);
    w.put_u64(ctx.req.user_id);
    w.put_i64(pid);
    w.put_string(path.as_bytes());
    w.put_u8(if ctx.req.action == Action::LsFile {
        FILE_TYPE_FILE
    } else {
        FILE_TYPE_DIR
    });
    Ok(Frame::request(MessageType::LsFilepath, w.into_bytes()))
}

/// Parse listing records incrementally. A record cut off mid-way rewinds to
/// the last complete one; the remainder arrives with the next page.
pub fn parse_ls(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require(frame, MessageType::RespLsFilepath)?;
    let mut r = WireReader::new(&frame.payload);
    let still_have = r.get_u8()? != 0;
    let count = r.get_u32()? as usize;

    if count == 0 {
        if ctx.req.action == Action::LsFile {
            return Err(Error::TierStatus {
                code: crate::error::EXIT_TARGET_EXIST,
                message: format!("no such file: {}", ctx.req.file_path),
            });
        }
        return Ok(StepOutcome::Done);
    }

    let mut parsed = 0;
    for _ in 0..count {
        let mark = r.position();
        let record = (|| -> std::result::Result<_, ProtocolError> {
            let name = r.get_string_owned()?;
            let info = CustomFileInfo {
                pid: r.get_i64()?,
                id: r.get_i64()?,
                create_time: r.get_u32()?,
                modify_time: r.get_u32()?,
                size: r.get_u64()?,
                ver_no: r.get_u16()?,
            };
            Ok((name, info))
        })();
        match record {
            Ok((name, info)) => {
                ctx.entries.push(crate::op::dir_entry(name, info));
                parsed += 1;
            }
            Err(ProtocolError::Truncated { .. }) => {
                r.rewind_to(mark);
                break;
            }
            Err(other) => return Err(other.into()),
        }
    }

    if parsed < count || still_have {
        ctx.mark_ls_continuation();
        return Ok(StepOutcome::Stay);
    }
    Ok(StepOutcome::Done)
}

fn action_code(action: Action) -> Result<u32> {
    Ok(match action {
        Action::CreateDir => ACTION_CREATE_DIR,
        Action::CreateFile => ACTION_CREATE_FILE,
        Action::RemoveDir => ACTION_REMOVE_DIR,
        Action::Remove => ACTION_REMOVE_FILE,
        Action::MoveDir => ACTION_MOVE_DIR,
        Action::MoveFile => ACTION_MOVE_FILE,
        other => {
            return Err(Error::InvalidState(format!(
                "no filepath action for {other:?}"
            )))
        }
    })
}

/// Path-level action: create/remove/move a file or directory, and the
/// remove path's final mapping drop.
pub fn build_action(ctx: &mut OperationContext) -> Result<Frame> {
    let code = action_code(ctx.req.action)?;
    let path = ctx.req.file_path.clone();
    let second = ctx.req.second_path.clone();
    let app_id = ctx.route.as_ref().map(|r| r.app_id).unwrap_or_default();
    let mut w = WireWriter::new();
    w.put_u64(app_id);
    w.put_u64(ctx.req.user_id);
    w.put_u32(code);
    w.put_string(path.as_bytes());
    w.put_string(second.as_bytes());
    Ok(Frame::request(MessageType::FilepathAction, w.into_bytes()))
}

pub fn parse_action(_ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require_status_ok(frame)?;
    Ok(StepOutcome::Done)
}

// =============================================================================
// Tests
// =============================================================================
