//! Name-server messages: block resolution and control commands

use tracing::debug;

use crate::codec::{Frame, MessageType, WireReader, WireWriter};
use crate::error::{ProtocolError, Result};
use crate::op::{Action, OperationContext, State, StepOutcome};
use crate::proto::{require, require_status_ok};
use crate::types::{OpenMode, ServerAddr};

/// At most this many blocks are resolved per round trip.
pub const MAX_BATCH_COUNT: usize = 8;

const CMD_GET_CLUSTER_ID: i32 = 20;
const CMD_GET_GROUP_COUNT: i32 = 22;
const CMD_GET_GROUP_SEQ: i32 = 23;

fn open_mode_for(ctx: &OperationContext) -> OpenMode {
    let mut mode = match ctx.req.action {
        Action::Write => OpenMode::WRITE.union(OpenMode::CREATE),
        Action::Remove => OpenMode::WRITE,
        Action::Stat => OpenMode::READ.union(OpenMode::STAT),
        _ => OpenMode::READ,
    };
    if ctx.req.large_file {
        mode = mode.union(OpenMode::LARGE);
    }
    mode
}

/// Indices of segments still lacking a replica list, capped at the batch
/// limit. For writes the block is NS-assigned, so a zero block id is normal.
fn unresolved(ctx: &OperationContext) -> Vec<usize> {
    ctx.segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.ds_list.is_empty())
        .map(|(i, _)| i)
        .take(MAX_BATCH_COUNT)
        .collect()
}

/// Resolve replica lists for the next batch of blocks.
pub fn build_get_block_info(ctx: &mut OperationContext) -> Result<Frame> {
    let mode = open_mode_for(ctx);
    let pending = unresolved(ctx);
    if pending.len() <= 1 {
        let block_id = pending
            .first()
            .map(|&i| ctx.segments[i].info.block_id)
            .unwrap_or(0);
        let mut w = WireWriter::with_capacity(12);
        w.put_u32(mode.0);
        w.put_u32(block_id);
        w.put_u32(0); // no preferred data servers
        return Ok(Frame::request(MessageType::GetBlockInfo, w.into_bytes()));
    }

    let mut w = WireWriter::with_capacity(8 + pending.len() * 4);
    w.put_u32(mode.0);
    w.put_u32(pending.len() as u32);
    for idx in pending {
        w.put_u32(ctx.segments[idx].info.block_id);
    }
    Ok(Frame::request(MessageType::BatchGetBlockInfo, w.into_bytes()))
}

fn apply_block(ctx: &mut OperationContext, block_id: u32, ds_list: Vec<ServerAddr>) {
    // a write gets its block assigned here; reads match on block id
    if let Some(seg) = ctx
        .segments
        .iter_mut()
        .find(|s| s.ds_list.is_empty() && (s.info.block_id == block_id || s.info.block_id == 0))
    {
        if seg.info.block_id == 0 {
            seg.info.block_id = block_id;
        }
        seg.ds_index = 0;
        seg.ds_list = ds_list;
    }
}

fn next_after_block_info(ctx: &OperationContext) -> State {
    match ctx.state {
        State::ReadGetBlkInfo => State::ReadData,
        State::WriteGetBlkInfo => {
            if ctx.is_stat_dup_file {
                State::WriteStatDupFile
            } else {
                State::WriteCreateFileName
            }
        }
        State::RemoveGetBlkInfo => {
            if ctx.is_stat_dup_file {
                State::RemoveStatFile
            } else {
                State::RemoveDeleteData
            }
        }
        _ => State::StatFile,
    }
}

/// Parse a single or batch block-info response.
pub fn parse_get_block_info(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    match frame.msg_type {
        MessageType::BatchSetBlockInfo => {
            require(frame, MessageType::BatchSetBlockInfo)?;
            let mut r = WireReader::new(&frame.payload);
            let block_count = r.get_u32()?;
            for _ in 0..block_count {
                let block_id = r.get_u32()?;
                let ds_count = r.get_u32()? as usize;
                let mut ds_list = Vec::with_capacity(ds_count);
                for _ in 0..ds_count {
                    ds_list.push(ServerAddr::from_packed(r.get_u64()?));
                }
                apply_block(ctx, block_id, ds_list);
            }
        }
        _ => {
            require(frame, MessageType::SetBlockInfo)?;
            let mut r = WireReader::new(&frame.payload);
            let block_id = r.get_u32()?;
            let ds_count = r.get_u32()? as usize;
            if ds_count == 0 {
                return Err(ProtocolError::MalformedField("block with no data servers").into());
            }
            let mut ds_list = Vec::with_capacity(ds_count);
            for _ in 0..ds_count {
                ds_list.push(ServerAddr::from_packed(r.get_u64()?));
            }
            apply_block(ctx, block_id, ds_list);
        }
    }

    if !unresolved(ctx).is_empty() {
        return Ok(StepOutcome::Stay);
    }
    Ok(StepOutcome::Next(next_after_block_info(ctx)))
}

fn build_client_cmd(cmd: i32) -> Frame {
    let mut w = WireWriter::with_capacity(28);
    w.put_i32(cmd);
    w.put_i64(0);
    w.put_i32(0);
    w.put_i32(0);
    w.put_i64(0);
    Frame::request(MessageType::ClientCmd, w.into_bytes())
}

/// Control-command responses carry their value either in the status text or,
/// when the text is empty, in the status code.
fn cmd_value(frame: &Frame) -> Result<i64> {
    let status = require_status_ok(frame).or_else(|err| match err {
        // a non-zero code is the value for these commands, not a failure
        crate::error::Error::TierStatus { code, message } => Ok(crate::codec::StatusMsg {
            code,
            message,
        }),
        other => Err(other),
    })?;
    let digits: String = status
        .message
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if !digits.is_empty() {
        if let Ok(v) = digits.parse::<i64>() {
            return Ok(v);
        }
    }
    Ok(status.code as i64)
}

pub fn build_get_cluster_id(_ctx: &mut OperationContext) -> Result<Frame> {
    Ok(build_client_cmd(CMD_GET_CLUSTER_ID))
}

pub fn parse_get_cluster_id(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    ctx.cluster_id = cmd_value(frame)? as u32;
    debug!(cluster_id = ctx.cluster_id, "cluster id resolved");

    // group topology is only needed when the route carries unlink groups
    // whose counts are still unknown
    let needs_groups = ctx
        .route
        .as_ref()
        .map(|r| {
            !r.unlink_cluster_groups.is_empty()
                && r.unlink_cluster_groups.iter().any(|g| g.group_count <= 0)
        })
        .unwrap_or(false);
    Ok(StepOutcome::Next(if needs_groups {
        State::WriteGetGroupCount
    } else {
        State::WriteGetBlkInfo
    }))
}

pub fn build_get_group_count(_ctx: &mut OperationContext) -> Result<Frame> {
    Ok(build_client_cmd(CMD_GET_GROUP_COUNT))
}

pub fn parse_get_group_count(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    ctx.group_count = cmd_value(frame)? as i32;
    Ok(StepOutcome::Next(match ctx.state {
        State::RemoveGetGroupCount => State::RemoveGetGroupSeq,
        _ => State::WriteGetGroupSeq,
    }))
}

pub fn build_get_group_seq(_ctx: &mut OperationContext) -> Result<Frame> {
    Ok(build_client_cmd(CMD_GET_GROUP_SEQ))
}

pub fn parse_get_group_seq(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    ctx.group_seq = cmd_value(frame)? as i32;
    Ok(StepOutcome::Next(match ctx.state {
        State::RemoveGetGroupSeq => State::RemoveGetBlkInfo,
        _ => State::WriteGetBlkInfo,
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StatusMsg;
    use crate::op::{RequestCtx, Segment, SegmentInfo};
    use assert_matches::assert_matches;

    fn ctx(action: Action, state: State, blocks: &[u32]) -> OperationContext {
        let mut ctx = OperationContext::new(
            RequestCtx {
                action,
                ..RequestCtx::default()
            },
            2,
        );
        ctx.state = state;
        ctx.segments = blocks
            .iter()
            .map(|&b| Segment {
                info: SegmentInfo {
                    block_id: b,
                    ..SegmentInfo::default()
                },
                ..Segment::default()
            })
            .collect();
        ctx
    }

    fn block_info_frame(block_id: u32, ds: &[u64]) -> Frame {
        let mut w = WireWriter::new();
        w.put_u32(block_id);
        w.put_u32(ds.len() as u32);
        for &d in ds {
            w.put_u64(d);
        }
        Frame::request(MessageType::SetBlockInfo, w.into_bytes())
    }

    #[test]
    fn test_single_block_round_trip() {
        let mut c = ctx(Action::Read, State::ReadGetBlkInfo, &[42]);
        let req = build_get_block_info(&mut c).unwrap();
        assert_eq!(req.msg_type, MessageType::GetBlockInfo);

        let outcome =
            parse_get_block_info(&mut c, &block_info_frame(42, &[11, 12])).unwrap();
        assert_matches!(outcome, StepOutcome::Next(State::ReadData));
        assert_eq!(c.segments[0].ds_list.len(), 2);
    }

    #[test]
    fn test_batch_request_for_many_blocks() {
        let mut c = ctx(Action::Read, State::ReadGetBlkInfo, &[1, 2, 3]);
        let req = build_get_block_info(&mut c).unwrap();
        assert_eq!(req.msg_type, MessageType::BatchGetBlockInfo);
    }

    #[test]
    fn test_partial_batch_stays() {
        let mut c = ctx(Action::Read, State::ReadGetBlkInfo, &[1, 2]);
        let outcome = parse_get_block_info(&mut c, &block_info_frame(1, &[11])).unwrap();
        assert_matches!(outcome, StepOutcome::Stay);
        let outcome = parse_get_block_info(&mut c, &block_info_frame(2, &[11])).unwrap();
        assert_matches!(outcome, StepOutcome::Next(State::ReadData));
    }

    #[test]
    fn test_write_gets_assigned_block() {
        let mut c = ctx(Action::Write, State::WriteGetBlkInfo, &[0]);
        let outcome =
            parse_get_block_info(&mut c, &block_info_frame(900, &[11])).unwrap();
        assert_matches!(outcome, StepOutcome::Next(State::WriteCreateFileName));
        assert_eq!(c.segments[0].info.block_id, 900);
    }

    #[test]
    fn test_no_data_servers_is_error() {
        let mut c = ctx(Action::Read, State::ReadGetBlkInfo, &[42]);
        assert!(parse_get_block_info(&mut c, &block_info_frame(42, &[])).is_err());
    }

    #[test]
    fn test_cmd_value_from_text() {
        let frame = Frame::request(
            MessageType::Status,
            StatusMsg {
                code: 0,
                message: "cluster id: 3".into(),
            }
            .encode(),
        );
        assert_eq!(cmd_value(&frame).unwrap(), 3);
    }

    #[test]
    fn test_cmd_value_from_code() {
        let frame = Frame::request(
            MessageType::Status,
            StatusMsg {
                code: 4,
                message: String::new(),
            }
            .encode(),
        );
        assert_eq!(cmd_value(&frame).unwrap(), 4);
    }

    #[test]
    fn test_group_probe_chain() {
        let mut c = ctx(Action::Remove, State::RemoveGetGroupCount, &[]);
        let frame = Frame::request(
            MessageType::Status,
            StatusMsg {
                code: 4,
                message: String::new(),
            }
            .encode(),
        );
        assert_matches!(
            parse_get_group_count(&mut c, &frame).unwrap(),
            StepOutcome::Next(State::RemoveGetGroupSeq)
        );
        assert_eq!(c.group_count, 4);
        c.state = State::RemoveGetGroupSeq;
        assert_matches!(
            parse_get_group_seq(&mut c, &frame).unwrap(),
            StepOutcome::Next(State::RemoveGetBlkInfo)
        );
    }
}
