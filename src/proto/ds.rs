//! Data-server messages: read, write, stat, create, close, unlink
//!
//! Every DS request starts with the block id and file id addressing one
//! fragment. Multi-segment operations run these exchanges once per segment,
//! either sequentially or fanned out to child contexts.

use bytes::Bytes;
use tracing::debug;

use crate::codec::{crc_payload, Frame, MessageType, WireReader, WireWriter};
use crate::error::{Error, ProtocolError, Result};
use crate::fsname::{FileType, FsName};
use crate::op::{Action, OperationContext, SegmentInfo, State, StepOutcome};
use crate::proto::ms::resolve_read_window;
use crate::proto::{require, require_status_ok};
use crate::types::FileStat;

/// Close mode sent by the writing master
const CLOSE_FILE_MASTER: i32 = 100;

fn current_segment(ctx: &OperationContext) -> Result<(u32, u64)> {
    let seg = ctx
        .current_segment()
        .ok_or_else(|| Error::InvalidState("no segment to address".into()))?;
    Ok((seg.info.block_id, seg.info.file_id))
}

fn decode_raw_file_info(r: &mut WireReader<'_>) -> Result<FileStat> {
    Ok(FileStat {
        id: r.get_u64()?,
        offset: r.get_i32()?,
        size: r.get_i32()? as i64,
        u_size: r.get_i32()? as i64,
        modify_time: r.get_i32()?,
        create_time: r.get_i32()?,
        flag: r.get_i32()?,
        crc: r.get_u32()?,
    })
}

/// Whether this read should use the v2 exchange that appends file metadata.
fn wants_stat_tail(ctx: &OperationContext) -> bool {
    ctx.want_stat_tail
        && ctx.req.action == Action::Read
        && ctx.file_stat.is_none()
        && ctx.state == State::ReadData
}

/// Read the current segment's operative range.
pub fn build_read(ctx: &mut OperationContext) -> Result<Frame> {
    let (block_id, file_id) = current_segment(ctx)?;
    let seg = ctx
        .current_segment()
        .ok_or_else(|| Error::InvalidState("no segment to read".into()))?;
    let mut w = WireWriter::with_capacity(21);
    w.put_u32(block_id);
    w.put_u64(file_id);
    w.put_i32(seg.oper_offset as i32);
    w.put_u32(seg.oper_size as u32);
    if wants_stat_tail(ctx) {
        w.put_u8(0); // normal read stat
        Ok(Frame::request(MessageType::ReadDataV2, w.into_bytes()))
    } else {
        w.put_u8(0);
        Ok(Frame::request(MessageType::ReadData, w.into_bytes()))
    }
}

/// Parse read data (v1 or v2), store it on the segment, and advance the
/// segment cursor.
pub fn parse_read(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    let is_v2 = frame.msg_type == MessageType::RespReadDataV2;
    if is_v2 {
        require(frame, MessageType::RespReadDataV2)?;
    } else {
        require(frame, MessageType::RespReadData)?;
    }
    let mut r = WireReader::new(&frame.payload);
    let data_len = r.get_i32()?;
    if data_len < 0 {
        return Err(Error::TierStatus {
            code: data_len,
            message: "data server read failed".into(),
        });
    }
    let data = Bytes::copy_from_slice(r.get_bytes(data_len as usize)?);

    // v2 appends file metadata on the first segment read
    if is_v2 && r.remaining() > 4 {
        let info_len = r.get_u32()?;
        if info_len > 0 {
            ctx.file_stat = Some(decode_raw_file_info(&mut r)?);
        }
    }

    if let Some(seg) = ctx.current_segment_mut() {
        seg.data = data.clone();
    }
    ctx.out_data.push(data);
    ctx.segment_index += 1;

    if ctx.segment_index < ctx.segments.len() {
        return Ok(StepOutcome::Stay);
    }
    match ctx.state {
        State::RemoveReadMetaSegment => Ok(StepOutcome::Next(State::RemoveDeleteData)),
        _ => Ok(StepOutcome::Done),
    }
}

/// Large files store their fragment directory in a meta segment on the DS
/// tier; read it whole.
pub fn build_read_meta_segment(ctx: &mut OperationContext) -> Result<Frame> {
    let fsname = ctx
        .fsname
        .as_ref()
        .ok_or_else(|| Error::InvalidState("large read without file name".into()))?;
    let mut w = WireWriter::with_capacity(21);
    w.put_u32(fsname.block_id);
    w.put_u64(fsname.file_id());
    w.put_i32(0);
    w.put_u32(0); // whole segment
    w.put_u8(0);
    Ok(Frame::request(MessageType::ReadData, w.into_bytes()))
}

/// Parse the meta segment into the real data-segment list and resolve the
/// read window over it.
pub fn parse_read_meta_segment(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require(frame, MessageType::RespReadData)?;
    let mut r = WireReader::new(&frame.payload);
    let data_len = r.get_i32()?;
    if data_len < 0 {
        return Err(Error::TierStatus {
            code: data_len,
            message: "meta segment read failed".into(),
        });
    }

    let count = r.get_u32()? as usize;
    let _total_size = r.get_u64()?;
    r.get_bytes(64)?; // reserved
    if count == 0 {
        return Err(ProtocolError::MalformedField("meta segment with no fragments").into());
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
        ctx.segments.push(crate::op::Segment {
            info,
            oper_size: info.size as u64,
            ..crate::op::Segment::default()
        });
    }
    ctx.segment_index = 0;
    ctx.still_have = false;

    if resolve_read_window(ctx)? {
        return Ok(StepOutcome::Done);
    }
    Ok(StepOutcome::Next(State::ReadGetBlkInfo))
}

/// Stat one file on its data server.
pub fn build_stat(ctx: &mut OperationContext) -> Result<Frame> {
    let (block_id, file_id) = current_segment(ctx)?;
    let mut w = WireWriter::with_capacity(16);
    w.put_u32(block_id);
    w.put_u64(file_id);
    w.put_u32(0); // normal read stat
    Ok(Frame::request(MessageType::FileInfo, w.into_bytes()))
}

pub fn parse_stat(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require(frame, MessageType::RespFileInfo)?;
    let mut r = WireReader::new(&frame.payload);
    let data_len = r.get_i32()?;
    if data_len < 0 {
        return Err(Error::TierStatus {
            code: data_len,
            message: "data server stat failed".into(),
        });
    }
    let stat = decode_raw_file_info(&mut r)?;
    debug!(file_id = stat.id, size = stat.size, flag = stat.flag, "file stat");
    ctx.file_stat = Some(stat);

    Ok(match ctx.state {
        State::WriteStatDupFile => StepOutcome::Next(State::WriteDone),
        State::RemoveStatFile => {
            // the follow-up content read covers the whole file
            let size = stat.size.max(0) as u64;
            if let Some(seg) = ctx.current_segment_mut() {
                seg.oper_offset = 0;
                seg.oper_size = size;
            }
            StepOutcome::Next(State::RemoveReadMetaSegment)
        }
        _ => StepOutcome::Done,
    })
}

/// Reserve a file id (and lease) inside the segment's block.
pub fn build_create_filename(ctx: &mut OperationContext) -> Result<Frame> {
    let (block_id, file_id) = current_segment(ctx)?;
    let mut w = WireWriter::with_capacity(12);
    w.put_u32(block_id);
    w.put_u64(file_id);
    Ok(Frame::request(MessageType::CreateFilename, w.into_bytes()))
}

pub fn parse_create_filename(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require(frame, MessageType::RespCreateFilename)?;
    let mut r = WireReader::new(&frame.payload);
    let block_id = r.get_u32()?;
    let file_id = r.get_u64()?;
    let file_number = r.get_u64()?;

    let cluster_id = ctx.cluster_id;
    let large = ctx.req.large_file;
    if let Some(seg) = ctx.current_segment_mut() {
        seg.info.block_id = block_id;
        seg.info.file_id = file_id;
        seg.file_number = file_number;
    }
    // the first created segment names the file
    if ctx.fsname.is_none() {
        ctx.fsname = Some(FsName::new(
            cluster_id,
            block_id,
            file_id,
            if large { FileType::Large } else { FileType::Small },
        ));
    }
    Ok(StepOutcome::Next(State::WriteData))
}

/// Ship the current segment's payload.
pub fn build_write(ctx: &mut OperationContext) -> Result<Frame> {
    let seg = ctx
        .current_segment()
        .ok_or_else(|| Error::InvalidState("no segment to write".into()))?;
    let data = seg.data.clone();
    let crc = crc_payload(&data);
    let (block_id, file_id) = (seg.info.block_id, seg.info.file_id);
    let (offset, file_number) = (seg.info.offset, seg.file_number);
    if let Some(seg) = ctx.current_segment_mut() {
        seg.info.crc = crc;
    }

    let mut w = WireWriter::with_capacity(28 + data.len());
    w.put_u32(block_id);
    w.put_u64(file_id);
    w.put_i32(offset as i32);
    w.put_u32(data.len() as u32);
    w.put_i32(0); // master copy
    w.put_u64(file_number);
    w.put_bytes(&data);
    Ok(Frame::request(MessageType::WriteData, w.into_bytes()))
}

pub fn parse_write(_ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require_status_ok(frame)?;
    Ok(StepOutcome::Next(State::WriteCloseFile))
}

/// Commit the segment: the close carries the data checksum and lease.
pub fn build_close(ctx: &mut OperationContext) -> Result<Frame> {
    let seg = ctx
        .current_segment()
        .ok_or_else(|| Error::InvalidState("no segment to close".into()))?;
    let mut w = WireWriter::with_capacity(28);
    w.put_u32(seg.info.block_id);
    w.put_u64(seg.info.file_id);
    w.put_i32(CLOSE_FILE_MASTER);
    w.put_u32(seg.info.crc);
    w.put_u64(seg.file_number);
    Ok(Frame::request(MessageType::CloseFile, w.into_bytes()))
}

pub fn parse_close(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require_status_ok(frame)?;
    ctx.segment_index += 1;
    if ctx.req.file_path.is_empty() {
        Ok(StepOutcome::Done)
    } else {
        Ok(StepOutcome::Next(State::WriteMs))
    }
}

/// Unlink (or flip the visibility of) the current segment's file.
pub fn build_unlink(ctx: &mut OperationContext) -> Result<Frame> {
    let (block_id, file_id) = current_segment(ctx)?;
    let mut w = WireWriter::with_capacity(16);
    w.put_u32(block_id);
    w.put_u64(file_id);
    w.put_u32(ctx.req.unlink_type as u32);
    Ok(Frame::request(MessageType::UnlinkFile, w.into_bytes()))
}

pub fn parse_unlink(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require_status_ok(frame)?;
    ctx.segment_index += 1;
    if ctx.segment_index < ctx.segments.len() {
        return Ok(StepOutcome::Stay);
    }
    if ctx.req.file_path.is_empty() {
        Ok(StepOutcome::Done)
    } else {
        Ok(StepOutcome::Next(State::RemoveNotifyMs))
    }
}

/// Best-effort rollback of a failed write; the stored error still decides
/// the operation outcome.
pub fn parse_rollback_unlink(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    if let Err(err) = require_status_ok(frame) {
        debug!(error = %err, "rollback unlink failed, continuing");
    }
    ctx.segment_index += 1;
    if ctx.segment_index < ctx.segments.len() {
        return Ok(StepOutcome::Stay);
    }
    Ok(StepOutcome::Done)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{RequestCtx, Segment};
    use assert_matches::assert_matches;

    fn read_ctx(segments: usize) -> OperationContext {
        let mut ctx = OperationContext::new(
            RequestCtx {
                action: Action::Read,
                length: 4096,
                ..RequestCtx::default()
            },
            2,
        );
        ctx.state = State::ReadData;
        ctx.want_stat_tail = true;
        ctx.segments = (0..segments)
            .map(|i| Segment {
                info: SegmentInfo {
                    block_id: 10 + i as u32,
                    file_id: 77,
                    offset: (i * 2048) as i64,
                    size: 2048,
                    crc: 0,
                },
                oper_size: 2048,
                ..Segment::default()
            })
            .collect();
        ctx
    }

    fn read_resp(data: &[u8]) -> Frame {
        let mut w = WireWriter::new();
        w.put_i32(data.len() as i32);
        w.put_bytes(data);
        Frame::request(MessageType::RespReadData, w.into_bytes())
    }

    #[test]
    fn test_read_round() {
        let mut ctx = read_ctx(2);
        ctx.file_stat = Some(FileStat::default()); // suppress v2
        let frame = build_read(&mut ctx).unwrap();
        assert_eq!(frame.msg_type, MessageType::ReadData);

        assert_matches!(parse_read(&mut ctx, &read_resp(b"abcd")).unwrap(), StepOutcome::Stay);
        assert_matches!(parse_read(&mut ctx, &read_resp(b"efgh")).unwrap(), StepOutcome::Done);
        assert_eq!(ctx.out_data.len(), 2);
        assert_eq!(&ctx.out_data[0][..], b"abcd");
    }

    #[test]
    fn test_first_read_uses_v2() {
        let mut ctx = read_ctx(1);
        let frame = build_read(&mut ctx).unwrap();
        assert_eq!(frame.msg_type, MessageType::ReadDataV2);
    }

    #[test]
    fn test_read_v2_captures_stat_tail() {
        let mut ctx = read_ctx(1);
        let mut w = WireWriter::new();
        w.put_i32(4);
        w.put_bytes(b"abcd");
        w.put_u32(40); // info present
        w.put_u64(77);
        w.put_i32(0);
        w.put_i32(4);
        w.put_i32(4);
        w.put_i32(100);
        w.put_i32(90);
        w.put_i32(0);
        w.put_u32(0xABCD);
        let frame = Frame::request(MessageType::RespReadDataV2, w.into_bytes());
        parse_read(&mut ctx, &frame).unwrap();
        let stat = ctx.file_stat.unwrap();
        assert_eq!(stat.id, 77);
        assert_eq!(stat.crc, 0xABCD);
    }

    #[test]
    fn test_read_negative_length_is_tier_error() {
        let mut ctx = read_ctx(1);
        ctx.file_stat = Some(FileStat::default());
        let mut w = WireWriter::new();
        w.put_i32(-8016);
        let frame = Frame::request(MessageType::RespReadData, w.into_bytes());
        assert_matches!(
            parse_read(&mut ctx, &frame),
            Err(Error::TierStatus { code: -8016, .. })
        );
    }

    #[test]
    fn test_create_then_write_then_close() {
        let mut ctx = OperationContext::new(
            RequestCtx {
                action: Action::Write,
                ..RequestCtx::default()
            },
            2,
        );
        ctx.state = State::WriteCreateFileName;
        ctx.cluster_id = 2;
        ctx.segments = vec![Segment {
            data: Bytes::from_static(b"payload"),
            ..Segment::default()
        }];

        let mut w = WireWriter::new();
        w.put_u32(900);
        w.put_u64(0x0000_0009_0000_0001);
        w.put_u64(5555);
        let frame = Frame::request(MessageType::RespCreateFilename, w.into_bytes());
        assert_matches!(
            parse_create_filename(&mut ctx, &frame).unwrap(),
            StepOutcome::Next(State::WriteData)
        );
        assert_eq!(ctx.segments[0].info.block_id, 900);
        assert_eq!(ctx.segments[0].file_number, 5555);
        let name = ctx.fsname.as_ref().unwrap();
        assert_eq!(name.block_id, 900);

        ctx.state = State::WriteData;
        let frame = build_write(&mut ctx).unwrap();
        assert_eq!(frame.msg_type, MessageType::WriteData);
        assert_ne!(ctx.segments[0].info.crc, 0);

        ctx.state = State::WriteCloseFile;
        let close = build_close(&mut ctx).unwrap();
        assert_eq!(close.msg_type, MessageType::CloseFile);
    }

    #[test]
    fn test_unlink_steps_through_segments() {
        let mut ctx = read_ctx(2);
        ctx.state = State::RemoveDeleteData;
        ctx.segment_index = 0;
        let ok = Frame::request(
            MessageType::Status,
            crate::codec::StatusMsg {
                code: 0,
                message: String::new(),
            }
            .encode(),
        );
        assert_matches!(parse_unlink(&mut ctx, &ok).unwrap(), StepOutcome::Stay);
        assert_matches!(parse_unlink(&mut ctx, &ok).unwrap(), StepOutcome::Done);
    }

    #[test]
    fn test_meta_segment_parse() {
        let mut ctx = OperationContext::new(
            RequestCtx {
                action: Action::Read,
                large_file: true,
                offset: 0,
                length: 4096,
                ..RequestCtx::default()
            },
            2,
        );
        ctx.state = State::ReadGetFragInfo;
        ctx.fsname = Some(FsName::new(1, 7, 9, FileType::Large));

        let mut w = WireWriter::new();
        let mut body = WireWriter::new();
        body.put_u32(2); // fragment count
        body.put_u64(4096);
        body.put_bytes(&[0u8; 64]);
        for i in 0..2u32 {
            body.put_u32(100 + i);
            body.put_u64(9);
            body.put_i64(i as i64 * 2048);
            body.put_u32(2048);
        }
        let body = body.into_bytes();
        w.put_i32(body.len() as i32);
        w.put_bytes(&body);
        let frame = Frame::request(MessageType::RespReadData, w.into_bytes());

        assert_matches!(
            parse_read_meta_segment(&mut ctx, &frame).unwrap(),
            StepOutcome::Next(State::ReadGetBlkInfo)
        );
        assert_eq!(ctx.segments.len(), 2);
        assert_eq!(ctx.segments[1].info.offset, 2048);
    }
}
