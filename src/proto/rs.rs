//! Root-server messages: meta-table fetch

use crate::codec::{Frame, MessageType, WireReader, WireWriter};
use crate::error::{ProtocolError, Result};
use crate::op::{OperationContext, State, StepOutcome};
use crate::proto::require;
use crate::types::ServerAddr;

/// Fetch the meta-server table for the operation's application.
pub fn build_get_table(_ctx: &mut OperationContext) -> Result<Frame> {
    let mut w = WireWriter::with_capacity(1);
    w.put_u8(0); // reserved
    Ok(Frame::request(MessageType::GetTable, w.into_bytes()))
}

/// Parse the versioned table of meta-server endpoints.
pub fn parse_get_table(ctx: &mut OperationContext, frame: &Frame) -> Result<StepOutcome> {
    require(frame, MessageType::RespGetTable)?;
    let mut r = WireReader::new(&frame.payload);
    let version = r.get_u64()?;
    let count = r.get_u32()? as usize;
    if count == 0 {
        return Err(ProtocolError::MalformedField("empty meta table").into());
    }
    let mut table = Vec::with_capacity(count);
    for _ in 0..count {
        table.push(ServerAddr::from_packed(r.get_u64()?));
    }
    ctx.meta_table = table;
    ctx.meta_table_version = version;

    Ok(StepOutcome::Next(match ctx.state {
        State::ReadGetMetaTable => State::ReadGetFragInfo,
        State::WriteGetMetaTable => State::WriteClusterIdMs,
        State::RemoveGetMetaTable => State::RemoveGetFragInfo,
        _ => State::ActionProcess,
    }))
}

// =============================================================================
// Tests
// =============================================================================
