//! Binary frame format
//!
//! Every tier speaks the same fixed frame: a 22-byte header followed by a
//! checksummed payload. Header fields are big-endian:
//!
//! ```text
//! u16 type | u16 flag | u16 version | u64 id | u32 length | u32 crc
//! ```
//!
//! `length` covers the payload only; `crc` is computed over the payload with
//! the seed in [`crc::CRC_SEED`]. Packet ids are process-local and wrap
//! before the signed 32-bit range.

pub mod crc;
pub mod wire;

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
pub use crc::{crc_payload, crc_update, CRC_SEED};
pub use wire::{WireReader, WireWriter};

/// Constant packet marker carried in every header
pub const PACKET_FLAG: u16 = 0x5446;
/// Constant protocol version
pub const PACKET_VERSION: u16 = 2;
/// Header size on the wire
pub const HEADER_LEN: usize = 22;

/// Message type codes shared with the tier servers.
///
/// The numbering is sparse; only the codes this engine sends or accepts are
/// listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Status = 1,
    GetBlockInfo = 2,
    SetBlockInfo = 3,
    ReadData = 7,
    RespReadData = 8,
    WriteData = 9,
    CloseFile = 10,
    UnlinkFile = 11,
    FileInfo = 17,
    RespFileInfo = 18,
    ClientCmd = 20,
    CreateFilename = 21,
    RespCreateFilename = 22,
    BatchGetBlockInfo = 59,
    BatchSetBlockInfo = 60,
    ReadDataV2 = 38,
    RespReadDataV2 = 39,
    RcLogin = 66,
    RespRcLogin = 67,
    RcKeepalive = 68,
    RespRcKeepalive = 69,
    FilepathAction = 74,
    WriteFilepath = 75,
    ReadFilepath = 76,
    RespReadFilepath = 77,
    LsFilepath = 78,
    RespLsFilepath = 79,
    GetTable = 84,
    RespGetTable = 85,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, ProtocolError> {
        use MessageType::*;
        Ok(match value {
            1 => Status,
            2 => GetBlockInfo,
            3 => SetBlockInfo,
            7 => ReadData,
            8 => RespReadData,
            9 => WriteData,
            10 => CloseFile,
            11 => UnlinkFile,
            17 => FileInfo,
            18 => RespFileInfo,
            20 => ClientCmd,
            21 => CreateFilename,
            22 => RespCreateFilename,
            59 => BatchGetBlockInfo,
            60 => BatchSetBlockInfo,
            38 => ReadDataV2,
            39 => RespReadDataV2,
            66 => RcLogin,
            67 => RespRcLogin,
            68 => RcKeepalive,
            69 => RespRcKeepalive,
            74 => FilepathAction,
            75 => WriteFilepath,
            76 => ReadFilepath,
            77 => RespReadFilepath,
            78 => LsFilepath,
            79 => RespLsFilepath,
            84 => GetTable,
            85 => RespGetTable,
            other => return Err(ProtocolError::UnexpectedType(other)),
        })
    }
}

// Packet ids start above a small reserved range and wrap before they would
// overflow a signed 32-bit counter.
const PACKET_ID_FIRST: u64 = 2;
const PACKET_ID_LIMIT: u64 = i32::MAX as u64 - 1;

static PACKET_ID: AtomicU64 = AtomicU64::new(PACKET_ID_FIRST);

/// Next process-local packet id.
pub fn next_packet_id() -> u64 {
    loop {
        let prev = PACKET_ID.load(Ordering::Relaxed);
        let next = if prev >= PACKET_ID_LIMIT {
            PACKET_ID_FIRST + 1
        } else {
            prev + 1
        };
        if PACKET_ID
            .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

/// One complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub id: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Build an outbound frame with a freshly generated packet id.
    pub fn request(msg_type: MessageType, payload: Bytes) -> Self {
        Self {
            msg_type,
            id: next_packet_id(),
            payload,
        }
    }

    /// Serialize header + payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16(self.msg_type as u16);
        buf.put_u16(PACKET_FLAG);
        buf.put_u16(PACKET_VERSION);
        buf.put_u64(self.id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(crc_payload(&self.payload));
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a frame from `raw`, verifying marker, length and checksum.
    pub fn decode(raw: &[u8]) -> Result<Frame, ProtocolError> {
        if raw.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                need: HEADER_LEN,
                have: raw.len(),
            });
        }
        let mut r = WireReader::new(raw);
        let msg_type = MessageType::try_from(r.get_u16()?)?;
        if r.get_u16()? != PACKET_FLAG {
            return Err(ProtocolError::BadHeader("packet flag mismatch"));
        }
        if r.get_u16()? != PACKET_VERSION {
            return Err(ProtocolError::BadHeader("protocol version mismatch"));
        }
        let id = r.get_u64()?;
        let length = r.get_u32()? as usize;
        let expected = r.get_u32()?;
        if r.remaining() != length {
            return Err(ProtocolError::Truncated {
                need: length,
                have: r.remaining(),
            });
        }
        let payload = r.get_bytes(length)?;
        let computed = crc_payload(payload);
        if computed != expected {
            return Err(ProtocolError::BadCrc { expected, computed });
        }
        Ok(Frame {
            msg_type,
            id,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// The generic failure shape every tier can return: `{i32 code, string}`.
/// `code == 0` denotes success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMsg {
    pub code: i32,
    pub message: String,
}

impl StatusMsg {
    pub fn decode(payload: &[u8]) -> Result<StatusMsg, ProtocolError> {
        let mut r = WireReader::new(payload);
        let code = r.get_i32()?;
        let message = r.get_string_owned()?;
        Ok(StatusMsg { code, message })
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_i32(self.code);
        w.put_string(self.message.as_bytes());
        w.into_bytes()
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_packet_id_monotonic_and_reserved() {
        let a = next_packet_id();
        let b = next_packet_id();
        assert!(a > PACKET_ID_FIRST);
        assert!(b > a);
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::request(MessageType::ReadData, Bytes::from_static(b"hello tier"));
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_rejects_short_header() {
        assert_matches!(
            Frame::decode(&[0u8; 10]),
            Err(ProtocolError::Truncated { .. })
        );
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let frame = Frame::request(MessageType::Status, Bytes::from_static(b"abcd"));
        let mut raw = frame.encode().to_vec();
        raw.truncate(raw.len() - 1);
        assert_matches!(Frame::decode(&raw), Err(ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_decode_rejects_bad_flag() {
        let frame = Frame::request(MessageType::Status, Bytes::new());
        let mut raw = frame.encode().to_vec();
        raw[2] ^= 0xff;
        assert_matches!(
            Frame::decode(&raw),
            Err(ProtocolError::BadHeader("packet flag mismatch"))
        );
    }

    #[test]
    fn test_status_msg_round_trip() {
        let status = StatusMsg {
            code: -5003,
            message: "block not found".to_string(),
        };
        let decoded = StatusMsg::decode(&status.encode()).unwrap();
        assert_eq!(decoded, status);
        assert!(!decoded.is_ok());
    }

    proptest! {
        #[test]
        fn prop_frame_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let frame = Frame::request(MessageType::WriteData, Bytes::from(payload));
            let decoded = Frame::decode(&frame.encode()).unwrap();
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn prop_payload_bit_flip_fails_crc(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            flip_byte in 0usize..512,
            flip_bit in 0u8..8,
        ) {
            let frame = Frame::request(MessageType::WriteData, Bytes::from(payload.clone()));
            let mut raw = frame.encode().to_vec();
            let idx = HEADER_LEN + (flip_byte % payload.len());
            raw[idx] ^= 1 << flip_bit;
            let is_bad_crc = matches!(
                Frame::decode(&raw),
                Err(ProtocolError::BadCrc { .. })
            );
            prop_assert!(is_bad_crc);
        }
    }
}
