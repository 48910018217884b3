//! Common protocol types shared across tiers

use std::fmt;
use std::net::Ipv4Addr;

use serde::Deserialize;

/// IPv4 endpoint of a tier server.
///
/// On the wire an endpoint travels as a packed u64: low 32 bits IPv4
/// (network order), next 32 bits port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct ServerAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Decode from the packed wire form.
    pub fn from_packed(raw: u64) -> Self {
        let ip = Ipv4Addr::from((raw as u32).to_be_bytes());
        let port = ((raw >> 32) & 0xffff) as u16;
        Self { ip, port }
    }

    /// Encode to the packed wire form.
    pub fn to_packed(self) -> u64 {
        let ip = u32::from_be_bytes(self.ip.octets());
        (ip as u64) | ((self.port as u64) << 32)
    }

    /// Parse the textual "ip:port" form carried in route-info blobs.
    pub fn parse(text: &str) -> Option<Self> {
        let (ip, port) = text.rsplit_once(':')?;
        Some(Self {
            ip: ip.parse().ok()?,
            port: port.parse().ok()?,
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Open-mode bits carried in NS block-info requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(pub u32);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(1);
    pub const WRITE: OpenMode = OpenMode(2);
    pub const CREATE: OpenMode = OpenMode(4);
    pub const NEWBLK: OpenMode = OpenMode(8);
    pub const STAT: OpenMode = OpenMode(32);
    pub const LARGE: OpenMode = OpenMode(64);
    pub const UNLINK: OpenMode = OpenMode(128);

    pub fn union(self, other: OpenMode) -> OpenMode {
        OpenMode(self.0 | other.0)
    }

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Unlink variants accepted by the remove action.
///
/// Only `Delete` participates in dedup reference counting; the others are
/// metadata-state flips on the data server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UnlinkType {
    Delete = 0,
    Undelete = 2,
    Conceal = 4,
    Reveal = 6,
}

/// File status flag reported by stat/readv2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFlag {
    Normal,
    Deleted,
    Invalid,
    Concealed,
    Unknown(i32),
}

impl FileFlag {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => FileFlag::Normal,
            1 => FileFlag::Deleted,
            2 => FileFlag::Invalid,
            4 => FileFlag::Concealed,
            other => FileFlag::Unknown(other),
        }
    }
}

/// Per-file metadata returned by the DS tier (stat, readv2 tail)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub id: u64,
    pub offset: i32,
    pub size: i64,
    pub u_size: i64,
    pub modify_time: i32,
    pub create_time: i32,
    pub flag: i32,
    pub crc: u32,
}

impl FileStat {
    pub fn flag(&self) -> FileFlag {
        FileFlag::from_raw(self.flag)
    }
}

/// Directory-entry metadata returned by the MS tier for list operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomFileInfo {
    pub pid: i64,
    pub id: i64,
    pub create_time: u32,
    pub modify_time: u32,
    pub size: u64,
    pub ver_no: u16,
}

impl CustomFileInfo {
    /// High bit of the parent id marks a regular file (vs directory).
    pub fn is_file(&self) -> bool {
        (self.pid >> 63) & 0x1 == 0x1
    }
}

/// One listed entry: name plus metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub info: CustomFileInfo,
}

// =============================================================================
// Tests
// =============================================================================
