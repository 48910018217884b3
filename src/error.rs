//! Error types for the TierFS protocol engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Reserved status-code threshold: tier codes above this propagate verbatim
/// to the caller, codes at or below it are mapped or collapsed.
pub const STATUS_CODE_RESERVED: i32 = -1000;

/// Errors that can occur in the TierFS protocol engine
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or payload
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Well-formed failure status returned by a tier
    #[error("tier status {code}: {message}")]
    TierStatus { code: i32, message: String },

    /// Route-info cache allocation failure after one eviction retry
    #[error("route cache exhausted inserting app key {app_key:?}")]
    CacheExhausted { app_key: String },

    /// Dedup cache response could not be reconciled with the target file
    #[error("dedup state inconsistent: {0}")]
    DedupInconsistent(String),

    /// No usable endpoint for the requested tier
    #[error("no {tier} endpoint available")]
    NoEndpoint { tier: &'static str },

    /// Retry budget for the current tier call is spent
    #[error("retry budget exhausted after {attempts} attempts against {tier}")]
    RetryExhausted { tier: &'static str, attempts: u32 },

    /// RC session id did not carry a parsable app id
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// Malformed TierFS file name
    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    /// Operation context is in a state the driver cannot dispatch
    #[error("invalid operation state: {0}")]
    InvalidState(String),

    /// A child segment operation failed; index identifies the segment
    #[error("segment {failed_segment_index} failed: {source}")]
    SegmentFailed {
        failed_segment_index: usize,
        #[source]
        source: Box<Error>,
    },

    /// Transport-level failure reported by the collaborator
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Frame-level decode failures. Always fatal for the current tier call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared payload length does not match the bytes available
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Payload checksum mismatch
    #[error("bad crc: expected {expected:#010x}, computed {computed:#010x}")]
    BadCrc { expected: u32, computed: u32 },

    /// Frame type not valid for the current state
    #[error("unexpected message type {0}")]
    UnexpectedType(u16),

    /// Frame marker or protocol version mismatch
    #[error("bad frame header: {0}")]
    BadHeader(&'static str),

    /// A length-prefixed field overran the payload
    #[error("malformed field: {0}")]
    MalformedField(&'static str),
}

/// Client-visible outcome classes for tier status codes.
///
/// Codes above [`STATUS_CODE_RESERVED`] propagate verbatim as
/// [`Outcome::Verbatim`]; a small set of well-known codes map to stable
/// outcomes; everything else collapses to [`Outcome::TierError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotFound,
    Conflict,
    ServerBusy,
    PermissionDenied,
    SessionInvalid,
    Verbatim(i32),
    TierError,
}

// Well-known tier codes (shared numeric plan across all tiers).
pub(crate) const EXIT_FILE_BUSY: i32 = -2009;
pub(crate) const EXIT_ACCESS_PERMISSION: i32 = -1013;
pub(crate) const EXIT_BLOCK_NOT_FOUND: i32 = -5003;
pub(crate) const EXIT_BLOCK_BUSY: i32 = -5010;
pub(crate) const EXIT_META_NOT_FOUND: i32 = -8025;
pub(crate) const EXIT_SESSION_INVALID: i32 = -9002;
pub(crate) const EXIT_APP_PERMISSION_DENY: i32 = -9011;
pub(crate) const EXIT_TARGET_EXIST: i32 = -14001;
pub(crate) const EXIT_VERSION_CONFLICT: i32 = -14004;

impl Outcome {
    /// Map a raw tier status code to its client-visible outcome.
    pub fn from_code(code: i32) -> Self {
        if code > STATUS_CODE_RESERVED {
            return Outcome::Verbatim(code);
        }
        match code {
            EXIT_BLOCK_NOT_FOUND | EXIT_META_NOT_FOUND | EXIT_TARGET_EXIST => Outcome::NotFound,
            EXIT_VERSION_CONFLICT => Outcome::Conflict,
            EXIT_BLOCK_BUSY | EXIT_FILE_BUSY => Outcome::ServerBusy,
            EXIT_ACCESS_PERMISSION | EXIT_APP_PERMISSION_DENY => Outcome::PermissionDenied,
            EXIT_SESSION_INVALID => Outcome::SessionInvalid,
            _ => Outcome::TierError,
        }
    }
}

impl Error {
    /// Whether a tier retry handler may re-target this failure.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Protocol(_) | Error::Transport(_) | Error::Io(_) => true,
            Error::TierStatus { code, .. } => matches!(
                Outcome::from_code(*code),
                Outcome::ServerBusy | Outcome::TierError
            ),
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
