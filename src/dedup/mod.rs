//! Content-deduplication client
//!
//! Write and remove paths consult a remote key-value cache keyed by a
//! content digest. The cache value carries a reference count and the name of
//! the file already holding the bytes; updates are guarded by the remote
//! cache's optimistic version check. Dedup failures never fail the carrying
//! operation: the write path falls back to a plain write, the remove path
//! proceeds with the physical unlink.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fsname::{suffix_matches, FsName};
use crate::types::UnlinkType;

/// Digest width of the remote-cache key
pub const DIGEST_LEN: usize = 16;
/// Full key width: digest plus encoded content length
pub const CONTENT_KEY_LEN: usize = DIGEST_LEN + 4;
/// Version used for the first put of a key the cache has never seen
pub const INITIAL_MAGIC_VERSION: u32 = 0x0fff_ffff;

/// Remote-cache key: truncated content digest + big-endian content length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentKey(pub [u8; CONTENT_KEY_LEN]);

impl ContentKey {
    /// Derive the key for `data`. Computed once per operation and cached on
    /// the [`DedupContext`].
    pub fn for_content(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut key = [0u8; CONTENT_KEY_LEN];
        key[..DIGEST_LEN].copy_from_slice(&digest[..DIGEST_LEN]);
        key[DIGEST_LEN..].copy_from_slice(&(data.len() as u32).to_be_bytes());
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Value stored under a [`ContentKey`]: reference count + linked file name
pub fn encode_value(ref_count: i32, file_name: &str) -> Vec<u8> {
    let mut value = Vec::with_capacity(4 + file_name.len());
    value.extend_from_slice(&ref_count.to_be_bytes());
    value.extend_from_slice(file_name.as_bytes());
    value
}

/// Counterpart of [`encode_value`]; `None` for a value too short to carry a
/// name.
pub fn decode_value(raw: &[u8]) -> Option<(i32, String)> {
    if raw.len() <= 4 {
        return None;
    }
    let ref_count = i32::from_be_bytes(raw[..4].try_into().ok()?);
    let name = String::from_utf8_lossy(&raw[4..]).into_owned();
    Some((ref_count, name))
}

/// A versioned value as the remote cache returns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvValue {
    pub data: Vec<u8>,
    pub version: u32,
}

/// The remote key-value cache the dedup path talks to. The concrete wire
/// client is a collaborator; versions are owned by the remote side.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<KvValue>>;
    /// Put conditioned on `version`; a mismatch surfaces as an error.
    async fn put(&self, key: &[u8], value: &[u8], version: u32) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Transient dedup state, one per opted-in write/remove operation
#[derive(Debug, Clone, Default)]
pub struct DedupContext {
    key: Option<ContentKey>,
    pub ref_count: i32,
    pub file_name: String,
    pub version: u32,
}

impl DedupContext {
    /// Key for `data`, computing it on first use.
    pub fn content_key(&mut self, data: &[u8]) -> ContentKey {
        match self.key {
            Some(key) => key,
            None => {
                let key = ContentKey::for_content(data);
                self.key = Some(key);
                key
            }
        }
    }
}

/// What the write path should do after the dedup lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteLookup {
    /// The cache names a file with matching suffix; stat it, and on success
    /// bump the reference count instead of writing new bytes.
    Candidate(FsName),
    /// Key absent: write normally and record the new mapping after success.
    Store,
    /// Entry present but unusable (suffix mismatch): write normally and
    /// leave the cache alone.
    Skip,
}

/// What the remove path should do after the dedup lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveLookup {
    /// More names reference the bytes: store the decremented count, skip the
    /// physical unlink.
    KeepData,
    /// Last reference: delete the cache entry, then unlink physically.
    DeleteThenUnlink,
    /// No entry or identity mismatch: unlink unconditionally.
    UnlinkOnly,
}

/// Dedup client bound to one remote cache instance
pub struct DedupClient {
    kv: Arc<dyn KvCache>,
}

impl DedupClient {
    pub fn new(kv: Arc<dyn KvCache>) -> Self {
        Self { kv }
    }

    /// Fetch the cache entry for `data` into `ctx`. Returns whether a
    /// well-formed entry was found; on miss the context version is primed
    /// with the initial magic version so a follow-up put creates the key.
    pub async fn fetch(&self, ctx: &mut DedupContext, data: &[u8]) -> Result<bool> {
        let key = ctx.content_key(data);
        match self.kv.get(key.as_bytes()).await {
            Ok(Some(value)) => {
                if let Some((ref_count, file_name)) = decode_value(&value.data) {
                    ctx.ref_count = ref_count;
                    ctx.file_name = file_name;
                    ctx.version = value.version;
                    debug!(
                        file_name = %ctx.file_name,
                        ref_count = ctx.ref_count,
                        version = ctx.version,
                        "dedup entry found"
                    );
                    return Ok(true);
                }
                ctx.version = INITIAL_MAGIC_VERSION;
                Ok(false)
            }
            Ok(None) => {
                ctx.version = INITIAL_MAGIC_VERSION;
                Ok(false)
            }
            Err(err) => {
                ctx.version = INITIAL_MAGIC_VERSION;
                warn!(error = %err, "dedup cache get failed, falling back");
                Ok(false)
            }
        }
    }

    /// Store the context's `{ref_count, file_name}` under its key, guarded
    /// by the version read earlier. A version mismatch is a normal failure
    /// and is not retried here.
    pub async fn store(&self, ctx: &mut DedupContext, data: &[u8]) -> Result<()> {
        let key = ctx.content_key(data);
        let value = encode_value(ctx.ref_count, &ctx.file_name);
        self.kv.put(key.as_bytes(), &value, ctx.version).await
    }

    /// Unconditionally delete the context's key.
    pub async fn remove(&self, ctx: &mut DedupContext, data: &[u8]) -> Result<()> {
        let key = ctx.content_key(data);
        self.kv.delete(key.as_bytes()).await
    }

    /// Write-path decision per the fetched entry: the linked name must carry
    /// exactly the caller's suffix and parse as a file identity, otherwise
    /// the operation writes fresh bytes without touching the cache.
    pub fn classify_write(&self, found: bool, ctx: &DedupContext, suffix: &str) -> WriteLookup {
        if !found {
            return WriteLookup::Store;
        }
        if !suffix_matches(&ctx.file_name, suffix) {
            debug!(file_name = %ctx.file_name, "dedup suffix mismatch, writing fresh copy");
            return WriteLookup::Skip;
        }
        match FsName::parse(&ctx.file_name, suffix) {
            Ok(fsname) => WriteLookup::Candidate(fsname),
            Err(_) => {
                debug!(file_name = %ctx.file_name, "dedup entry names an unparsable file");
                WriteLookup::Skip
            }
        }
    }

    /// Remove-path decision per the fetched entry and the target identity.
    /// Only a plain delete participates; undelete/conceal/reveal skip dedup.
    pub fn classify_remove(
        &self,
        found: bool,
        ctx: &mut DedupContext,
        target: &FsName,
        unlink_type: UnlinkType,
    ) -> RemoveLookup {
        if unlink_type != UnlinkType::Delete || !found {
            return RemoveLookup::UnlinkOnly;
        }
        let matches = FsName::parse(&ctx.file_name, "")
            .map(|cached| cached.same_file(target))
            .unwrap_or(false);
        if !matches {
            return RemoveLookup::UnlinkOnly;
        }
        ctx.ref_count -= 1;
        if ctx.ref_count <= 0 {
            RemoveLookup::DeleteThenUnlink
        } else {
            RemoveLookup::KeepData
        }
    }
}

impl std::fmt::Debug for DedupClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupClient").finish_non_exhaustive()
    }
}

// A dedup response that cannot be reconciled is reported with this helper so
// call sites stay uniform.
pub(crate) fn inconsistent(reason: &str) -> Error {
    Error::DedupInconsistent(reason.to_string())
}

// =============================================================================
// Tests
// =============================================================================
