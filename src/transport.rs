//! Collaborator-facing seams
//!
//! The engine never touches sockets. The host supplies a [`Transport`] that
//! delivers one request frame to one peer and resolves with the matched
//! response frame (or a transport error); request/response matching by
//! packet id, connection pooling and timeouts live behind the seam.

use async_trait::async_trait;

use crate::codec::Frame;
use crate::error::Result;
use crate::types::ServerAddr;

/// One round trip to a tier server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, peer: ServerAddr, frame: Frame) -> Result<Frame>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn call(&self, peer: ServerAddr, frame: Frame) -> Result<Frame> {
        (**self).call(peer, frame).await
    }
}
