//! TierFS Client Protocol Engine
//!
//! A client-side engine that performs file operations against a TierFS
//! storage cluster built from five independent backend tiers: the
//! route/cluster-cache servers (RC), root servers (RS), name servers (NS),
//! meta servers (MS) and data servers (DS). Each logical operation is
//! translated into a sequence of binary RPCs driven by a per-operation
//! state machine, with cluster topology cached per application key and an
//! optional content-deduplication path for writes and removes.
//!
//! # Architecture
//!
//! ```text
//! RequestCtx → Engine → Driver (state machine)
//!                          ├─ RouteCache  (login/keepalive, RC tier)
//!                          ├─ BlockCache  (block → DS replicas)
//!                          ├─ DedupClient (remote KV cache)
//!                          └─ proto::{rc,rs,ns,ms,ds} over Transport
//! ```
//!
//! Socket I/O, request parsing, and response rendering are collaborator
//! concerns behind the [`Transport`] and [`dedup::KvCache`] seams.
//!
//! # Modules
//!
//! - [`blockcache`] - Worker-local block-location cache
//! - [`codec`] - Binary frame format, checksums and field primitives
//! - [`config`] - Plain-data engine configuration
//! - [`dedup`] - Content-deduplication client
//! - [`error`] - Error types
//! - [`fsname`] - File-name codec
//! - [`keepalive`] - Background route-cache maintenance
//! - [`op`] - Operation contexts, state machine driver, child fan-out
//! - [`proto`] - Per-tier message builders and parsers
//! - [`route`] - Shared route-info cache
//! - [`transport`] - Collaborator-facing traits

pub mod blockcache;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fsname;
pub mod keepalive;
pub mod op;
pub mod proto;
pub mod route;
pub mod transport;
pub mod types;

use std::sync::Arc;

use tokio::task::JoinHandle;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Error, Outcome, ProtocolError, Result};
pub use op::driver::Driver;
pub use op::{Action, OpOutput, RequestCtx};
pub use route::RouteCache;
pub use transport::Transport;

/// Callback invoked exactly once with the terminal result of an operation.
pub type FinalizeFn = Box<dyn FnOnce(Result<OpOutput>) + Send + 'static>;

/// Handle to an operation started with [`Engine::start`]. Dropping the
/// handle detaches the operation; [`Handle::abort`] cancels it and tears
/// down any outstanding per-segment children.
pub struct Handle(JoinHandle<()>);

impl Handle {
    pub fn abort(&self) {
        self.0.abort();
    }
}

/// Front door of the protocol engine, one per worker.
pub struct Engine {
    driver: Arc<Driver>,
}

impl Engine {
    /// Create an engine over the given transport. A key-value cache handle
    /// enables the dedup path when the configuration asks for it.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        kv: Option<Arc<dyn dedup::KvCache>>,
    ) -> Self {
        Self {
            driver: Arc::new(Driver::new(config, transport, kv)),
        }
    }

    /// Schedule the keepalive cycle on the current runtime.
    pub fn spawn_keepalive(&self) -> JoinHandle<()> {
        keepalive::spawn(Arc::clone(&self.driver))
    }

    /// Run one operation to completion.
    pub async fn run(&self, req: RequestCtx) -> Result<OpOutput> {
        self.driver.run(req).await
    }

    /// Start an operation and deliver its result through `on_finalize`,
    /// which is invoked exactly once.
    pub fn start(&self, req: RequestCtx, on_finalize: FinalizeFn) -> Handle {
        let driver = Arc::clone(&self.driver);
        Handle(tokio::spawn(async move {
            let result = driver.run(req).await;
            on_finalize(result);
        }))
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }
}
