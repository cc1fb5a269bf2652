//! # xencim Provider
//!
//! Resource-provider framework for a hypervisor pool management plane.
//!
//! A management broker asks the provider to enumerate, fetch, create, modify
//! and delete managed objects, and to invoke methods on them. The provider
//! routes each request by class name to a stateless handler, drives the
//! handler through a scoped enumeration or point lookup, and guarantees that
//! every session and record it opens is released on every exit path.
//! Long-running operations are returned as jobs that callers poll.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  broker ──────▶ │          Dispatcher          │ ◀── ProviderContext (init/uninit)
//!                 │ begin/getnext/end, get, add, │
//!                 │ modify, delete, invoke_method│
//!                 └──────┬───────────────┬───────┘
//!                        │ class name    │ jobs
//!                        ▼               ▼
//!                 ┌─────────────┐  ┌─────────────┐
//!                 │  Registry   │  │  JobEngine  │──▶ tokio task per job
//!                 └──────┬──────┘  └──────┬──────┘
//!                        ▼                │
//!          InstanceHandler / MethodHandler│
//!                        │                │
//!                        ▼                ▼
//!                 ┌──────────────────────────────┐
//!                 │ PoolBackend / PoolSession    │  (MockPool in tests)
//!                 └──────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xencim_provider::{Credentials, MockPool, PropertyFilter, ProviderConfig, ProviderContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = MockPool::new();
//!     pool.add_host("host-a");
//!
//!     let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool));
//!     provider.init().await?;
//!
//!     let creds = Credentials::new("root", "secret");
//!     let hosts = provider
//!         .dispatcher()
//!         .enumerate_instances(&creds, "Xen_HostComputerSystem", &PropertyFilter::all())
//!         .await?;
//!     println!("{} hosts", hosts.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod instance_id;
pub mod jobs;
pub mod lifecycle;
pub mod mock;
pub mod query;
pub mod registry;
pub mod session;
pub mod types;

pub use backend::{PoolBackend, PoolSession};
pub use config::{ConfigError, ProviderConfig};
pub use dispatch::Dispatcher;
pub use error::{BackendError, ProviderError, Result};
pub use handler::{
    Cursor, HandlerCapabilities, InstanceHandler, MethodCall, MethodHandler, RecordData, Resource,
    ResourceList, ResourceRecord,
};
pub use jobs::{Job, JobContext, JobEngine, JobStatus};
pub use lifecycle::{ProviderContext, UnloadOutcome};
pub use mock::MockPool;
pub use query::Query;
pub use registry::Registry;
pub use session::{SessionLease, SessionManager};
pub use types::*;
