//! Handler capability traits and the enumeration state they operate on.
//!
//! An [`InstanceHandler`] implements the instance capability set for one
//! family of classes; a [`MethodHandler`] implements extrinsic methods.
//! Handlers are stateless and shared by every concurrent request: per-call
//! state lives in a [`ResourceList`] (enumeration) or a [`ResourceRecord`]
//! (one backend object).
//!
//! ```text
//!   list_enum ──▶ ResourceList ──record_getnext──▶ ResourceRecord ──set_properties──▶ Instance
//!        │              │                                 │
//!        ▼              ▼                                 ▼
//!   Cursor (owns lease)  list_cleanup on drop        record_cleanup on drop
//! ```

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::backend::PoolSession;
use crate::error::{ProviderError, Result};
use crate::jobs::JobEngine;
use crate::session::SessionLease;
use crate::types::*;

/// Handler-specific decoded data for one enumeration or one backend object.
pub type RecordData = Box<dyn Any + Send + Sync>;

/// Optional capabilities of an instance handler.
///
/// A missing capability is reported as `NotSupported`, never as a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCapabilities {
    pub supports_add: bool,
    pub supports_delete: bool,
    pub supports_modify: bool,
    pub supports_extract: bool,
}

impl HandlerCapabilities {
    /// No optional capabilities (read-only class).
    pub fn read_only() -> Self {
        Self::default()
    }
}

/// Enumeration state produced by [`InstanceHandler::list_enum`].
pub struct ResourceList {
    /// Handler-owned backend iteration state.
    pub ctx: Option<RecordData>,
    /// Index of the next record to fetch.
    pub current_resource: usize,
    pub class_name: String,
    pub ref_only: bool,
}

impl ResourceList {
    pub fn new(class_name: impl Into<String>, ref_only: bool) -> Self {
        Self {
            ctx: None,
            current_resource: 0,
            class_name: class_name.into(),
            ref_only,
        }
    }

    /// Downcast the handler context.
    pub fn ctx<T: 'static>(&self) -> Result<&T> {
        self.ctx
            .as_ref()
            .and_then(|c| c.downcast_ref::<T>())
            .ok_or_else(|| {
                ProviderError::failed("list_getnext", &self.class_name, "enumeration context missing")
            })
    }
}

impl fmt::Debug for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceList")
            .field("class_name", &self.class_name)
            .field("current_resource", &self.current_resource)
            .field("ref_only", &self.ref_only)
            .finish()
    }
}

/// One snapshot of a single backend object.
pub struct ResourceRecord {
    pub class_name: String,
    pub ref_only: bool,
    pub data: RecordData,
}

impl ResourceRecord {
    pub fn new(class_name: impl Into<String>, ref_only: bool, data: RecordData) -> Self {
        Self {
            class_name: class_name.into(),
            ref_only,
            data,
        }
    }

    /// Downcast the handler data.
    pub fn data<T: 'static>(&self) -> Result<&T> {
        self.data.downcast_ref::<T>().ok_or_else(|| {
            ProviderError::failed("set_properties", &self.class_name, "unexpected record type")
        })
    }
}

/// The instance capability set for one family of classes.
#[async_trait]
pub trait InstanceHandler: Send + Sync {
    /// Property whose value identifies the backend object.
    fn key_property(&self, class_name: &str) -> &'static str;

    /// Identity-forming properties, in order.
    fn keys(&self, class_name: &str) -> Vec<&'static str> {
        vec![self.key_property(class_name)]
    }

    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities::read_only()
    }

    /// Open a backend enumeration, storing its state in `list.ctx`.
    async fn list_enum(&self, list: &mut ResourceList, session: &dyn PoolSession) -> Result<()>;

    /// Release backend enumeration state. Called exactly once per list.
    fn list_cleanup(&self, list: &mut ResourceList) {
        list.ctx = None;
    }

    /// Fetch the record at `list.current_resource`. `None` once exhausted.
    async fn record_getnext(
        &self,
        list: &mut ResourceList,
        session: &dyn PoolSession,
    ) -> Result<Option<RecordData>>;

    /// Release one record. Called exactly once per record.
    fn record_cleanup(&self, _record: &mut ResourceRecord) {}

    /// Fetch one record by the value of its key property.
    async fn record_get_from_id(
        &self,
        id: &str,
        class_name: &str,
        session: &dyn PoolSession,
    ) -> Result<RecordData>;

    /// Write the record's properties into the output instance.
    fn set_properties(&self, record: &ResourceRecord, instance: &mut Instance) -> Result<()>;

    /// Create a backend object from an extracted record.
    async fn add(
        &self,
        _session: &dyn PoolSession,
        instance: &Instance,
        _record: &ResourceRecord,
    ) -> Result<()> {
        Err(ProviderError::NotSupported(format!("add {}", instance.class_name)))
    }

    /// Delete the backend object identified by `id`.
    async fn delete(&self, _session: &dyn PoolSession, class_name: &str, _id: &str) -> Result<()> {
        Err(ProviderError::NotSupported(format!("delete {}", class_name)))
    }

    /// Apply an extracted record to the backend object identified by `id`.
    async fn modify(
        &self,
        _session: &dyn PoolSession,
        _id: &str,
        record: &ResourceRecord,
        _properties: &PropertyFilter,
    ) -> Result<()> {
        Err(ProviderError::NotSupported(format!("modify {}", record.class_name)))
    }

    /// Build a detached record from the caller-supplied instance.
    fn extract(&self, instance: &Instance, _properties: &PropertyFilter) -> Result<RecordData> {
        Err(ProviderError::NotSupported(format!("extract {}", instance.class_name)))
    }
}

/// Everything an extrinsic method needs from its request.
pub struct MethodCall<'a> {
    pub path: &'a ObjectPath,
    pub method: &'a str,
    pub args: &'a MethodArgs,
    pub session: &'a dyn PoolSession,
    pub credentials: &'a Credentials,
    pub jobs: &'a JobEngine,
}

/// The extrinsic-method capability set for one family of classes.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Invoke a method. Unknown method names are `MethodNotFound`.
    async fn invoke(&self, call: MethodCall<'_>) -> Result<MethodOutput>;
}

// =============================================================================
// SCOPED ENUMERATION STATE
// =============================================================================

/// An open enumeration. Dropping it runs `list_cleanup`, then releases the session.
pub struct Cursor {
    pub(crate) handler: Arc<dyn InstanceHandler>,
    pub(crate) list: ResourceList,
    pub(crate) lease: SessionLease,
}

impl Cursor {
    pub fn class_name(&self) -> &str {
        &self.list.class_name
    }

    pub fn current_resource(&self) -> usize {
        self.list.current_resource
    }

    pub fn ref_only(&self) -> bool {
        self.list.ref_only
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("list", &self.list)
            .field("lease", &self.lease)
            .finish()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.handler.list_cleanup(&mut self.list);
        // lease drops after this, releasing the session
    }
}

/// How a [`Resource`] holds its session.
pub(crate) enum ResourceSession {
    /// Opened for this resource; released with it.
    Owned(SessionLease),
    /// Borrowed from the enumerating cursor; not released here.
    Borrowed(Arc<dyn PoolSession>),
    /// Built from caller input, no session.
    Detached,
}

/// A fetched backend object. Dropping it runs `record_cleanup`, then
/// releases the session if the resource owns it.
pub struct Resource {
    handler: Arc<dyn InstanceHandler>,
    record: ResourceRecord,
    session: ResourceSession,
}

impl Resource {
    pub(crate) fn new(
        handler: Arc<dyn InstanceHandler>,
        record: ResourceRecord,
        session: ResourceSession,
    ) -> Self {
        Self {
            handler,
            record,
            session,
        }
    }

    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    pub fn class_name(&self) -> &str {
        &self.record.class_name
    }

    /// Whether releasing this resource also releases its session.
    pub fn owns_session(&self) -> bool {
        matches!(self.session, ResourceSession::Owned(_))
    }

    pub fn session(&self) -> Option<&dyn PoolSession> {
        match &self.session {
            ResourceSession::Owned(lease) => Some(lease.session()),
            ResourceSession::Borrowed(session) => Some(session.as_ref()),
            ResourceSession::Detached => None,
        }
    }

    pub fn set_properties(&self, instance: &mut Instance) -> Result<()> {
        self.handler.set_properties(&self.record, instance)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("class_name", &self.record.class_name)
            .field("ref_only", &self.record.ref_only)
            .field("owns_session", &self.owns_session())
            .finish()
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.handler.record_cleanup(&mut self.record);
        // an owned lease drops after this, releasing the session
    }
}
