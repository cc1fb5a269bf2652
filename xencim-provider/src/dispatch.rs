//! # Dispatch Layer
//!
//! The resource-agnostic request lifecycle, orchestrating whichever handler
//! the [`Registry`] resolves for a class.
//!
//! ```text
//!   enumerate ──▶ begin ──▶ getnext* ──▶ end          (Cursor owns its session)
//!   get       ──▶ record_get_from_id ──▶ set_properties   (Resource owns its session)
//!   add       ──▶ get (must fail) ──▶ extract ──▶ add
//!   modify    ──▶ get (must succeed) ──▶ extract ──▶ modify
//!   delete    ──▶ get (must succeed) ──▶ delete
//!   invoke    ──▶ method handler (may create a job)
//! ```
//!
//! Sessions, cursors and resources are scoped values: every exit path drops
//! them, which runs the handler's cleanup and releases the session exactly once.

use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ProviderError, Result};
use crate::handler::{
    Cursor, InstanceHandler, MethodCall, Resource, ResourceList, ResourceRecord, ResourceSession,
};
use crate::instance_id;
use crate::jobs::JobEngine;
use crate::query::Query;
use crate::registry::Registry;
use crate::session::SessionManager;
use crate::types::*;

/// Consecutive unreadable records after which an enumeration is abandoned.
pub const MAX_CONSECUTIVE_FAILURES: usize = 32;

/// Routes protocol requests to handlers.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    sessions: SessionManager,
    jobs: JobEngine,
    namespace: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        sessions: SessionManager,
        jobs: JobEngine,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            sessions,
            jobs,
            namespace: namespace.into(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn instance_handler(&self, class_name: &str) -> Result<Arc<dyn InstanceHandler>> {
        self.registry
            .resolve_instance_handler(class_name)
            .ok_or_else(|| ProviderError::NotSupported(format!("class {}", class_name)))
    }

    fn namespace_of<'a>(&'a self, path: &'a ObjectPath) -> &'a str {
        if path.namespace.is_empty() {
            &self.namespace
        } else {
            &path.namespace
        }
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Open an enumeration of `class_name`.
    ///
    /// If the handler cannot open its backend enumeration, the list is
    /// cleaned up and the session released before the error is returned.
    #[instrument(skip(self, credentials), fields(operation = "begin"))]
    pub async fn begin(
        &self,
        credentials: &Credentials,
        class_name: &str,
        refs_only: bool,
    ) -> Result<Cursor> {
        if class_name.is_empty() {
            return Err(ProviderError::InvalidParameter(
                "class name is empty".to_string(),
            ));
        }
        let handler = self.instance_handler(class_name)?;
        let lease = self
            .sessions
            .acquire(credentials)
            .await
            .map_err(|e| e.within("begin", class_name))?;

        let mut cursor = Cursor {
            handler,
            list: ResourceList::new(class_name, refs_only),
            lease,
        };

        if let Err(e) = cursor
            .handler
            .list_enum(&mut cursor.list, cursor.lease.session())
            .await
        {
            error!(error = %e, "Failed to enumerate");
            return Err(e.within("list_enum", class_name));
        }

        debug!("Enumeration opened");
        Ok(cursor)
    }

    /// Fetch the next record of an open enumeration.
    ///
    /// `NotFound` means the enumeration is exhausted. Any other error concerns
    /// one record only; the cursor has already moved past it.
    pub async fn getnext(&self, cursor: &mut Cursor) -> Result<Resource> {
        let result = cursor
            .handler
            .record_getnext(&mut cursor.list, cursor.lease.session())
            .await;
        cursor.list.current_resource += 1;

        let class_name = cursor.list.class_name.clone();
        match result {
            Ok(Some(data)) => {
                let record = ResourceRecord::new(class_name, cursor.list.ref_only, data);
                Ok(Resource::new(
                    Arc::clone(&cursor.handler),
                    record,
                    ResourceSession::Borrowed(cursor.lease.shared()),
                ))
            }
            Ok(None) => Err(ProviderError::NotFound(format!(
                "{} enumeration exhausted",
                class_name
            ))),
            // A record that vanished mid-enumeration is skipped like any other bad record
            Err(ProviderError::NotFound(what)) => Err(ProviderError::failed(
                "list_getnext",
                class_name,
                format!("record vanished: {}", what),
            )),
            Err(e) => Err(e.within("list_getnext", &class_name)),
        }
    }

    /// Close an enumeration. Accepts `None` for an enumeration that never opened.
    pub fn end(&self, cursor: Option<Cursor>) {
        if let Some(cursor) = cursor {
            debug!(
                class_name = %cursor.class_name(),
                fetched = cursor.current_resource(),
                "Enumeration closed"
            );
            drop(cursor);
        }
    }

    /// Drive a full enumeration, skipping records that fail.
    ///
    /// A handler that fails [`MAX_CONSECUTIVE_FAILURES`] records in a row is
    /// assumed broken; the records gathered so far are returned.
    async fn enumerate(
        &self,
        credentials: &Credentials,
        class_name: &str,
        refs_only: bool,
        filter: &PropertyFilter,
    ) -> Result<Vec<Instance>> {
        let mut cursor = self.begin(credentials, class_name, refs_only).await?;
        let keys = cursor.handler.keys(class_name);
        let mut found = Vec::new();
        let mut skipped = 0usize;
        let mut consecutive = 0usize;

        loop {
            let resource = match self.getnext(&mut cursor).await {
                Ok(resource) => resource,
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    warn!(class_name, error = %e, "Skipping record");
                    skipped += 1;
                    consecutive += 1;
                    if consecutive >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            class_name,
                            consecutive, "Too many unreadable records, ending enumeration"
                        );
                        break;
                    }
                    continue;
                }
            };
            consecutive = 0;

            let mut instance = Instance::new(self.namespace.as_str(), class_name)
                .with_filter(filter.clone(), &keys);
            match resource.set_properties(&mut instance) {
                Ok(()) => found.push(instance),
                Err(e) => {
                    warn!(class_name, error = %e, "Skipping record that failed set_properties");
                    skipped += 1;
                }
            }
        }

        self.end(Some(cursor));
        info!(class_name, found = found.len(), skipped, "Enumeration complete");
        Ok(found)
    }

    /// Enumerate full instances of a class.
    #[instrument(skip(self, credentials, filter), fields(operation = "enumerate_instances"))]
    pub async fn enumerate_instances(
        &self,
        credentials: &Credentials,
        class_name: &str,
        filter: &PropertyFilter,
    ) -> Result<Vec<Instance>> {
        self.enumerate(credentials, class_name, false, filter).await
    }

    /// Enumerate the object paths of a class.
    #[instrument(skip(self, credentials), fields(operation = "enumerate_instance_names"))]
    pub async fn enumerate_instance_names(
        &self,
        credentials: &Credentials,
        class_name: &str,
    ) -> Result<Vec<ObjectPath>> {
        let instances = self
            .enumerate(credentials, class_name, true, &PropertyFilter::keys_only())
            .await?;
        Ok(instances.iter().map(Instance::path).collect())
    }

    /// Run a WQL query against a class.
    #[instrument(skip(self, credentials), fields(operation = "exec_query"))]
    pub async fn exec_query(
        &self,
        credentials: &Credentials,
        class_name: &str,
        query: &str,
    ) -> Result<Vec<Instance>> {
        let query = Query::parse(query)?;
        if !query.class_name.eq_ignore_ascii_case(class_name) {
            return Err(ProviderError::InvalidParameter(format!(
                "query selects from {} but targets {}",
                query.class_name, class_name
            )));
        }

        let projection = query.filter();
        let mut instances = self
            .enumerate(credentials, class_name, false, &PropertyFilter::all())
            .await?;
        instances.retain(|instance| query.matches(instance));
        for instance in &mut instances {
            instance.retain(&projection);
        }
        Ok(instances)
    }

    // =========================================================================
    // Point operations
    // =========================================================================

    /// Fetch the backend object a path identifies, on a session it owns.
    async fn get_resource(
        &self,
        handler: &Arc<dyn InstanceHandler>,
        credentials: &Credentials,
        path: &ObjectPath,
    ) -> Result<Resource> {
        let class_name = path.class_name.as_str();
        let key = handler.key_property(class_name);
        let id = path.key_str(key).ok_or_else(|| {
            ProviderError::InvalidParameter(format!("{} has no value for key {}", class_name, key))
        })?;

        let lease = self
            .sessions
            .acquire(credentials)
            .await
            .map_err(|e| e.within("get", class_name))?;
        let data = handler
            .record_get_from_id(id, class_name, lease.session())
            .await
            .map_err(|e| e.within("get", class_name))?;

        Ok(Resource::new(
            Arc::clone(handler),
            ResourceRecord::new(class_name, false, data),
            ResourceSession::Owned(lease),
        ))
    }

    /// Get one object by identity.
    #[instrument(skip_all, fields(class_name = %path.class_name, operation = "get"))]
    pub async fn get(
        &self,
        credentials: &Credentials,
        path: &ObjectPath,
        filter: &PropertyFilter,
    ) -> Result<Instance> {
        let handler = self.instance_handler(&path.class_name)?;
        let resource = self.get_resource(&handler, credentials, path).await?;

        let keys = handler.keys(&path.class_name);
        let mut instance = Instance::new(self.namespace_of(path), path.class_name.as_str())
            .with_filter(filter.clone(), &keys);
        resource
            .set_properties(&mut instance)
            .map_err(|e| e.within("set_properties", &path.class_name))?;
        Ok(instance)
    }

    /// Build a detached resource from caller input.
    pub fn extract(
        &self,
        class_name: &str,
        instance: &Instance,
        filter: &PropertyFilter,
    ) -> Result<Resource> {
        let handler = self.instance_handler(class_name)?;
        Self::extract_with(&handler, class_name, instance, filter)
    }

    fn extract_with(
        handler: &Arc<dyn InstanceHandler>,
        class_name: &str,
        instance: &Instance,
        filter: &PropertyFilter,
    ) -> Result<Resource> {
        if !handler.capabilities().supports_extract {
            return Err(ProviderError::NotSupported(format!("extract {}", class_name)));
        }
        let data = handler
            .extract(instance, filter)
            .map_err(|e| e.within("extract", class_name))?;
        Ok(Resource::new(
            Arc::clone(handler),
            ResourceRecord::new(class_name, false, data),
            ResourceSession::Detached,
        ))
    }

    /// Create a new object. Fails with `AlreadyExists` if the identity resolves.
    #[instrument(skip_all, fields(class_name = %path.class_name, operation = "add"))]
    pub async fn add(
        &self,
        credentials: &Credentials,
        path: &ObjectPath,
        instance: &Instance,
    ) -> Result<()> {
        let class_name = path.class_name.as_str();
        let handler = self.instance_handler(class_name)?;
        if !handler.capabilities().supports_add {
            return Err(ProviderError::NotSupported(format!("add {}", class_name)));
        }

        match self.get_resource(&handler, credentials, path).await {
            Ok(existing) => {
                drop(existing);
                return Err(ProviderError::AlreadyExists(path.to_string()));
            }
            Err(ProviderError::NotInitialized) => return Err(ProviderError::NotInitialized),
            Err(e) => debug!(reason = %e, "Target does not resolve, adding"),
        }

        let extracted = Self::extract_with(&handler, class_name, instance, &PropertyFilter::all())?;
        let lease = self
            .sessions
            .acquire(credentials)
            .await
            .map_err(|e| e.within("add", class_name))?;
        handler
            .add(lease.session(), instance, extracted.record())
            .await
            .map_err(|e| e.within("add", class_name))?;

        info!("Instance added");
        Ok(())
    }

    /// Delete an existing object.
    #[instrument(skip_all, fields(class_name = %path.class_name, operation = "delete"))]
    pub async fn delete(&self, credentials: &Credentials, path: &ObjectPath) -> Result<()> {
        let class_name = path.class_name.as_str();
        let handler = self.instance_handler(class_name)?;
        if !handler.capabilities().supports_delete {
            return Err(ProviderError::NotSupported(format!("delete {}", class_name)));
        }

        let existing = self.get_resource(&handler, credentials, path).await?;
        drop(existing);

        let key = handler.key_property(class_name);
        let id = path.key_str(key).unwrap_or_default();
        let lease = self
            .sessions
            .acquire(credentials)
            .await
            .map_err(|e| e.within("delete", class_name))?;
        handler
            .delete(lease.session(), class_name, id)
            .await
            .map_err(|e| e.within("delete", class_name))?;
        // Deleting a job instance also ends the engine's record of it
        if let Ok(uuid) = instance_id::system_name_from_id(id) {
            self.jobs.kill(uuid);
        }

        info!("Instance deleted");
        Ok(())
    }

    /// Modify an existing object from caller-supplied properties.
    ///
    /// The target is re-fetched first so a vanished object is `NotFound`
    /// without reaching the handler's modify.
    #[instrument(skip_all, fields(class_name = %path.class_name, operation = "modify"))]
    pub async fn modify(
        &self,
        credentials: &Credentials,
        path: &ObjectPath,
        instance: &Instance,
        filter: &PropertyFilter,
    ) -> Result<()> {
        let class_name = path.class_name.as_str();
        let handler = self.instance_handler(class_name)?;
        if !handler.capabilities().supports_modify {
            return Err(ProviderError::NotSupported(format!("modify {}", class_name)));
        }

        let existing = self.get_resource(&handler, credentials, path).await?;
        drop(existing);

        let extracted = Self::extract_with(&handler, class_name, instance, filter)?;
        let key = handler.key_property(class_name);
        let id = path.key_str(key).unwrap_or_default();
        let lease = self
            .sessions
            .acquire(credentials)
            .await
            .map_err(|e| e.within("modify", class_name))?;
        handler
            .modify(lease.session(), id, extracted.record(), filter)
            .await
            .map_err(|e| e.within("modify", class_name))?;

        info!("Instance modified");
        Ok(())
    }

    // =========================================================================
    // Methods
    // =========================================================================

    /// Invoke an extrinsic method on the object a path identifies.
    #[instrument(skip_all, fields(class_name = %path.class_name, method = %method))]
    pub async fn invoke_method(
        &self,
        credentials: &Credentials,
        path: &ObjectPath,
        method: &str,
        args: &MethodArgs,
    ) -> Result<MethodOutput> {
        let class_name = path.class_name.as_str();
        let handler = self
            .registry
            .resolve_method_handler(class_name)
            .ok_or_else(|| ProviderError::NotSupported(format!("methods on {}", class_name)))?;

        let lease = self
            .sessions
            .acquire(credentials)
            .await
            .map_err(|e| e.within(method, class_name))?;
        let call = MethodCall {
            path,
            method,
            args,
            session: lease.session(),
            credentials,
            jobs: &self.jobs,
        };

        let output = handler
            .invoke(call)
            .await
            .map_err(|e| e.within(method, class_name))?;
        info!(return_value = output.return_value, "Method invoked");
        Ok(output)
    }
}
