//! `Xen_ComputerSystem`: one instance per VM, plus `RequestStateChange`.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::backend::PoolSession;
use crate::error::{ProviderError, Result};
use crate::handler::{
    HandlerCapabilities, InstanceHandler, MethodCall, MethodHandler, RecordData, ResourceList,
    ResourceRecord,
};
use crate::handlers::required_key;
use crate::jobs::JobContext;
use crate::types::*;

pub const VM_CLASS: &str = "Xen_ComputerSystem";

/// Job class created by `RequestStateChange`.
pub const STATE_CHANGE_JOB: &str = "Xen_SystemStateChangeJob";

/// Instance handler for VMs.
pub struct VmHandler;

struct VmList {
    uuids: Vec<String>,
}

/// Writable VM properties taken from a caller-supplied instance.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VmChanges {
    pub name_label: Option<String>,
    pub name_description: Option<String>,
}

#[async_trait]
impl InstanceHandler for VmHandler {
    fn key_property(&self, _class_name: &str) -> &'static str {
        "Name"
    }

    fn keys(&self, _class_name: &str) -> Vec<&'static str> {
        vec!["CreationClassName", "Name"]
    }

    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities {
            supports_modify: true,
            supports_extract: true,
            ..HandlerCapabilities::default()
        }
    }

    async fn list_enum(&self, list: &mut ResourceList, session: &dyn PoolSession) -> Result<()> {
        let uuids = session.vm_get_all().await?;
        debug!(count = uuids.len(), "Listed VMs");
        list.ctx = Some(Box::new(VmList { uuids }));
        Ok(())
    }

    async fn record_getnext(
        &self,
        list: &mut ResourceList,
        session: &dyn PoolSession,
    ) -> Result<Option<RecordData>> {
        let vms = list.ctx::<VmList>()?;
        match vms.uuids.get(list.current_resource) {
            Some(uuid) => Ok(Some(Box::new(session.vm_get_record(uuid).await?))),
            None => Ok(None),
        }
    }

    async fn record_get_from_id(
        &self,
        id: &str,
        _class_name: &str,
        session: &dyn PoolSession,
    ) -> Result<RecordData> {
        Ok(Box::new(session.vm_get_record(id).await?))
    }

    fn set_properties(&self, record: &ResourceRecord, instance: &mut Instance) -> Result<()> {
        let vm = record.data::<VmRecord>()?;

        instance.set("CreationClassName", record.class_name.as_str());
        instance.set("Name", vm.uuid.as_str());
        if record.ref_only {
            return Ok(());
        }

        instance.set("Caption", "Xen Virtual System");
        instance.set("ElementName", vm.name_label.as_str());
        instance.set("Description", vm.name_description.as_str());
        instance.set("EnabledState", vm.power_state.enabled_state());
        instance.set("NumberOfProcessors", vm.vcpus);
        instance.set("MemoryBytes", vm.memory_bytes);
        if let Some(host) = &vm.resident_on {
            instance.set("ResidentOn", host.as_str());
        }
        Ok(())
    }

    fn extract(&self, instance: &Instance, properties: &PropertyFilter) -> Result<RecordData> {
        let pick = |name: &str| {
            if properties.admits(name) {
                instance.get_str(name).map(str::to_string)
            } else {
                None
            }
        };
        Ok(Box::new(VmChanges {
            name_label: pick("ElementName"),
            name_description: pick("Description"),
        }))
    }

    async fn modify(
        &self,
        session: &dyn PoolSession,
        id: &str,
        record: &ResourceRecord,
        _properties: &PropertyFilter,
    ) -> Result<()> {
        let changes = record.data::<VmChanges>()?;
        if let Some(label) = &changes.name_label {
            session.vm_set_name_label(id, label).await?;
        }
        if let Some(description) = &changes.name_description {
            session.vm_set_name_description(id, description).await?;
        }
        info!(vm_id = %id, ?changes, "VM modified");
        Ok(())
    }
}

/// Method handler for VMs.
pub struct VmMethods;

impl VmMethods {
    #[instrument(skip_all, fields(vm_id))]
    async fn request_state_change(&self, call: MethodCall<'_>) -> Result<MethodOutput> {
        let vm_id = required_key(call.path, "Name")?.to_string();
        tracing::Span::current().record("vm_id", vm_id.as_str());

        let requested = call
            .args
            .get_u64("RequestedState")
            .ok_or_else(|| ProviderError::InvalidParameter("RequestedState is required".into()))?;
        let vm = call.session.vm_get_record(&vm_id).await?;

        let op = match u16::try_from(requested)
            .ok()
            .and_then(|state| VmPowerOp::from_requested_state(state, vm.power_state))
        {
            Some(op) => op,
            None => {
                debug!(requested, "Unsupported requested state");
                return Ok(MethodOutput::new(return_code::INVALID_PARAMETER));
            }
        };

        let job = call
            .jobs
            .create(
                call.session,
                call.credentials,
                STATE_CHANGE_JOB,
                &vm_id,
                move |ctx: JobContext| async move {
                    ctx.change_state(JobState::Running, 0, 0, None).await?;
                    ctx.session().vm_power_op(ctx.target_id(), op).await?;
                    ctx.change_state(JobState::Completed, 100, 0, Some("VM state changed"))
                        .await
                },
            )
            .await?;

        info!(job_id = %job.id(), ?op, "State change job started");
        Ok(MethodOutput::new(return_code::JOB_STARTED)
            .with_arg("Job", job.reference().clone()))
    }
}

#[async_trait]
impl MethodHandler for VmMethods {
    async fn invoke(&self, call: MethodCall<'_>) -> Result<MethodOutput> {
        match call.method {
            "RequestStateChange" => self.request_state_change(call).await,
            other => Err(ProviderError::MethodNotFound(format!("{}.{}", VM_CLASS, other))),
        }
    }
}
