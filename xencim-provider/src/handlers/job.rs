//! Job classes, backed by pool tasks.
//!
//! A job of class `C` is a task whose `name_label` is `C`. Progress and
//! operation outputs live in the task's `other_config` (see [`crate::jobs::keys`]).

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::PoolSession;
use crate::error::{ProviderError, Result};
use crate::handler::{
    HandlerCapabilities, InstanceHandler, MethodCall, MethodHandler, RecordData, ResourceList,
    ResourceRecord,
};
use crate::handlers::required_key;
use crate::instance_id;
use crate::jobs::keys;
use crate::types::*;

/// Every job class the provider serves.
pub const JOB_CLASSES: &[&str] = &[
    "Xen_SystemStateChangeJob",
    "Xen_VirtualSystemMigrationServiceJob",
    "Xen_VirtualSystemManagementServiceJob",
    "Xen_VirtualSystemCreateJob",
    "Xen_VirtualSystemModifyResourcesJob",
    "Xen_ConnectToDiskImageJob",
    "Xen_DisconnectFromDiskImageJob",
    "Xen_StartSnapshotForestExportJob",
    "Xen_EndSnapshotForestExportJob",
];

/// Instance handler for all job classes.
pub struct JobHandler;

/// Tasks of the enumerated class.
struct TaskList {
    uuids: Vec<String>,
}

fn parse_u16(task: &TaskRecord, key: &str, default: u16) -> u16 {
    task.other_config
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Copy string outputs from `other_config` into the instance, when present.
fn set_outputs(task: &TaskRecord, instance: &mut Instance, names: &[&str]) {
    for name in names {
        if let Some(value) = task.other_config.get(*name) {
            instance.set(name, value.as_str());
        }
    }
}

#[async_trait]
impl InstanceHandler for JobHandler {
    fn key_property(&self, _class_name: &str) -> &'static str {
        "InstanceID"
    }

    fn capabilities(&self) -> HandlerCapabilities {
        HandlerCapabilities {
            supports_delete: true,
            ..HandlerCapabilities::default()
        }
    }

    async fn list_enum(&self, list: &mut ResourceList, session: &dyn PoolSession) -> Result<()> {
        let all = session.task_get_all().await?;
        let mut uuids = Vec::new();
        for uuid in all {
            match session.task_get_record(&uuid).await {
                Ok(task) if task.name_label == list.class_name => uuids.push(uuid),
                Ok(_) => {}
                Err(e) => debug!(task = %uuid, error = %e, "Skipping unreadable task"),
            }
        }
        debug!(class_name = %list.class_name, count = uuids.len(), "Listed job tasks");
        list.ctx = Some(Box::new(TaskList { uuids }));
        Ok(())
    }

    async fn record_getnext(
        &self,
        list: &mut ResourceList,
        session: &dyn PoolSession,
    ) -> Result<Option<RecordData>> {
        let tasks = list.ctx::<TaskList>()?;
        let uuid = match tasks.uuids.get(list.current_resource) {
            Some(uuid) => uuid,
            None => return Ok(None),
        };
        let task = session.task_get_record(uuid).await?;
        Ok(Some(Box::new(task)))
    }

    async fn record_get_from_id(
        &self,
        id: &str,
        class_name: &str,
        session: &dyn PoolSession,
    ) -> Result<RecordData> {
        let uuid = instance_id::system_name_from_id(id)?;
        let task = session.task_get_record(uuid).await?;
        if task.name_label != class_name {
            return Err(ProviderError::InvalidParameter(format!(
                "task {} is a {}, not a {}",
                uuid, task.name_label, class_name
            )));
        }
        Ok(Box::new(task))
    }

    fn set_properties(&self, record: &ResourceRecord, instance: &mut Instance) -> Result<()> {
        let task = record.data::<TaskRecord>()?;

        instance.set("Caption", "Xen Task");
        if let Some(description) = task.other_config.get(keys::DESCRIPTION) {
            instance.set("Description", description.as_str());
        }
        instance.set("ElementName", task.name_description.as_str());
        instance.set("ErrorCode", parse_u16(task, keys::ERROR_CODE, 0));
        if let Some(description) = task.other_config.get(keys::ERROR_DESCRIPTION) {
            instance.set("ErrorDescription", description.as_str());
        }
        instance.set("InstanceID", instance_id::format(&task.uuid));
        instance.set(
            "JobState",
            parse_u16(task, keys::CIM_JOB_STATE, JobState::New.as_u16()),
        );
        instance.set("Name", task.name_label.as_str());
        instance.set("PercentComplete", parse_u16(task, keys::PERCENT_COMPLETE, 0));
        instance.set("StartTime", task.created);

        match record.class_name.as_str() {
            "Xen_ConnectToDiskImageJob" => set_outputs(
                task,
                instance,
                &["TargetURI", "SSLCertificate", "ConnectionHandle", "Username", "Password"],
            ),
            "Xen_VirtualSystemModifyResourcesJob" => {
                if let Some(paths) = task.other_config.get("AffectedResources") {
                    instance.set("AffectedResources", split_list(paths, ';'));
                }
            }
            "Xen_VirtualSystemCreateJob" => set_outputs(task, instance, &["ResultingSystem"]),
            "Xen_StartSnapshotForestExportJob" => {
                for name in ["DiskImageURIs", "SSLCertificates"] {
                    if let Some(list) = task.other_config.get(name) {
                        let items = split_list(list, ',');
                        if !items.is_empty() {
                            instance.set(name, items);
                        }
                    }
                }
                set_outputs(task, instance, &["MetadataURI", "ExportConnectionHandle"]);
            }
            _ => {}
        }
        Ok(())
    }

    async fn delete(&self, session: &dyn PoolSession, _class_name: &str, id: &str) -> Result<()> {
        let uuid = instance_id::system_name_from_id(id)?;
        session.task_destroy(uuid).await?;
        info!(task = %uuid, "Job task destroyed");
        Ok(())
    }
}

/// Method handler for all job classes.
pub struct JobMethods;

#[async_trait]
impl MethodHandler for JobMethods {
    async fn invoke(&self, call: MethodCall<'_>) -> Result<MethodOutput> {
        match call.method {
            "KillJob" => {
                let id = required_key(call.path, "InstanceID")?;
                let uuid = instance_id::system_name_from_id(id)?;
                call.session.task_destroy(uuid).await?;
                if !call.jobs.kill(uuid) {
                    debug!(task = %uuid, "Killed task had no running worker");
                }
                info!(task = %uuid, "Job killed");
                Ok(MethodOutput::new(return_code::COMPLETED))
            }
            other => Err(ProviderError::MethodNotFound(format!(
                "{}.{}",
                call.path.class_name, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn task(class_name: &str, config: &[(&str, &str)]) -> TaskRecord {
        TaskRecord {
            uuid: "t-1".to_string(),
            name_label: class_name.to_string(),
            name_description: "vm-1".to_string(),
            created: Utc::now(),
            other_config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn render(class_name: &str, config: &[(&str, &str)]) -> Instance {
        let record = ResourceRecord::new(class_name, false, Box::new(task(class_name, config)));
        let mut instance = Instance::new("root/cimv2", class_name);
        JobHandler.set_properties(&record, &mut instance).unwrap();
        instance
    }

    #[test]
    fn test_common_properties() {
        let inst = render(
            "Xen_SystemStateChangeJob",
            &[("CIMJobState", "10"), ("PercentComplete", "100"), ("ErrorCode", "1"), ("ErrorDescription", "boom")],
        );
        assert_eq!(inst.get_str("InstanceID"), Some("Xen:t-1"));
        assert_eq!(inst.get_str("Name"), Some("Xen_SystemStateChangeJob"));
        assert_eq!(inst.get_str("ElementName"), Some("vm-1"));
        assert_eq!(inst.get("JobState"), Some(&Value::U16(10)));
        assert_eq!(inst.get("PercentComplete"), Some(&Value::U16(100)));
        assert_eq!(inst.get_str("ErrorDescription"), Some("boom"));
        assert!(inst.get("Description").is_none());
    }

    #[test]
    fn test_missing_state_defaults_to_new() {
        let inst = render("Xen_SystemStateChangeJob", &[]);
        assert_eq!(inst.get("JobState"), Some(&Value::U16(2)));
        assert_eq!(inst.get("PercentComplete"), Some(&Value::U16(0)));
    }

    #[test]
    fn test_class_specific_outputs() {
        let inst = render(
            "Xen_VirtualSystemModifyResourcesJob",
            &[("AffectedResources", "a;b; ;c")],
        );
        assert_eq!(
            inst.get("AffectedResources"),
            Some(&Value::StringArray(vec!["a".into(), "b".into(), "c".into()]))
        );

        let inst = render(
            "Xen_StartSnapshotForestExportJob",
            &[("DiskImageURIs", "u1,u2"), ("MetadataURI", "m"), ("SSLCertificates", "")],
        );
        assert_eq!(
            inst.get("DiskImageURIs"),
            Some(&Value::StringArray(vec!["u1".into(), "u2".into()]))
        );
        assert_eq!(inst.get_str("MetadataURI"), Some("m"));
        assert!(inst.get("SSLCertificates").is_none());

        // Outputs of other classes are not exposed
        let inst = render("Xen_SystemStateChangeJob", &[("ResultingSystem", "x")]);
        assert!(inst.get("ResultingSystem").is_none());
    }
}
