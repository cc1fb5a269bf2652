//! Pool-wide service singletons.
//!
//! Each service class has exactly one instance per pool, hosted on the
//! pool's first host. Its `Name` is fixed per class.

use async_trait::async_trait;

use crate::backend::PoolSession;
use crate::error::{ProviderError, Result};
use crate::handler::{InstanceHandler, RecordData, ResourceList, ResourceRecord};
use crate::handlers::host::HOST_CLASS;
use crate::types::*;

pub const SERVICE_CLASSES: &[&str] = &[
    "Xen_VirtualSystemManagementService",
    "Xen_VirtualSystemMigrationService",
    "Xen_VirtualSystemSnapshotService",
    "Xen_VirtualSwitchManagementService",
    "Xen_StoragePoolManagementService",
];

/// Fixed `Name` of a service class.
pub fn service_name(class_name: &str) -> Option<&'static str> {
    match class_name {
        "Xen_VirtualSystemManagementService" => Some("Xen Hypervisor"),
        "Xen_VirtualSystemMigrationService" => Some("Xen Migration Service"),
        "Xen_VirtualSystemSnapshotService" => Some("Xen Virtual System Snapshot Service"),
        "Xen_VirtualSwitchManagementService" => Some("Xen Virtual Switch Management Service"),
        "Xen_StoragePoolManagementService" => Some("XenServer SR Management Service"),
        _ => None,
    }
}

pub struct ServicesHandler;

/// The service singleton: its name and the host it is scoped to.
struct ServiceRecord {
    name: &'static str,
    system_name: String,
}

/// Hosting system of the pool's services: the lowest host UUID.
async fn pool_system(session: &dyn PoolSession) -> Result<Option<String>> {
    let hosts = session.host_get_all().await?;
    Ok(hosts.into_iter().min())
}

fn known_service(class_name: &str) -> Result<&'static str> {
    service_name(class_name)
        .ok_or_else(|| ProviderError::NotSupported(format!("service class {}", class_name)))
}

#[async_trait]
impl InstanceHandler for ServicesHandler {
    fn key_property(&self, _class_name: &str) -> &'static str {
        "Name"
    }

    fn keys(&self, _class_name: &str) -> Vec<&'static str> {
        vec!["SystemName", "SystemCreationClassName", "CreationClassName", "Name"]
    }

    async fn list_enum(&self, list: &mut ResourceList, session: &dyn PoolSession) -> Result<()> {
        let name = known_service(&list.class_name)?;
        let records: Vec<ServiceRecord> = pool_system(session)
            .await?
            .map(|system_name| ServiceRecord { name, system_name })
            .into_iter()
            .collect();
        list.ctx = Some(Box::new(records));
        Ok(())
    }

    async fn record_getnext(
        &self,
        list: &mut ResourceList,
        _session: &dyn PoolSession,
    ) -> Result<Option<RecordData>> {
        let records = list.ctx::<Vec<ServiceRecord>>()?;
        Ok(records.get(list.current_resource).map(|r| {
            Box::new(ServiceRecord {
                name: r.name,
                system_name: r.system_name.clone(),
            }) as RecordData
        }))
    }

    async fn record_get_from_id(
        &self,
        id: &str,
        class_name: &str,
        session: &dyn PoolSession,
    ) -> Result<RecordData> {
        let name = known_service(class_name)?;
        if id != name {
            return Err(ProviderError::NotFound(format!("{} named {}", class_name, id)));
        }
        let system_name = pool_system(session)
            .await?
            .ok_or_else(|| ProviderError::NotFound("pool has no hosts".to_string()))?;
        Ok(Box::new(ServiceRecord { name, system_name }))
    }

    fn set_properties(&self, record: &ResourceRecord, instance: &mut Instance) -> Result<()> {
        let service = record.data::<ServiceRecord>()?;

        instance.set("SystemName", service.system_name.as_str());
        instance.set("SystemCreationClassName", HOST_CLASS);
        instance.set("CreationClassName", record.class_name.as_str());
        instance.set("Name", service.name);
        if record.ref_only {
            return Ok(());
        }

        instance.set("Caption", service.name);
        instance.set("ElementName", service.name);
        instance.set("Description", service.name);
        instance.set("EnabledState", 2u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::lifecycle::ProviderContext;
    use crate::mock::MockPool;
    use std::sync::Arc;

    const MIGRATION: &str = "Xen_VirtualSystemMigrationService";

    #[test]
    fn test_every_class_has_a_name() {
        for class_name in SERVICE_CLASSES {
            assert!(service_name(class_name).is_some(), "{class_name}");
        }
        assert_eq!(service_name("Xen_Bogus"), None);
    }

    #[tokio::test]
    async fn test_one_instance_per_pool() {
        let pool = MockPool::new();
        let a = pool.add_host("host-a");
        let b = pool.add_host("host-b");
        let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool.clone()));
        provider.init().await.unwrap();
        let creds = Credentials::new("root", "secret");

        let names = provider
            .dispatcher()
            .enumerate_instance_names(&creds, MIGRATION)
            .await
            .unwrap();
        assert_eq!(names.len(), 1);
        let path = &names[0];
        assert_eq!(path.key_str("Name"), Some("Xen Migration Service"));
        assert_eq!(path.key_str("SystemName"), Some(a.as_str().min(b.as_str())));

        let inst = provider
            .dispatcher()
            .get(&creds, path, &PropertyFilter::all())
            .await
            .unwrap();
        assert_eq!(inst.get("EnabledState"), Some(&Value::U16(2)));

        let wrong = ObjectPath::new("root/cimv2", MIGRATION).with_key("Name", "Other");
        let missing = provider
            .dispatcher()
            .get(&creds, &wrong, &PropertyFilter::all())
            .await;
        assert!(matches!(missing, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_services() {
        let pool = MockPool::new();
        let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool.clone()));
        provider.init().await.unwrap();

        let all = provider
            .dispatcher()
            .enumerate_instances(
                &Credentials::new("root", "secret"),
                MIGRATION,
                &PropertyFilter::all(),
            )
            .await
            .unwrap();
        assert!(all.is_empty());
    }
}
