//! `Xen_HostComputerSystem`: one read-only instance per pool host.

use async_trait::async_trait;

use crate::backend::PoolSession;
use crate::error::Result;
use crate::handler::{InstanceHandler, RecordData, ResourceList, ResourceRecord};
use crate::types::*;

pub const HOST_CLASS: &str = "Xen_HostComputerSystem";

pub struct HostHandler;

struct HostList {
    uuids: Vec<String>,
}

#[async_trait]
impl InstanceHandler for HostHandler {
    fn key_property(&self, _class_name: &str) -> &'static str {
        "Name"
    }

    fn keys(&self, _class_name: &str) -> Vec<&'static str> {
        vec!["CreationClassName", "Name"]
    }

    async fn list_enum(&self, list: &mut ResourceList, session: &dyn PoolSession) -> Result<()> {
        let uuids = session.host_get_all().await?;
        list.ctx = Some(Box::new(HostList { uuids }));
        Ok(())
    }

    async fn record_getnext(
        &self,
        list: &mut ResourceList,
        session: &dyn PoolSession,
    ) -> Result<Option<RecordData>> {
        let hosts = list.ctx::<HostList>()?;
        match hosts.uuids.get(list.current_resource) {
            Some(uuid) => Ok(Some(Box::new(session.host_get_record(uuid).await?))),
            None => Ok(None),
        }
    }

    async fn record_get_from_id(
        &self,
        id: &str,
        _class_name: &str,
        session: &dyn PoolSession,
    ) -> Result<RecordData> {
        Ok(Box::new(session.host_get_record(id).await?))
    }

    fn set_properties(&self, record: &ResourceRecord, instance: &mut Instance) -> Result<()> {
        let host = record.data::<HostRecord>()?;

        instance.set("CreationClassName", record.class_name.as_str());
        instance.set("Name", host.uuid.as_str());
        if record.ref_only {
            return Ok(());
        }

        instance.set("Caption", "XenServer Host");
        instance.set("ElementName", host.name_label.as_str());
        instance.set("Description", host.name_description.as_str());
        // Enabled = 2, Disabled = 3
        instance.set("EnabledState", if host.enabled { 2u16 } else { 3u16 });
        instance.set("HostName", host.hostname.as_str());
        instance.set("Address", host.address.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::error::ProviderError;
    use crate::lifecycle::ProviderContext;
    use crate::mock::MockPool;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_hosts_are_read_only() {
        let pool = MockPool::new();
        let host = pool.add_host("host-a");
        let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool.clone()));
        provider.init().await.unwrap();
        let creds = Credentials::new("root", "secret");
        let path = ObjectPath::new("root/cimv2", HOST_CLASS)
            .with_key("CreationClassName", HOST_CLASS)
            .with_key("Name", host.as_str());

        let inst = provider
            .dispatcher()
            .get(&creds, &path, &PropertyFilter::all())
            .await
            .unwrap();
        assert_eq!(inst.get_str("ElementName"), Some("host-a"));
        assert_eq!(inst.get_str("HostName"), Some("host-a"));
        assert_eq!(inst.get("EnabledState"), Some(&Value::U16(2)));

        let deleted = provider.dispatcher().delete(&creds, &path).await;
        assert!(matches!(deleted, Err(ProviderError::NotSupported(_))));

        let missing = provider
            .dispatcher()
            .get(
                &creds,
                &ObjectPath::new("root/cimv2", HOST_CLASS).with_key("Name", "nope"),
                &PropertyFilter::all(),
            )
            .await;
        assert!(matches!(missing, Err(ProviderError::NotFound(_))));
        assert_eq!(pool.live_sessions(), 0);
    }
}
