//! `Xen_VirtualSystemMigrationService` methods.
//!
//! The `...ToHost` variants name the destination by address, hostname or
//! label; the `...ToSystem` variants pass a host reference.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::backend::PoolSession;
use crate::error::{ProviderError, Result};
use crate::handler::{MethodCall, MethodHandler};
use crate::jobs::JobContext;
use crate::types::*;

pub const MIGRATION_SERVICE: &str = "Xen_VirtualSystemMigrationService";

/// Job class created by a migration.
pub const MIGRATION_JOB: &str = "Xen_VirtualSystemMigrationServiceJob";

pub struct MigrationMethods;

/// The VM argument: a reference with a `Name` key, or a bare UUID string.
fn vm_argument(args: &MethodArgs) -> Result<String> {
    if let Some(path) = args.get_reference("ComputerSystem") {
        return path.key_str("Name").map(str::to_string).ok_or_else(|| {
            ProviderError::InvalidParameter("ComputerSystem is missing the Name key".into())
        });
    }
    args.get_str("ComputerSystem")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidParameter("ComputerSystem is required".into()))
}

/// Resolve the destination host UUID.
async fn destination(args: &MethodArgs, by_address: bool, session: &dyn PoolSession) -> Result<String> {
    if !by_address {
        let path = args
            .get_reference("DestinationSystem")
            .ok_or_else(|| ProviderError::InvalidParameter("DestinationSystem is required".into()))?;
        let uuid = path.key_str("Name").ok_or_else(|| {
            ProviderError::InvalidParameter("DestinationSystem is missing the Name key".into())
        })?;
        session.host_get_record(uuid).await?;
        return Ok(uuid.to_string());
    }

    let wanted = args
        .get_str("DestinationHost")
        .ok_or_else(|| ProviderError::InvalidParameter("DestinationHost is required".into()))?;
    for uuid in session.host_get_all().await? {
        let host = session.host_get_record(&uuid).await?;
        if host.address == wanted || host.hostname == wanted || host.name_label == wanted {
            debug!(host = %uuid, wanted, "Resolved destination host");
            return Ok(uuid);
        }
    }
    Err(ProviderError::InvalidParameter(format!(
        "no host matches DestinationHost '{}'",
        wanted
    )))
}

impl MigrationMethods {
    #[instrument(skip_all, fields(method = %call.method))]
    async fn check(&self, call: MethodCall<'_>, by_address: bool) -> Result<MethodOutput> {
        let host = destination(call.args, by_address, call.session).await?;
        let vm = vm_argument(call.args)?;

        let output = match call.session.vm_assert_can_migrate(&vm, &host).await {
            Ok(()) => MethodOutput::new(return_code::COMPLETED).with_arg("IsMigratable", true),
            Err(e) => {
                info!(vm_id = %vm, host = %host, reason = %e, "VM is not migratable");
                MethodOutput::new(return_code::COMPLETED)
                    .with_arg("IsMigratable", false)
                    .with_arg("Reason", e.to_string())
            }
        };
        Ok(output)
    }

    #[instrument(skip_all, fields(method = %call.method))]
    async fn migrate(&self, call: MethodCall<'_>, by_address: bool) -> Result<MethodOutput> {
        let host = destination(call.args, by_address, call.session).await?;
        let vm = vm_argument(call.args)?;
        call.session.vm_get_record(&vm).await?;

        let job = call
            .jobs
            .create(
                call.session,
                call.credentials,
                MIGRATION_JOB,
                &vm,
                move |ctx: JobContext| async move {
                    ctx.change_state(JobState::Running, 0, 0, Some("Migration started"))
                        .await?;
                    ctx.session()
                        .vm_pool_migrate(ctx.target_id(), &host, true)
                        .await?;
                    ctx.change_state(JobState::Completed, 100, 0, Some("Migration completed"))
                        .await
                },
            )
            .await?;

        info!(job_id = %job.id(), vm_id = %vm, "Migration job started");
        Ok(MethodOutput::new(return_code::JOB_STARTED)
            .with_arg("Job", job.reference().clone()))
    }
}

#[async_trait]
impl MethodHandler for MigrationMethods {
    async fn invoke(&self, call: MethodCall<'_>) -> Result<MethodOutput> {
        match call.method {
            "MigrateVirtualSystemToHost" => self.migrate(call, true).await,
            "MigrateVirtualSystemToSystem" => self.migrate(call, false).await,
            "CheckVirtualSystemIsMigratableToHost" => self.check(call, true).await,
            "CheckVirtualSystemIsMigratableToSystem" => self.check(call, false).await,
            other => Err(ProviderError::MethodNotFound(format!(
                "{}.{}",
                MIGRATION_SERVICE, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::handlers::computer_system::VM_CLASS;
    use crate::handlers::host::HOST_CLASS;
    use crate::lifecycle::ProviderContext;
    use crate::mock::MockPool;
    use std::sync::Arc;

    fn creds() -> Credentials {
        Credentials::new("root", "secret")
    }

    fn service() -> ObjectPath {
        ObjectPath::new("root/cimv2", MIGRATION_SERVICE).with_key("Name", "Xen Migration Service")
    }

    fn vm_ref(uuid: &str) -> ObjectPath {
        ObjectPath::new("root/cimv2", VM_CLASS)
            .with_key("CreationClassName", VM_CLASS)
            .with_key("Name", uuid)
    }

    async fn setup() -> (MockPool, ProviderContext, String, String) {
        let pool = MockPool::new();
        pool.add_host("host-a");
        let vm = pool.add_vm("web-01", VmPowerState::Running);
        let target = pool.add_host("host-b");
        let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool.clone()));
        provider.init().await.unwrap();
        (pool, provider, vm, target)
    }

    #[tokio::test]
    async fn test_check_migratable() {
        let (pool, provider, vm, target) = setup().await;
        let resident = pool.vm(&vm).unwrap().resident_on.unwrap();
        assert_ne!(resident, target);

        let ok = provider
            .dispatcher()
            .invoke_method(
                &creds(),
                &service(),
                "CheckVirtualSystemIsMigratableToHost",
                &MethodArgs::new()
                    .with("ComputerSystem", vm_ref(&vm))
                    .with("DestinationHost", "host-b"),
            )
            .await
            .unwrap();
        assert_eq!(ok.return_value, return_code::COMPLETED);
        assert_eq!(ok.arg("IsMigratable"), Some(&Value::Bool(true)));

        // Already resident on the destination
        let host_ref = ObjectPath::new("root/cimv2", HOST_CLASS).with_key("Name", resident.as_str());
        let refused = provider
            .dispatcher()
            .invoke_method(
                &creds(),
                &service(),
                "CheckVirtualSystemIsMigratableToSystem",
                &MethodArgs::new()
                    .with("ComputerSystem", vm.as_str())
                    .with("DestinationSystem", host_ref),
            )
            .await
            .unwrap();
        assert_eq!(refused.arg("IsMigratable"), Some(&Value::Bool(false)));
        assert!(refused.arg("Reason").is_some());
    }

    #[tokio::test]
    async fn test_migrate_runs_job() {
        let (pool, provider, vm, target) = setup().await;

        let output = provider
            .dispatcher()
            .invoke_method(
                &creds(),
                &service(),
                "MigrateVirtualSystemToHost",
                &MethodArgs::new()
                    .with("ComputerSystem", vm_ref(&vm))
                    .with("DestinationHost", "host-b"),
            )
            .await
            .unwrap();
        assert_eq!(output.return_value, return_code::JOB_STARTED);
        let job_ref = output.arg("Job").and_then(Value::as_reference).unwrap().clone();
        assert_eq!(job_ref.class_name, MIGRATION_JOB);

        provider.jobs().wait_idle().await;
        assert_eq!(pool.vm(&vm).unwrap().resident_on.as_deref(), Some(target.as_str()));

        let job = provider
            .dispatcher()
            .get(&creds(), &job_ref, &PropertyFilter::all())
            .await
            .unwrap();
        assert_eq!(job.get("JobState"), Some(&Value::U16(7)));
        assert_eq!(job.get_str("Description"), Some("Migration completed"));
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let (pool, provider, vm, _) = setup().await;
        let dispatcher = provider.dispatcher();

        let unknown_host = dispatcher
            .invoke_method(
                &creds(),
                &service(),
                "MigrateVirtualSystemToHost",
                &MethodArgs::new()
                    .with("ComputerSystem", vm.as_str())
                    .with("DestinationHost", "198.51.100.1"),
            )
            .await;
        assert!(matches!(unknown_host, Err(ProviderError::InvalidParameter(_))));

        let no_vm = dispatcher
            .invoke_method(
                &creds(),
                &service(),
                "MigrateVirtualSystemToHost",
                &MethodArgs::new().with("DestinationHost", "host-b"),
            )
            .await;
        assert!(matches!(no_vm, Err(ProviderError::InvalidParameter(_))));

        let unknown = dispatcher
            .invoke_method(&creds(), &service(), "Teleport", &MethodArgs::new())
            .await;
        assert!(matches!(unknown, Err(ProviderError::MethodNotFound(_))));
        assert_eq!(pool.task_count(), 0);
        assert_eq!(pool.live_sessions(), 0);
    }
}
