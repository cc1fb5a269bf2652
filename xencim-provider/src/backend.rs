//! Pool backend abstraction.
//!
//! [`PoolBackend`] is the process-wide connection factory; [`PoolSession`] is
//! one authenticated connection acquired per call or per job. The provider
//! never talks to the pool except through these two traits, which lets the
//! dispatch framework run against the in-memory [`crate::MockPool`] in tests.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::BackendResult;
use crate::types::*;

/// Process-wide connection factory for a hypervisor pool.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// Establish the shared connection state. Called once by provider init.
    async fn connect(&self) -> BackendResult<()>;

    /// Tear down the shared connection state. Called by provider uninit.
    async fn disconnect(&self) -> BackendResult<()>;

    /// Open an authenticated session for the given caller.
    async fn login(&self, credentials: &Credentials) -> BackendResult<Arc<dyn PoolSession>>;

    /// Release a session opened by [`PoolBackend::login`].
    ///
    /// Synchronous so it can run from `Drop`.
    fn logout(&self, session: &dyn PoolSession);
}

/// One authenticated connection to the pool.
///
/// Object references are UUID strings throughout.
#[async_trait]
pub trait PoolSession: Send + Sync {
    /// Opaque identifier of this session, used for logout bookkeeping.
    fn id(&self) -> &str;

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Create a backend task. Returns its UUID.
    async fn task_create(&self, name_label: &str, name_description: &str) -> BackendResult<String>;

    async fn task_get_all(&self) -> BackendResult<Vec<String>>;

    async fn task_get_record(&self, task: &str) -> BackendResult<TaskRecord>;

    /// Set (or with `None`, remove) one key of the task's `other_config`.
    async fn task_set_other_config(
        &self,
        task: &str,
        key: &str,
        value: Option<&str>,
    ) -> BackendResult<()>;

    async fn task_destroy(&self, task: &str) -> BackendResult<()>;

    // =========================================================================
    // VMs
    // =========================================================================

    async fn vm_get_all(&self) -> BackendResult<Vec<String>>;

    async fn vm_get_record(&self, vm: &str) -> BackendResult<VmRecord>;

    async fn vm_set_name_label(&self, vm: &str, label: &str) -> BackendResult<()>;

    async fn vm_set_name_description(&self, vm: &str, description: &str) -> BackendResult<()>;

    /// Run a power operation to completion.
    async fn vm_power_op(&self, vm: &str, op: VmPowerOp) -> BackendResult<()>;

    /// Migrate a VM to another host in the pool.
    async fn vm_pool_migrate(&self, vm: &str, host: &str, live: bool) -> BackendResult<()>;

    /// Fails if the VM cannot be migrated to the host.
    async fn vm_assert_can_migrate(&self, vm: &str, host: &str) -> BackendResult<()>;

    // =========================================================================
    // Hosts
    // =========================================================================

    async fn host_get_all(&self) -> BackendResult<Vec<String>>;

    async fn host_get_record(&self, host: &str) -> BackendResult<HostRecord>;
}
