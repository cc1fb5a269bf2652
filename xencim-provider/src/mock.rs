//! Mock pool backend for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{PoolBackend, PoolSession};
use crate::error::{BackendError, BackendResult};
use crate::types::*;

/// Mock pool backend for testing.
///
/// This backend simulates a pool in memory without requiring a real
/// hypervisor. It counts logins and logouts so tests can assert that every
/// session opened by the provider is released, and it can inject failures:
/// - refuse logins
/// - fail record fetches for chosen UUIDs
/// - fail disconnect
///
/// Clones share the same pool state.
#[derive(Clone, Default)]
pub struct MockPool {
    inner: Arc<PoolState>,
}

#[derive(Default)]
struct PoolState {
    vms: RwLock<HashMap<String, VmRecord>>,
    hosts: RwLock<HashMap<String, HostRecord>>,
    tasks: RwLock<HashMap<String, TaskRecord>>,
    sessions: RwLock<HashSet<String>>,
    failing: RwLock<HashSet<String>>,
    connected: AtomicBool,
    fail_login: AtomicBool,
    fail_disconnect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    logins: AtomicUsize,
    logouts: AtomicUsize,
    op_delay_ms: AtomicU64,
    disconnect_delay_ms: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> BackendResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| BackendError::Internal("Lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> BackendResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| BackendError::Internal("Lock poisoned".to_string()))
}

impl MockPool {
    /// Create an empty mock pool.
    pub fn new() -> Self {
        info!("Creating mock pool backend");
        Self::default()
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Add a host. Returns its UUID.
    pub fn add_host(&self, name_label: &str) -> String {
        let uuid = Uuid::new_v4().to_string();
        let record = HostRecord {
            uuid: uuid.clone(),
            name_label: name_label.to_string(),
            name_description: String::new(),
            hostname: name_label.to_string(),
            address: format!("192.0.2.{}", self.host_count() + 10),
            enabled: true,
        };
        self.inner
            .hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid.clone(), record);
        uuid
    }

    /// Add a VM in the given power state. Returns its UUID.
    pub fn add_vm(&self, name_label: &str, power_state: VmPowerState) -> String {
        let uuid = Uuid::new_v4().to_string();
        let resident_on = match power_state {
            VmPowerState::Running | VmPowerState::Paused => self.first_host(),
            _ => None,
        };
        let record = VmRecord {
            uuid: uuid.clone(),
            name_label: name_label.to_string(),
            name_description: String::new(),
            power_state,
            resident_on,
            vcpus: 2,
            memory_bytes: 2 * 1024 * 1024 * 1024,
        };
        self.inner
            .vms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid.clone(), record);
        uuid
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Make every record fetch for `uuid` fail.
    pub fn fail_record(&self, uuid: &str) {
        self.inner
            .failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner
            .failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn set_fail_login(&self, fail: bool) {
        self.inner.fail_login.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.inner.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to power operations and migrations.
    pub fn set_op_delay(&self, delay: Duration) {
        self.inner
            .op_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay before a disconnect takes effect.
    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.inner
            .disconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn logins(&self) -> usize {
        self.inner.logins.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.inner.logouts.load(Ordering::SeqCst)
    }

    /// Sessions logged in and not yet logged out.
    pub fn live_sessions(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn task(&self, uuid: &str) -> Option<TaskRecord> {
        self.inner
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
    }

    pub fn task_count(&self) -> usize {
        self.inner
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn vm(&self, uuid: &str) -> Option<VmRecord> {
        self.inner
            .vms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
    }

    fn host_count(&self) -> usize {
        self.inner
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn first_host(&self) -> Option<String> {
        self.inner
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .min()
            .cloned()
    }
}

#[async_trait]
impl PoolBackend for MockPool {
    async fn connect(&self) -> BackendResult<()> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(true, Ordering::SeqCst);
        info!("Mock pool connected");
        Ok(())
    }

    async fn disconnect(&self) -> BackendResult<()> {
        let ms = self.inner.disconnect_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.inner.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BackendError::OperationFailed(
                "disconnect refused".to_string(),
            ));
        }
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        info!("Mock pool disconnected");
        Ok(())
    }

    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    async fn login(&self, credentials: &Credentials) -> BackendResult<Arc<dyn PoolSession>> {
        if self.inner.fail_login.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionFailed(
                "login refused by pool".to_string(),
            ));
        }
        if credentials.username.is_empty() {
            return Err(BackendError::ConnectionFailed(
                "authentication failed".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        write(&self.inner.sessions)?.insert(id.clone());
        self.inner.logins.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %id, "Mock session opened");

        Ok(Arc::new(MockSession {
            id,
            pool: Arc::clone(&self.inner),
        }))
    }

    fn logout(&self, session: &dyn PoolSession) {
        let removed = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session.id());
        if removed {
            self.inner.logouts.fetch_add(1, Ordering::SeqCst);
            debug!(session_id = %session.id(), "Mock session closed");
        } else {
            warn!(session_id = %session.id(), "Logout of unknown session");
        }
    }
}

/// A session handed out by [`MockPool::login`].
struct MockSession {
    id: String,
    pool: Arc<PoolState>,
}

impl MockSession {
    fn check(&self) -> BackendResult<()> {
        if read(&self.pool.sessions)?.contains(&self.id) {
            Ok(())
        } else {
            Err(BackendError::SessionInvalid(self.id.clone()))
        }
    }

    fn check_record(&self, uuid: &str) -> BackendResult<()> {
        self.check()?;
        if read(&self.pool.failing)?.contains(uuid) {
            return Err(BackendError::OperationFailed(format!(
                "record {} unavailable",
                uuid
            )));
        }
        Ok(())
    }

    async fn delay(&self) {
        let ms = self.pool.op_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl PoolSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self))]
    async fn task_create(&self, name_label: &str, name_description: &str) -> BackendResult<String> {
        self.check()?;
        let uuid = Uuid::new_v4().to_string();
        let record = TaskRecord {
            uuid: uuid.clone(),
            name_label: name_label.to_string(),
            name_description: name_description.to_string(),
            created: Utc::now(),
            other_config: HashMap::new(),
        };
        write(&self.pool.tasks)?.insert(uuid.clone(), record);
        debug!(task = %uuid, "Mock task created");
        Ok(uuid)
    }

    async fn task_get_all(&self) -> BackendResult<Vec<String>> {
        self.check()?;
        let mut all: Vec<String> = read(&self.pool.tasks)?.keys().cloned().collect();
        all.sort();
        Ok(all)
    }

    async fn task_get_record(&self, task: &str) -> BackendResult<TaskRecord> {
        self.check_record(task)?;
        read(&self.pool.tasks)?
            .get(task)
            .cloned()
            .ok_or_else(|| BackendError::HandleInvalid(task.to_string()))
    }

    async fn task_set_other_config(
        &self,
        task: &str,
        key: &str,
        value: Option<&str>,
    ) -> BackendResult<()> {
        self.check()?;
        let mut tasks = write(&self.pool.tasks)?;
        let record = tasks
            .get_mut(task)
            .ok_or_else(|| BackendError::HandleInvalid(task.to_string()))?;
        match value {
            Some(v) => {
                record.other_config.insert(key.to_string(), v.to_string());
            }
            None => {
                record.other_config.remove(key);
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn task_destroy(&self, task: &str) -> BackendResult<()> {
        self.check()?;
        write(&self.pool.tasks)?
            .remove(task)
            .map(|_| ())
            .ok_or_else(|| BackendError::HandleInvalid(task.to_string()))
    }

    async fn vm_get_all(&self) -> BackendResult<Vec<String>> {
        self.check()?;
        let mut all: Vec<String> = read(&self.pool.vms)?.keys().cloned().collect();
        all.sort();
        Ok(all)
    }

    async fn vm_get_record(&self, vm: &str) -> BackendResult<VmRecord> {
        self.check_record(vm)?;
        read(&self.pool.vms)?
            .get(vm)
            .cloned()
            .ok_or_else(|| BackendError::HandleInvalid(vm.to_string()))
    }

    async fn vm_set_name_label(&self, vm: &str, label: &str) -> BackendResult<()> {
        self.check()?;
        let mut vms = write(&self.pool.vms)?;
        let record = vms
            .get_mut(vm)
            .ok_or_else(|| BackendError::HandleInvalid(vm.to_string()))?;
        record.name_label = label.to_string();
        Ok(())
    }

    async fn vm_set_name_description(&self, vm: &str, description: &str) -> BackendResult<()> {
        self.check()?;
        let mut vms = write(&self.pool.vms)?;
        let record = vms
            .get_mut(vm)
            .ok_or_else(|| BackendError::HandleInvalid(vm.to_string()))?;
        record.name_description = description.to_string();
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm, op = ?op))]
    async fn vm_power_op(&self, vm: &str, op: VmPowerOp) -> BackendResult<()> {
        self.check()?;
        self.delay().await;

        let host = read(&self.pool.hosts)?.keys().min().cloned();
        let mut vms = write(&self.pool.vms)?;
        let record = vms
            .get_mut(vm)
            .ok_or_else(|| BackendError::HandleInvalid(vm.to_string()))?;

        use VmPowerState::*;
        let next = match (op, record.power_state) {
            (VmPowerOp::Start, Halted) => Running,
            (VmPowerOp::CleanShutdown | VmPowerOp::HardShutdown, Running | Paused) => Halted,
            (VmPowerOp::CleanReboot | VmPowerOp::HardReboot, Running) => Running,
            (VmPowerOp::Pause, Running) => Paused,
            (VmPowerOp::Unpause, Paused) => Running,
            (VmPowerOp::Suspend, Running) => Suspended,
            (VmPowerOp::Resume, Suspended) => Running,
            (op, state) => {
                return Err(BackendError::OperationFailed(format!(
                    "VM_BAD_POWER_STATE: cannot {:?} a {:?} VM",
                    op, state
                )))
            }
        };

        record.power_state = next;
        record.resident_on = match next {
            Halted | Suspended => None,
            _ => record.resident_on.clone().or(host),
        };
        info!(state = ?next, "Mock VM power state changed");
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm, host = %host))]
    async fn vm_pool_migrate(&self, vm: &str, host: &str, live: bool) -> BackendResult<()> {
        self.vm_assert_can_migrate(vm, host).await?;
        self.delay().await;

        let mut vms = write(&self.pool.vms)?;
        let record = vms
            .get_mut(vm)
            .ok_or_else(|| BackendError::HandleInvalid(vm.to_string()))?;
        record.resident_on = Some(host.to_string());
        info!(live, "Mock VM migrated");
        Ok(())
    }

    async fn vm_assert_can_migrate(&self, vm: &str, host: &str) -> BackendResult<()> {
        self.check()?;
        let target = read(&self.pool.hosts)?
            .get(host)
            .cloned()
            .ok_or_else(|| BackendError::HandleInvalid(host.to_string()))?;
        let record = read(&self.pool.vms)?
            .get(vm)
            .cloned()
            .ok_or_else(|| BackendError::HandleInvalid(vm.to_string()))?;

        if !target.enabled {
            return Err(BackendError::OperationFailed("HOST_DISABLED".to_string()));
        }
        if record.power_state != VmPowerState::Running {
            return Err(BackendError::OperationFailed(
                "VM_BAD_POWER_STATE".to_string(),
            ));
        }
        if record.resident_on.as_deref() == Some(host) {
            return Err(BackendError::OperationFailed(
                "VM_ALREADY_RESIDENT_ON_HOST".to_string(),
            ));
        }
        Ok(())
    }

    async fn host_get_all(&self) -> BackendResult<Vec<String>> {
        self.check()?;
        let mut all: Vec<String> = read(&self.pool.hosts)?.keys().cloned().collect();
        all.sort();
        Ok(all)
    }

    async fn host_get_record(&self, host: &str) -> BackendResult<HostRecord> {
        self.check_record(host)?;
        read(&self.pool.hosts)?
            .get(host)
            .cloned()
            .ok_or_else(|| BackendError::HandleInvalid(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("root", "secret")
    }

    #[tokio::test]
    async fn test_login_logout_balance() {
        let pool = MockPool::new();
        let session = pool.login(&creds()).await.unwrap();
        assert_eq!(pool.live_sessions(), 1);

        pool.logout(session.as_ref());
        assert_eq!(pool.logins(), 1);
        assert_eq!(pool.logouts(), 1);
        assert_eq!(pool.live_sessions(), 0);

        // Calls on a logged-out session are rejected
        let err = session.vm_get_all().await.unwrap_err();
        assert!(matches!(err, BackendError::SessionInvalid(_)));
    }

    #[tokio::test]
    async fn test_login_failure_injection() {
        let pool = MockPool::new();
        pool.set_fail_login(true);
        assert!(pool.login(&creds()).await.is_err());
        assert_eq!(pool.logins(), 0);

        let empty = Credentials::new("", "");
        pool.set_fail_login(false);
        assert!(pool.login(&empty).await.is_err());
    }

    #[tokio::test]
    async fn test_vm_lifecycle() {
        let pool = MockPool::new();
        pool.add_host("host-a");
        let vm = pool.add_vm("web", VmPowerState::Halted);
        let session = pool.login(&creds()).await.unwrap();

        // Start
        session.vm_power_op(&vm, VmPowerOp::Start).await.unwrap();
        let record = session.vm_get_record(&vm).await.unwrap();
        assert_eq!(record.power_state, VmPowerState::Running);
        assert!(record.resident_on.is_some());

        // Pause
        session.vm_power_op(&vm, VmPowerOp::Pause).await.unwrap();
        assert_eq!(pool.vm(&vm).unwrap().power_state, VmPowerState::Paused);

        // Pausing twice is rejected
        assert!(session.vm_power_op(&vm, VmPowerOp::Pause).await.is_err());

        // Shut down
        session.vm_power_op(&vm, VmPowerOp::HardShutdown).await.unwrap();
        let record = pool.vm(&vm).unwrap();
        assert_eq!(record.power_state, VmPowerState::Halted);
        assert!(record.resident_on.is_none());

        pool.logout(session.as_ref());
    }

    #[tokio::test]
    async fn test_task_other_config() {
        let pool = MockPool::new();
        let session = pool.login(&creds()).await.unwrap();

        let task = session.task_create("Xen_Job", "vm-1").await.unwrap();
        session.task_set_other_config(&task, "CIMJobState", Some("2")).await.unwrap();
        session.task_set_other_config(&task, "Description", Some("x")).await.unwrap();
        session.task_set_other_config(&task, "Description", None).await.unwrap();

        let record = session.task_get_record(&task).await.unwrap();
        assert_eq!(record.other_config.get("CIMJobState").map(String::as_str), Some("2"));
        assert!(!record.other_config.contains_key("Description"));

        session.task_destroy(&task).await.unwrap();
        let err = session.task_get_record(&task).await.unwrap_err();
        assert!(matches!(err, BackendError::HandleInvalid(_)));

        pool.logout(session.as_ref());
    }

    #[tokio::test]
    async fn test_record_failure_injection() {
        let pool = MockPool::new();
        let host = pool.add_host("host-a");
        pool.fail_record(&host);
        let session = pool.login(&creds()).await.unwrap();

        assert!(matches!(
            session.host_get_record(&host).await,
            Err(BackendError::OperationFailed(_))
        ));
        pool.clear_failures();
        assert!(session.host_get_record(&host).await.is_ok());

        pool.logout(session.as_ref());
    }

    #[tokio::test]
    async fn test_migration_checks() {
        let pool = MockPool::new();
        let a = pool.add_host("host-a");
        let b = pool.add_host("host-b");
        let vm = pool.add_vm("db", VmPowerState::Running);
        let resident = pool.vm(&vm).unwrap().resident_on.unwrap();
        let other = if resident == a { b } else { a };
        let session = pool.login(&creds()).await.unwrap();

        assert!(session.vm_assert_can_migrate(&vm, &resident).await.is_err());
        session.vm_pool_migrate(&vm, &other, true).await.unwrap();
        assert_eq!(pool.vm(&vm).unwrap().resident_on, Some(other));

        pool.logout(session.as_ref());
    }
}
