//! # Job Engine
//!
//! Runs long-lived pool operations off the requesting call while keeping
//! their progress observable as an ordinary managed object.
//!
//! ```text
//!  invoke_method ──▶ JobEngine::create ──▶ task_create (caller session)
//!                          │                   PercentComplete=0, CIMJobState=2
//!                          │
//!                          ├──▶ acquire dedicated SessionLease
//!                          ├──▶ tokio::spawn(run_job) ──▶ work_fn(JobContext)
//!                          │                                   │ change_state / set_output
//!                          ▼                                   ▼
//!                   job reference                       task other_config
//!              (returned immediately)             (polled through dispatch)
//! ```
//!
//! A job moves `New -> Running -> {Completed | Exception}`. Once terminal it
//! is read-only: later state changes are ignored. If the work function
//! returns, fails or panics without reaching a terminal state, the engine
//! drives it to one.

use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, instrument, warn, Instrument};

use crate::backend::PoolSession;
use crate::config::JobsConfig;
use crate::error::{status, BackendResult, ProviderError, Result};
use crate::instance_id;
use crate::session::{SessionLease, SessionManager};
use crate::types::{Credentials, JobState, ObjectPath};

/// Keys of the backend task's `other_config` that persist a job.
pub mod keys {
    pub const CIM_JOB_STATE: &str = "CIMJobState";
    pub const PERCENT_COMPLETE: &str = "PercentComplete";
    pub const ERROR_CODE: &str = "ErrorCode";
    pub const DESCRIPTION: &str = "Description";
    pub const ERROR_DESCRIPTION: &str = "ErrorDescription";
}

/// Snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobStatus {
    pub state: JobState,
    pub percent_complete: u16,
    pub error_code: u32,
    pub description: Option<String>,
    pub error_description: Option<String>,
}

/// A job record. The owning worker writes it; anyone may read it.
#[derive(Debug)]
pub struct Job {
    id: String,
    type_name: String,
    target_id: String,
    reference: ObjectPath,
    status: RwLock<JobStatus>,
    outputs: RwLock<BTreeMap<String, String>>,
}

impl Job {
    fn new(id: String, type_name: &str, target_id: &str, namespace: &str) -> Self {
        let reference = ObjectPath::new(namespace, type_name)
            .with_key("InstanceID", instance_id::format(&id));
        Self {
            id,
            type_name: type_name.to_string(),
            target_id: target_id.to_string(),
            reference,
            status: RwLock::new(JobStatus::default()),
            outputs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Backend task UUID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Object path callers poll.
    pub fn reference(&self) -> &ObjectPath {
        &self.reference
    }

    pub fn status(&self) -> JobStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> JobState {
        self.status().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn outputs(&self) -> BTreeMap<String, String> {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The status a transition would produce, or `None` if the job cannot
    /// move to `state` (it is terminal, or `state` is behind the current one).
    fn next_status(
        &self,
        state: JobState,
        percent_complete: u16,
        error_code: u32,
        description: Option<&str>,
    ) -> Option<JobStatus> {
        let mut status = self.status();
        if !status.state.can_advance_to(state) {
            return None;
        }
        status.state = state;
        status.percent_complete = percent_complete.min(100);
        status.error_code = error_code;
        if let Some(text) = description {
            if error_code != 0 {
                status.error_description = Some(text.to_string());
                status.description = None;
            } else {
                status.description = Some(text.to_string());
                status.error_description = None;
            }
        }
        Some(status)
    }

    /// Publish a status. Returns false if the job finished in the meantime.
    fn commit(&self, next: JobStatus) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if !status.state.can_advance_to(next.state) {
            return false;
        }
        *status = next;
        true
    }
}

/// Write a job transition into the backing task.
async fn persist_state(
    session: &dyn PoolSession,
    task: &str,
    status: &JobStatus,
    description_given: bool,
) -> BackendResult<()> {
    let percent = status.percent_complete.to_string();
    let state = status.state.as_u16().to_string();
    let code = status.error_code.to_string();

    session
        .task_set_other_config(task, keys::PERCENT_COMPLETE, Some(&percent))
        .await?;
    session
        .task_set_other_config(task, keys::CIM_JOB_STATE, Some(&state))
        .await?;
    session
        .task_set_other_config(task, keys::ERROR_CODE, Some(&code))
        .await?;

    if description_given {
        session
            .task_set_other_config(task, keys::DESCRIPTION, status.description.as_deref())
            .await?;
        session
            .task_set_other_config(
                task,
                keys::ERROR_DESCRIPTION,
                status.error_description.as_deref(),
            )
            .await?;
    }
    Ok(())
}

/// Persist a transition, then publish it. A transition the backend did not
/// record is never visible in memory.
async fn change_state(
    job: &Job,
    session: &dyn PoolSession,
    state: JobState,
    percent_complete: u16,
    error_code: u32,
    description: Option<&str>,
) -> Result<()> {
    let Some(next) = job.next_status(state, percent_complete, error_code, description) else {
        warn!(
            job_id = %job.id,
            requested = ?state,
            current = ?job.state(),
            "Ignoring state change"
        );
        return Ok(());
    };

    persist_state(session, &job.id, &next, description.is_some())
        .await
        .map_err(|e| ProviderError::from(e).within("job_change_state", &job.type_name))?;

    if job.commit(next) {
        info!(job_id = %job.id, state = ?state, percent_complete, error_code, "Job state changed");
    } else {
        warn!(
            job_id = %job.id,
            requested = ?state,
            current = ?job.state(),
            "Job finished during state change"
        );
    }
    Ok(())
}

/// The worker's handle on its job: state changes, outputs and the job's own session.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    session: Arc<dyn PoolSession>,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn target_id(&self) -> &str {
        &self.job.target_id
    }

    /// The dedicated session owned by this job.
    pub fn session(&self) -> &dyn PoolSession {
        self.session.as_ref()
    }

    /// The single mutation point for job progress.
    ///
    /// With a description, a non-zero `error_code` records it as the error
    /// description and clears the description; zero does the reverse.
    /// Ignored once the job is terminal or if `state` is behind the current
    /// one. Nothing changes in memory unless the backing task was updated.
    pub async fn change_state(
        &self,
        state: JobState,
        percent_complete: u16,
        error_code: u32,
        description: Option<&str>,
    ) -> Result<()> {
        change_state(
            &self.job,
            self.session.as_ref(),
            state,
            percent_complete,
            error_code,
            description,
        )
        .await
    }

    /// Record an operation output (`ResultingSystem`, `AffectedResources`, ...).
    pub async fn set_output(&self, key: &str, value: &str) -> Result<()> {
        if self.job.is_terminal() {
            warn!(job_id = %self.job.id, key, "Ignoring output on finished job");
            return Ok(());
        }
        self.job
            .outputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        self.session
            .task_set_other_config(&self.job.id, key, Some(value))
            .await
            .map_err(|e| ProviderError::from(e).within("job_set_output", &self.job.type_name))
    }
}

struct EngineState {
    sessions: SessionManager,
    namespace: String,
    limiter: Option<Arc<Semaphore>>,
    keep_finished: bool,
    // Read by create, written by shutdown, so no job starts while teardown runs
    admission: tokio::sync::RwLock<()>,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    running: AtomicUsize,
    idle: Notify,
}

/// Decrements the running count when a worker exits, however it exits.
struct RunningGuard(Arc<EngineState>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Creates jobs and tracks the ones still running.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineState>,
}

impl JobEngine {
    pub fn new(sessions: SessionManager, namespace: impl Into<String>, config: &JobsConfig) -> Self {
        Self {
            inner: Arc::new(EngineState {
                sessions,
                namespace: namespace.into(),
                limiter: config.max_concurrent.map(|n| Arc::new(Semaphore::new(n))),
                keep_finished: config.keep_finished,
                admission: tokio::sync::RwLock::new(()),
                jobs: RwLock::new(HashMap::new()),
                running: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Create a job and start `work` on its own task.
    ///
    /// The backing task is created through the caller's session in state
    /// `New`. The work function runs with a dedicated session owned by the
    /// job. Returns as soon as the job is spawned.
    ///
    /// Refused with `NotInitialized` once the provider has unloaded.
    #[instrument(skip(self, caller, credentials, work), fields(job_type = %type_name, target = %target_id))]
    pub async fn create<F, Fut>(
        &self,
        caller: &dyn PoolSession,
        credentials: &Credentials,
        type_name: &str,
        target_id: &str,
        work: F,
    ) -> Result<Arc<Job>>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let _admission = self.inner.admission.read().await;
        if !self.inner.sessions.is_loaded() {
            return Err(ProviderError::NotInitialized);
        }

        let task = caller
            .task_create(type_name, target_id)
            .await
            .map_err(|e| ProviderError::from(e).within("job_create", type_name))?;

        if let Err(e) = persist_state(caller, &task, &JobStatus::default(), false).await {
            error!(error = %e, task = %task, "Failed to initialise job record");
            discard_task(caller, &task).await;
            return Err(ProviderError::failed("job_create", type_name, e.to_string()));
        }

        let lease = match self.inner.sessions.acquire(credentials).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(error = %e, task = %task, "Failed to open job session");
                discard_task(caller, &task).await;
                return Err(ProviderError::failed("job_create", type_name, e.to_string()));
            }
        };

        let job = Arc::new(Job::new(task, type_name, target_id, &self.inner.namespace));
        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), Arc::clone(&job));

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(Arc::clone(&self.inner));
        let span = tracing::info_span!("job", job_id = %job.id, job_type = %type_name);
        tokio::spawn(run_job(Arc::clone(&job), lease, guard, work).instrument(span));

        info!(job_id = %job.id, "Job created");
        Ok(job)
    }

    /// Whether any job worker has not yet exited.
    pub fn jobs_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) > 0
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Look up a job by its task UUID.
    pub fn job(&self, id: &str) -> Option<Arc<Job>> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Jobs that have not reached a terminal state.
    pub fn active_jobs(&self) -> Vec<Arc<Job>> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect()
    }

    /// Block job creation until the returned guard is dropped.
    ///
    /// Jobs already counted by [`JobEngine::jobs_running`] are unaffected.
    pub(crate) async fn close_admission(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.inner.admission.write().await
    }

    /// Stop tracking a job whose backing task was reaped.
    pub fn forget(&self, id: &str) -> Option<Arc<Job>> {
        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Finish a job in `Exception` and stop tracking it.
    ///
    /// The worker keeps running until its next state change, which is then
    /// ignored. Returns false if the job was not tracked.
    pub fn kill(&self, id: &str) -> bool {
        let Some(job) = self.forget(id) else {
            return false;
        };
        let killed = JobStatus {
            state: JobState::Exception,
            percent_complete: 100,
            error_code: status::FAILED,
            description: None,
            error_description: Some("job killed".to_string()),
        };
        if job.commit(killed) {
            info!(job_id = %id, "Job killed");
        }
        true
    }

    /// Forget finished jobs. Their backend tasks are left untouched.
    pub fn prune_finished(&self) -> usize {
        let mut jobs = self.inner.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_terminal());
        before - jobs.len()
    }

    /// Wait until every job worker has exited.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.jobs_running() {
                return;
            }
            notified.await;
        }
    }
}

async fn discard_task(session: &dyn PoolSession, task: &str) {
    if let Err(e) = session.task_destroy(task).await {
        warn!(error = %e, task = %task, "Failed to destroy orphaned task");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}

async fn run_job<F, Fut>(job: Arc<Job>, lease: SessionLease, guard: RunningGuard, work: F)
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let engine = Arc::clone(&guard.0);

    // Wait in New for a slot
    let _permit = match &engine.limiter {
        Some(limiter) => Arc::clone(limiter).acquire_owned().await.ok(),
        None => None,
    };

    let ctx = JobContext {
        job: Arc::clone(&job),
        session: lease.shared(),
    };
    let outcome = AssertUnwindSafe(async move { work(ctx).await })
        .catch_unwind()
        .await;

    let (state, error_code, description) = match outcome {
        Ok(Ok(())) => (JobState::Completed, 0, None),
        Ok(Err(e)) => (JobState::Exception, e.status_code(), Some(e.to_string())),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(job_id = %job.id, %message, "Job work function panicked");
            (JobState::Exception, status::FAILED, Some(message))
        }
    };

    if !job.is_terminal() {
        if let Err(e) = change_state(
            &job,
            lease.session(),
            state,
            100,
            error_code,
            description.as_deref(),
        )
        .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to persist final job state");
            job.commit(JobStatus {
                state: JobState::Exception,
                percent_complete: 100,
                error_code: e.status_code(),
                description: None,
                error_description: Some(e.to_string()),
            });
        }
    }

    info!(job_id = %job.id, state = ?job.state(), "Job finished");

    if !engine.keep_finished {
        let tracked = engine
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job.id)
            .is_some();
        if tracked {
            discard_task(lease.session(), &job.id).await;
        }
    }

    drop(lease);
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PoolBackend;
    use crate::mock::MockPool;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn creds() -> Credentials {
        Credentials::new("root", "secret")
    }

    fn engine(pool: &MockPool, config: JobsConfig) -> JobEngine {
        engine_with_flag(pool, config, Arc::new(AtomicBool::new(true)))
    }

    fn engine_with_flag(pool: &MockPool, config: JobsConfig, loaded: Arc<AtomicBool>) -> JobEngine {
        let sessions = SessionManager::new(Arc::new(pool.clone()), loaded);
        JobEngine::new(sessions, "root/cimv2", &config)
    }

    #[tokio::test]
    async fn test_create_returns_before_work_finishes() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |ctx| async move {
                ctx.change_state(JobState::Running, 0, 0, None).await?;
                let _ = rx.await;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(job.state(), JobState::New | JobState::Running));
        assert!(jobs.jobs_running());

        let record = pool.task(job.id()).unwrap();
        assert_eq!(record.name_label, "Xen_SystemStateChangeJob");
        assert_eq!(record.name_description, "vm-1");

        tx.send(()).unwrap();
        jobs.wait_idle().await;

        let status = job.status();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.percent_complete, 100);
        let record = pool.task(job.id()).unwrap();
        assert_eq!(record.other_config.get(keys::CIM_JOB_STATE).map(String::as_str), Some("7"));

        pool.logout(caller.as_ref());
        assert_eq!(pool.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failed_work_ends_in_exception() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |_ctx| async move {
                Err::<(), _>(ProviderError::failed(
                    "power_op",
                    "Xen_ComputerSystem",
                    "VM_BAD_POWER_STATE",
                ))
            })
            .await
            .unwrap();
        jobs.wait_idle().await;

        let status = job.status();
        assert_eq!(status.state, JobState::Exception);
        assert_ne!(status.error_code, 0);
        assert!(status.error_description.unwrap().contains("VM_BAD_POWER_STATE"));
        assert!(status.description.is_none());

        let record = pool.task(job.id()).unwrap();
        assert_eq!(record.other_config.get(keys::CIM_JOB_STATE).map(String::as_str), Some("10"));
        assert!(record.other_config.contains_key(keys::ERROR_DESCRIPTION));
        assert!(!record.other_config.contains_key(keys::DESCRIPTION));

        pool.logout(caller.as_ref());
    }

    #[tokio::test]
    async fn test_panicking_work_ends_in_exception() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |ctx| async move {
                if ctx.target_id() == "vm-1" {
                    panic!("backend vanished");
                }
                Ok(())
            })
            .await
            .unwrap();
        jobs.wait_idle().await;

        assert_eq!(job.state(), JobState::Exception);
        assert!(job.status().error_description.unwrap().contains("backend vanished"));
        assert!(!jobs.jobs_running());

        pool.logout(caller.as_ref());
        assert_eq!(pool.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |ctx| async move {
                ctx.change_state(JobState::Running, 0, 0, None).await?;
                ctx.change_state(JobState::Completed, 100, 0, Some("done")).await?;
                // Buggy work function keeps writing after finishing
                ctx.change_state(JobState::Running, 50, 0, None).await?;
                ctx.change_state(JobState::Exception, 100, 4, Some("late")).await?;
                ctx.set_output("ResultingSystem", "late").await?;
                Ok(())
            })
            .await
            .unwrap();
        jobs.wait_idle().await;

        let status = job.status();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.description.as_deref(), Some("done"));
        assert!(job.outputs().is_empty());

        pool.logout(caller.as_ref());
    }

    #[tokio::test]
    async fn test_max_concurrent_holds_jobs_in_new() {
        let pool = MockPool::new();
        let config = JobsConfig {
            max_concurrent: Some(1),
            keep_finished: true,
        };
        let jobs = engine(&pool, config);
        let caller = pool.login(&creds()).await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let first = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |ctx| async move {
                ctx.change_state(JobState::Running, 0, 0, None).await?;
                let _ = rx.await;
                Ok(())
            })
            .await
            .unwrap();
        let second = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-2", |ctx| async move {
                ctx.change_state(JobState::Running, 0, 0, None).await?;
                Ok(())
            })
            .await
            .unwrap();

        // Give the first worker a chance to take the slot
        while first.state() != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(second.state(), JobState::New);
        assert_eq!(jobs.active_jobs().len(), 2);

        tx.send(()).unwrap();
        jobs.wait_idle().await;
        assert_eq!(first.state(), JobState::Completed);
        assert_eq!(second.state(), JobState::Completed);
        assert_eq!(jobs.prune_finished(), 2);

        pool.logout(caller.as_ref());
    }

    #[tokio::test]
    async fn test_job_session_failure_discards_task() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();
        pool.set_fail_login(true);

        let result = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |_ctx| async move {
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Failed { .. })));
        assert_eq!(pool.task_count(), 0);
        assert!(!jobs.jobs_running());

        pool.logout(caller.as_ref());
    }

    #[tokio::test]
    async fn test_unkept_jobs_are_reaped() {
        let pool = MockPool::new();
        let config = JobsConfig {
            max_concurrent: None,
            keep_finished: false,
        };
        let jobs = engine(&pool, config);
        let caller = pool.login(&creds()).await.unwrap();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |_ctx| async move {
                Ok(())
            })
            .await
            .unwrap();
        jobs.wait_idle().await;

        assert_eq!(job.state(), JobState::Completed);
        assert!(pool.task(job.id()).is_none());
        assert!(jobs.job(job.id()).is_none());

        pool.logout(caller.as_ref());
    }

    #[tokio::test]
    async fn test_unrecorded_transition_is_not_published() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |ctx| async move {
                ctx.change_state(JobState::Running, 10, 0, None).await?;
                let _ = rx.await;
                ctx.change_state(JobState::Completed, 100, 0, Some("done")).await
            })
            .await
            .unwrap();

        while job.state() != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The task disappears underneath the worker
        caller.task_destroy(job.id()).await.unwrap();
        tx.send(()).unwrap();
        jobs.wait_idle().await;

        let status = job.status();
        assert_eq!(status.state, JobState::Exception);
        assert_ne!(status.error_code, 0);
        assert!(status.description.is_none());
        assert!(status.error_description.is_some());

        pool.logout(caller.as_ref());
        assert_eq!(pool.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_kill_finishes_job_in_exception() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |ctx| async move {
                ctx.change_state(JobState::Running, 0, 0, None).await?;
                let _ = rx.await;
                ctx.change_state(JobState::Completed, 100, 0, Some("done")).await
            })
            .await
            .unwrap();

        assert!(jobs.kill(job.id()));
        assert!(!jobs.kill(job.id()));
        assert!(jobs.job(job.id()).is_none());
        let _ = tx.send(());
        jobs.wait_idle().await;

        let status = job.status();
        assert_eq!(status.state, JobState::Exception);
        assert_eq!(status.error_description.as_deref(), Some("job killed"));

        pool.logout(caller.as_ref());
    }

    #[tokio::test]
    async fn test_state_never_moves_backwards() {
        let pool = MockPool::new();
        let jobs = engine(&pool, JobsConfig::default());
        let caller = pool.login(&creds()).await.unwrap();
        let (tx, rx) = oneshot::channel::<JobStatus>();

        let job = jobs
            .create(caller.as_ref(), &creds(), "Xen_SystemStateChangeJob", "vm-1", |ctx| async move {
                ctx.change_state(JobState::Running, 40, 0, Some("working")).await?;
                ctx.change_state(JobState::New, 0, 0, None).await?;
                let _ = tx.send(ctx.job().status());
                Ok(())
            })
            .await
            .unwrap();

        let seen = rx.await.unwrap();
        assert_eq!(seen.state, JobState::Running);
        assert_eq!(seen.percent_complete, 40);
        jobs.wait_idle().await;
        assert_eq!(job.state(), JobState::Completed);

        pool.logout(caller.as_ref());
    }

    #[tokio::test]
    async fn test_create_waits_while_admission_closed() {
        let pool = MockPool::new();
        let loaded = Arc::new(AtomicBool::new(true));
        let jobs = engine_with_flag(&pool, JobsConfig::default(), Arc::clone(&loaded));
        let caller = pool.login(&creds()).await.unwrap();

        let credentials = creds();

        let gate = jobs.close_admission().await;
        let pending = jobs.create(
            caller.as_ref(),
            &credentials,
            "Xen_SystemStateChangeJob",
            "vm-1",
            |_ctx| async move { Ok(()) },
        );
        tokio::pin!(pending);
        let early = tokio::time::timeout(Duration::from_millis(20), &mut pending).await;
        assert!(early.is_err(), "create must wait for the gate");

        // Teardown finishes while the request waits
        loaded.store(false, Ordering::SeqCst);
        drop(gate);

        let result = pending.await;
        assert!(matches!(result, Err(ProviderError::NotInitialized)));
        assert_eq!(pool.task_count(), 0);
        assert!(!jobs.jobs_running());

        pool.logout(caller.as_ref());
    }
}
