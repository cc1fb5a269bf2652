//! Provider lifecycle: process-wide init and shutdown gating.
//!
//! [`ProviderContext`] is constructed once per process and owns the shared
//! backend, the handler registry, the job engine and the dispatcher. Its
//! whole mutable state is the "loaded" flag; whether jobs are outstanding is
//! delegated to the [`JobEngine`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::backend::PoolBackend;
use crate::config::ProviderConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ProviderError, Result};
use crate::jobs::JobEngine;
use crate::registry::Registry;
use crate::session::SessionManager;

/// Outcome of [`ProviderContext::uninit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The shared connection is closed; the provider may be unloaded.
    Unloaded,
    /// Teardown was refused; retry later.
    DoNotUnload,
}

/// The single per-process provider instance.
pub struct ProviderContext {
    config: ProviderConfig,
    backend: Arc<dyn PoolBackend>,
    loaded: Arc<AtomicBool>,
    transition: Mutex<()>,
    jobs: JobEngine,
    dispatcher: Dispatcher,
}

impl ProviderContext {
    /// Build a provider with the built-in handlers.
    pub fn new(config: ProviderConfig, backend: Arc<dyn PoolBackend>) -> Self {
        Self::with_registry(config, backend, Registry::with_defaults())
    }

    /// Build a provider with a caller-supplied registry.
    pub fn with_registry(
        config: ProviderConfig,
        backend: Arc<dyn PoolBackend>,
        registry: Registry,
    ) -> Self {
        let loaded = Arc::new(AtomicBool::new(false));
        let sessions = SessionManager::new(Arc::clone(&backend), Arc::clone(&loaded));
        let jobs = JobEngine::new(sessions.clone(), config.namespace.clone(), &config.jobs);
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            sessions,
            jobs.clone(),
            config.namespace.clone(),
        );

        Self {
            config,
            backend,
            loaded,
            transition: Mutex::new(()),
            jobs,
            dispatcher,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn jobs(&self) -> &JobEngine {
        &self.jobs
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Establish the shared backend connection. Idempotent.
    #[instrument(skip(self), fields(pool = %self.config.pool.url))]
    pub async fn init(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        if self.is_loaded() {
            return Ok(());
        }

        self.backend.connect().await.map_err(|e| {
            error!(error = %e, "Failed to connect to pool");
            ProviderError::failed("init", "", e.to_string())
        })?;

        self.loaded.store(true, Ordering::SeqCst);
        info!("Provider initialized");
        Ok(())
    }

    /// Tear down the shared connection unless jobs are still running.
    ///
    /// Job creation is held off from the running-jobs check until the
    /// provider is unloaded or the unload is refused.
    ///
    /// A failed disconnect is `Failed` when the host is terminating and
    /// `DoNotUnload` otherwise.
    #[instrument(skip(self))]
    pub async fn uninit(&self, terminating: bool) -> Result<UnloadOutcome> {
        let _guard = self.transition.lock().await;
        if !self.is_loaded() {
            return Ok(UnloadOutcome::Unloaded);
        }

        let _admission = self.jobs.close_admission().await;
        if self.jobs.jobs_running() {
            warn!(
                running = self.jobs.running_count(),
                "Jobs still running, refusing to unload"
            );
            return Ok(UnloadOutcome::DoNotUnload);
        }

        if let Err(e) = self.backend.disconnect().await {
            error!(error = %e, "Failed to disconnect from pool");
            return if terminating {
                Err(ProviderError::failed("uninit", "", e.to_string()))
            } else {
                Ok(UnloadOutcome::DoNotUnload)
            };
        }

        self.loaded.store(false, Ordering::SeqCst);
        info!("Provider unloaded");
        Ok(UnloadOutcome::Unloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPool;

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let pool = MockPool::new();
        let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool.clone()));

        assert!(!provider.is_loaded());
        provider.init().await.unwrap();
        provider.init().await.unwrap();
        assert!(provider.is_loaded());
        assert_eq!(pool.connects(), 1);
    }

    #[tokio::test]
    async fn test_uninit_closes_connection() {
        let pool = MockPool::new();
        let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool.clone()));
        provider.init().await.unwrap();

        assert_eq!(provider.uninit(false).await.unwrap(), UnloadOutcome::Unloaded);
        assert!(!provider.is_loaded());
        assert!(!pool.is_connected());

        // Unloading twice is harmless
        assert_eq!(provider.uninit(false).await.unwrap(), UnloadOutcome::Unloaded);
        assert_eq!(pool.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_failed_disconnect() {
        let pool = MockPool::new();
        pool.set_fail_disconnect(true);
        let provider = ProviderContext::new(ProviderConfig::default(), Arc::new(pool.clone()));
        provider.init().await.unwrap();

        assert_eq!(provider.uninit(false).await.unwrap(), UnloadOutcome::DoNotUnload);
        assert!(provider.is_loaded());
        assert!(matches!(
            provider.uninit(true).await,
            Err(ProviderError::Failed { .. })
        ));
        assert!(provider.is_loaded());
    }
}
