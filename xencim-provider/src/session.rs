//! Session acquisition with scoped release.
//!
//! Every dispatch operation and every job works on its own [`SessionLease`].
//! Dropping the lease logs the session out, so each exit path releases the
//! session exactly once without explicit cleanup calls.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::backend::{PoolBackend, PoolSession};
use crate::error::{ProviderError, Result};
use crate::types::Credentials;

/// Opens sessions against the shared backend while the provider is loaded.
#[derive(Clone)]
pub struct SessionManager {
    backend: Arc<dyn PoolBackend>,
    loaded: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn PoolBackend>, loaded: Arc<AtomicBool>) -> Self {
        Self { backend, loaded }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Validate the caller and open a session.
    ///
    /// Refused with `NotInitialized` while the provider is unloaded.
    pub async fn acquire(&self, credentials: &Credentials) -> Result<SessionLease> {
        if !self.is_loaded() {
            return Err(ProviderError::NotInitialized);
        }

        let session = self.backend.login(credentials).await.map_err(|e| {
            error!(error = %e, "Unable to establish connection with pool");
            ProviderError::from(e)
        })?;
        debug!(session_id = %session.id(), "Session acquired");

        Ok(SessionLease {
            backend: Arc::clone(&self.backend),
            session,
        })
    }
}

/// An owned session, logged out when dropped.
pub struct SessionLease {
    backend: Arc<dyn PoolBackend>,
    session: Arc<dyn PoolSession>,
}

impl SessionLease {
    pub fn session(&self) -> &dyn PoolSession {
        self.session.as_ref()
    }

    /// Shared handle for contexts that borrow this lease's session.
    pub(crate) fn shared(&self) -> Arc<dyn PoolSession> {
        Arc::clone(&self.session)
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session.id())
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        debug!(session_id = %self.session.id(), "Session released");
        self.backend.logout(self.session.as_ref());
    }
}
