//! Session lifecycle: one browser session per run, tracked in an explicit
//! registry shared by all concurrent runs.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{BrowserDriver, SessionFactory};
use crate::error::SessionError;

/// Live sessions keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<dyn BrowserDriver>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: impl Into<String>, driver: Arc<dyn BrowserDriver>) {
        let id = id.into();
        let mut sessions = self.sessions.write().await;
        if sessions.insert(id.clone(), driver).is_some() {
            warn!(session_id = %id, "replaced an already registered session");
        }
        debug!(session_id = %id, live = sessions.len(), "session registered");
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn BrowserDriver>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn unregister(&self, id: &str) -> Option<Arc<dyn BrowserDriver>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            debug!(session_id = %id, "session unregistered");
        }
        removed
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// A session handed to one run.
#[derive(Clone)]
pub struct SessionLease {
    pub id: String,
    pub driver: Arc<dyn BrowserDriver>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").field("id", &self.id).finish()
    }
}

/// Opens sessions through a factory and keeps the registry in sync.
#[derive(Clone)]
pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn SessionFactory>, registry: SessionRegistry) -> Self {
        Self { factory, registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn acquire(&self) -> Result<SessionLease, SessionError> {
        let driver: Arc<dyn BrowserDriver> =
            Arc::from(self.factory.open().await.map_err(SessionError::Open)?);
        let id = Uuid::new_v4().to_string();
        self.registry.register(id.clone(), driver.clone()).await;
        info!(session_id = %id, "browser session opened");
        Ok(SessionLease { id, driver })
    }

    /// Unregister and close a session. Close failures are logged, not raised;
    /// the session is gone from the registry either way.
    pub async fn release(&self, lease: SessionLease) -> Result<(), SessionError> {
        let Some(driver) = self.registry.unregister(&lease.id).await else {
            return Err(SessionError::NotFound(lease.id));
        };
        drop(lease.driver);
        if let Err(err) = driver.close().await {
            warn!(session_id = %lease.id, error = %err, "closing browser session failed");
        } else {
            info!(session_id = %lease.id, "browser session closed");
        }
        Ok(())
    }
}
