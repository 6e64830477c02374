use async_trait::async_trait;

use crate::error::DriverError;
use crate::types::{Action, ActionResult, Observation};

/// Low-level browser control channel for one session.
///
/// Implementations must honor these rules:
///
/// - `observe(true)` never hands back a cached snapshot.
/// - `execute` reports ordinary action failures (missing element, navigation
///   timeout) inside the returned [`ActionResult`]. Only session-fatal
///   conditions come back as `Err`.
/// - Every call enforces the action deadline itself and returns only after
///   the browser work it started has stopped. Callers never abandon a call
///   halfway, so no two calls on one session overlap.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn observe(&self, force_fresh: bool) -> Result<Observation, DriverError>;

    async fn execute(&self, action: &Action) -> Result<ActionResult, DriverError>;

    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// In-flight network requests on the active page.
    async fn pending_requests(&self) -> Result<usize, DriverError> {
        Ok(self.observe(true).await?.pending_requests)
    }

    /// Release the underlying browser resources. Called once per session.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Opens new browser sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserDriver>, DriverError>;
}
