//! Host-side collaborators the session talks to.
//!
//! The corridor display, camera line, and the lab's session registry all
//! live outside this process. They are reached through narrow traits so
//! sessions run unchanged on rigs without them and so tests can observe
//! every interaction.

use crate::error::RigResult;
use crate::session::SessionInfo;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// The virtual-corridor stimulus display.
///
/// Calls must return promptly; rendering happens in the display process.
pub trait CorridorView: Send + Sync {
    /// Queue the stimulus to present on the upcoming trial.
    fn select_stimulus(&self, stimulus: &str) -> RigResult<()>;

    /// Feed the latest wheel position, in degrees. Called once per frame
    /// tick, before [`advance`](Self::advance).
    fn set_position(&self, degrees: f64) -> RigResult<()>;

    /// Advance the corridor one frame from the latest wheel movement.
    fn advance(&self) -> RigResult<()>;

    /// Blank the screen to gray for the inter-trial interval.
    fn show_gray(&self) -> RigResult<()>;
}

/// Display stand-in for rigs and tests without a stimulus screen.
/// Counts interactions so tests can assert on them.
#[derive(Debug, Default)]
pub struct NullCorridor {
    advances: AtomicUsize,
    grays: AtomicUsize,
    last_position: Mutex<Option<f64>>,
}

impl NullCorridor {
    pub fn advance_count(&self) -> usize {
        self.advances.load(Ordering::SeqCst)
    }

    pub fn gray_count(&self) -> usize {
        self.grays.load(Ordering::SeqCst)
    }

    pub fn last_position(&self) -> Option<f64> {
        *self.last_position.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CorridorView for NullCorridor {
    fn select_stimulus(&self, stimulus: &str) -> RigResult<()> {
        debug!(stimulus, "no display attached, stimulus selection dropped");
        Ok(())
    }

    fn set_position(&self, degrees: f64) -> RigResult<()> {
        *self.last_position.lock().unwrap_or_else(|p| p.into_inner()) = Some(degrees);
        Ok(())
    }

    fn advance(&self) -> RigResult<()> {
        self.advances.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn show_gray(&self) -> RigResult<()> {
        self.grays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One-shot camera trigger line.
pub trait CameraTrigger: Send + Sync {
    fn trigger(&self) -> RigResult<()>;
}

#[derive(Debug, Default)]
pub struct NullCameraTrigger;

impl CameraTrigger for NullCameraTrigger {
    fn trigger(&self) -> RigResult<()> {
        Ok(())
    }
}

/// The lab's session registry. Registration is best effort: a registry
/// outage must never block data collection, so callers log failures and
/// continue.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn register(&self, info: &SessionInfo) -> RigResult<()>;

    async fn finalize(&self, info: &SessionInfo, trials_completed: usize) -> RigResult<()>;
}

/// Registry stand-in for offline rigs.
#[derive(Debug, Default)]
pub struct NullRegistry;

#[async_trait]
impl SessionRegistry for NullRegistry {
    async fn register(&self, info: &SessionInfo) -> RigResult<()> {
        debug!(subject = %info.subject, "no registry configured, session not registered");
        Ok(())
    }

    async fn finalize(&self, info: &SessionInfo, trials_completed: usize) -> RigResult<()> {
        debug!(subject = %info.subject, trials_completed, "no registry configured");
        Ok(())
    }
}

/// Log-and-continue wrapper for registry calls.
pub async fn register_best_effort(registry: &dyn SessionRegistry, info: &SessionInfo) {
    if let Err(e) = registry.register(info).await {
        warn!(error = %e, "session registration failed, continuing without it");
    }
}

pub async fn finalize_best_effort(
    registry: &dyn SessionRegistry,
    info: &SessionInfo,
    trials_completed: usize,
) {
    if let Err(e) = registry.finalize(info, trials_completed).await {
        warn!(error = %e, "session finalization upload failed, data remains on disk");
    }
}
