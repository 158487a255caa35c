//! Traffic Poke Loop
//!
//! Periodically pokes the controller so it re-samples the device, standing in
//! for completion-path accounting that a kernel driver would do per request.
//! Also owns configuration reload.
//!
//! # Safety Features
//! - **Graceful degradation**: a bad settings file on reload keeps the
//!   running thresholds
//! - **Error counting**: repeated reload failures are logged sparsely
//! - **Early wake**: reload and shutdown interrupt the sleep

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use wb_core::{load_settings_from, Controller};

/// Log every n-th consecutive reload failure
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Shared state for the poke loop
pub struct MonitorState {
    /// Poll interval in milliseconds
    pub poll_interval_ms: AtomicU64,
    /// Signal to reload configuration
    pub reload_signal: AtomicBool,
    /// Wakes the loop immediately on reload or shutdown
    pub wake: Notify,
    pub shutdown: AtomicBool,
    /// Consecutive reload failures
    pub reload_failures: AtomicU32,
    /// Settings file re-read on reload
    pub config_path: PathBuf,
}

impl MonitorState {
    pub fn new(config_path: PathBuf, poll_interval_ms: u64) -> Self {
        Self {
            poll_interval_ms: AtomicU64::new(poll_interval_ms),
            reload_signal: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            reload_failures: AtomicU32::new(0),
            config_path,
        }
    }

    pub fn signal_reload(&self) {
        self.reload_signal.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn check_reload_signal(&self) -> bool {
        self.reload_signal.swap(false, Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Re-read settings and push the new thresholds into the controller
pub async fn reload_config(state: &MonitorState, controller: &Controller) -> wb_error::Result<()> {
    let settings = load_settings_from(&state.config_path)?;
    controller
        .set_thresholds(settings.controller.effective_thresholds())
        .await?;
    state
        .poll_interval_ms
        .store(settings.daemon.poll_interval_ms, Ordering::SeqCst);
    info!(
        "Configuration reloaded from {} (poll {}ms)",
        state.config_path.display(),
        settings.daemon.poll_interval_ms
    );
    Ok(())
}

pub async fn run_monitor_loop(state: Arc<MonitorState>, controller: Controller) {
    info!("Poke loop starting");
    let mut pokes: u64 = 0;

    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }

        if state.check_reload_signal() {
            info!("SIGNAL: Configuration reload requested");
            match reload_config(&state, &controller).await {
                Ok(()) => {
                    state.reload_failures.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    let failures = state.reload_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures == 1 || failures % MAX_CONSECUTIVE_ERRORS == 0 {
                        error!("Reload failed (count: {}): {} - keeping current thresholds", failures, e);
                    }
                }
            }
        }

        if controller.poke() {
            pokes += 1;
        }

        let poll_ms = state.poll_interval_ms.load(Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(poll_ms)) => {}
            _ = state.wake.notified() => {
                debug!("Poke loop woken up early");
            }
        }
    }

    if pokes == 0 {
        warn!("Poke loop stopped without ever queuing an evaluation");
    }
    info!("Poke loop stopped ({} evaluations queued)", pokes);
}
