//! Scan coordination across discovery back-ends.
//!
//! # Scan cycle (for beginners)
//!
//! ```text
//! StartScanning ──► every back-end .start_scanning()
//!                       │
//!      back-end A finished ──► others still scanning? ──► wait
//!      back-end B finished ──► all idle + not yet sent ──► ScanningFinished
//!      back-end A finished again ──► already sent ──► ignored
//! ```
//!
//! Two guards, kept together under one lock, make the aggregate event fire
//! exactly once per cycle:
//!
//! - `starting` counts start fan-outs in progress, so a back-end that
//!   finishes instantly cannot trigger the aggregate event before the later
//!   back-ends have even been told to start.
//! - `finished_sent` is cleared by every start and set by whoever emits the
//!   aggregate event.
//!
//! The finished check reads both guards and the back-ends' scanning state
//! under the same lock a start takes to open its cycle, so a finished signal
//! can never slip in between the two.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tactile_core::protocol::messages::BareMessage;
use tactile_core::{DeviceError, Message, SERVER_MESSAGE_ID};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::discovery::DiscoveryBackend;
use super::session::ServerEvent;

struct CycleState {
    starting: u32,
    finished_sent: bool,
}

/// Fans scan requests out to back-ends and aggregates their completion.
pub struct ScanCoordinator {
    backends: RwLock<Vec<Arc<dyn DiscoveryBackend>>>,
    cycle: Mutex<CycleState>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ScanCoordinator {
    pub fn new(events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            cycle: Mutex::new(CycleState {
                starting: 0,
                // No cycle is open until the first start.
                finished_sent: true,
            }),
            events,
        }
    }

    pub fn add_backend(&self, backend: Arc<dyn DiscoveryBackend>) {
        info!("registered discovery back-end {}", backend.name());
        self.backends
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(backend);
    }

    pub fn backend_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Tells every back-end to start scanning.
    ///
    /// Every back-end is attempted even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NoDiscoveryBackends`] if none are registered, otherwise
    /// the first back-end failure.
    pub async fn start(&self) -> Result<(), DeviceError> {
        let backends = self.snapshot();
        if backends.is_empty() {
            return Err(DeviceError::NoDiscoveryBackends);
        }

        {
            let mut cycle = self.lock_cycle();
            cycle.starting += 1;
            cycle.finished_sent = false;
        }

        let mut first_error = None;
        for backend in &backends {
            debug!("starting scan on {}", backend.name());
            if let Err(e) = backend.start_scanning().await {
                warn!("back-end {} failed to start scanning: {e}", backend.name());
                first_error.get_or_insert(e);
            }
        }

        {
            let mut cycle = self.lock_cycle();
            cycle.starting = cycle.starting.saturating_sub(1);
        }
        // Finished signals that arrived during the fan-out were deferred.
        self.check_all_finished();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tells every back-end to stop scanning.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NoDiscoveryBackends`] if none are registered, otherwise
    /// the first back-end failure.
    pub async fn stop(&self) -> Result<(), DeviceError> {
        let backends = self.snapshot();
        if backends.is_empty() {
            return Err(DeviceError::NoDiscoveryBackends);
        }

        let mut first_error = None;
        for backend in &backends {
            debug!("stopping scan on {}", backend.name());
            if let Err(e) = backend.stop_scanning().await {
                warn!("back-end {} failed to stop scanning: {e}", backend.name());
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handles one back-end's finished signal.
    pub fn on_backend_finished(&self, backend: &str) {
        debug!("back-end {backend} finished scanning");
        self.check_all_finished();
    }

    /// `true` while any back-end reports an active scan.
    pub fn is_scanning(&self) -> bool {
        self.snapshot().iter().any(|b| b.is_scanning())
    }

    fn check_all_finished(&self) {
        let mut cycle = self.lock_cycle();
        if cycle.starting > 0 || cycle.finished_sent || self.is_scanning() {
            return;
        }
        cycle.finished_sent = true;
        drop(cycle);

        info!("all discovery back-ends finished scanning");
        let finished = Message::ScanningFinished(BareMessage::new(SERVER_MESSAGE_ID));
        let _ = self.events.send(ServerEvent::Message(finished));
    }

    fn lock_cycle(&self) -> MutexGuard<'_, CycleState> {
        self.cycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<dyn DiscoveryBackend>> {
        self.backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
