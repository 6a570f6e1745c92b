//! Pause/resume gate and the out-of-band hard halt
//!
//! [`RunControl`] is cloneable and usable from any task, so a caller can
//! pause the driver or halt the board while a driver operation is blocked
//! waiting on the controller.

use crate::communication::ControlLines;
use motionkit_core::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct RunControl {
    run_tx: Arc<watch::Sender<bool>>,
    halting: Arc<AtomicBool>,
    lines: Arc<dyn ControlLines>,
    pulse: Duration,
}

impl RunControl {
    pub fn new(lines: Arc<dyn ControlLines>, pulse: Duration) -> Self {
        let (run_tx, _) = watch::channel(true);
        Self {
            run_tx: Arc::new(run_tx),
            halting: Arc::new(AtomicBool::new(false)),
            lines,
            pulse,
        }
    }

    /// Block the next move or home until [`RunControl::resume`]
    pub fn pause(&self) {
        self.run_tx.send_replace(false);
    }

    pub fn resume(&self) {
        self.run_tx.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        *self.run_tx.borrow()
    }

    /// Wait until the run flag is set
    pub async fn wait_until_running(&self) {
        let mut rx = self.run_tx.subscribe();
        // the sender lives as long as self, so this only fails if it is dropped
        let _ = rx.wait_for(|running| *running).await;
    }

    /// Pulse the halt line. Motion stops immediately and the controller
    /// raises an alarm, which the driver reports as a halt rather than a
    /// protocol failure. Leaves the run flag set.
    pub async fn hard_halt(&self) -> Result<()> {
        tracing::info!("Hard halting controller");
        self.halting.store(true, Ordering::SeqCst);
        self.lines.set_halt(true)?;
        tokio::time::sleep(self.pulse).await;
        self.lines.set_halt(false)?;
        tokio::time::sleep(self.pulse).await;
        self.resume();
        Ok(())
    }

    /// Pulse the reset line with the ISP line released, so the board boots
    /// its application
    pub async fn pulse_reset(&self) -> Result<()> {
        tracing::info!("Resetting controller");
        self.lines.set_reset(true)?;
        self.lines.set_isp(false)?;
        tokio::time::sleep(self.pulse).await;
        self.lines.set_reset(false)?;
        tokio::time::sleep(self.pulse).await;
        Ok(())
    }

    pub(crate) fn is_halting(&self) -> bool {
        self.halting.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_halting(&self) {
        self.halting.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("running", &self.is_running())
            .field("halting", &self.is_halting())
            .finish()
    }
}
