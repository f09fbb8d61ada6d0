//! # CamLink Host Simulator
//!
//! Runs the communication core on a desktop with a simulated slave driver,
//! a synthetic camera and a scripted SPI master.
//!
//! ```text
//! ┌──────────────── blocking thread ───────────────┐    ┌──── tokio task ────┐
//! │ ResponderLoop: SpiResponder::poll() every N ms │    │ SimMaster          │
//! │   engine ── SimBus ── queue_transaction ───────┼──► │   SimWire          │
//! │   engine ◄─ on_pre / on_post ──────────────────┼─── │   transfer()       │
//! └────────────────────────────────────────────────┘    └────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::task::JoinHandle;

use shared::{LinkConfig, LinkResult, SpiResponder, TransactionEngine};

pub mod bus;
pub mod camera;
pub mod clock;
pub mod master;

pub use bus::{SimBus, SimBusError, SimWire};
pub use camera::{synthetic_frame, SyntheticCamera};
pub use clock::SimClock;
pub use master::{SimError, SimMaster};

pub type SimEngine = TransactionEngine<SimBus, SimClock>;
pub type SimResponder = SpiResponder<SimBus, SimClock, SyntheticCamera>;

/// Responder wired to `wire`, not yet initialized
pub fn build_responder(
    wire: Arc<SimWire>,
    config: LinkConfig,
    camera: Option<SyntheticCamera>,
) -> LinkResult<Arc<SimResponder>> {
    let responder = SpiResponder::new(SimBus::new(wire), SimClock::new(), config, camera)?;
    Ok(Arc::new(responder))
}

/// The slave's task loop on a blocking thread
pub struct ResponderLoop {
    responder: Arc<SimResponder>,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ResponderLoop {
    /// Must be called from within a tokio runtime
    pub fn start(responder: Arc<SimResponder>, period: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let responder = responder.clone();
            let running = running.clone();
            tokio::task::spawn_blocking(move || {
                while running.load(Ordering::Acquire) {
                    responder.poll();
                    std::thread::sleep(period);
                }
            })
        };
        info!("ResponderLoop: started, {} ms period", period.as_millis());

        Self {
            responder,
            running,
            handle,
        }
    }

    pub fn responder(&self) -> &Arc<SimResponder> {
        &self.responder
    }

    /// Stop polling and wait for the loop to exit
    pub async fn stop(self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.handle.await {
            error!("ResponderLoop: task loop panicked: {}", e);
        }
    }
}
