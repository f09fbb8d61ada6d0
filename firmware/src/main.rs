//! CamLink ESP32 firmware
//!
//! SPI slave on SPI2 that answers PING, buffer status and camera block
//! requests from an external SPI master. The board runs without a camera
//! driver, so capture requests are answered with a camera-unavailable NACK.

use esp_idf_svc::hal::delay::FreeRtos;
use log::*;

use shared::{LinkConfig, NoCamera, SpiResponder, TransactionEngine, VERSION};

mod bus;
mod clock;

use bus::EspSlaveBus;
use clock::EspClock;

pub(crate) type FirmwareEngine = TransactionEngine<EspSlaveBus, EspClock>;
type FirmwareResponder = SpiResponder<EspSlaveBus, EspClock, NoCamera>;

/// Task loop period; yields to the idle task so the task watchdog stays fed
const LOOP_YIELD_MS: u32 = 5;

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("========================================");
    info!("  CamLink SPI slave v{}", VERSION);
    info!("========================================");

    let config = LinkConfig::default();
    info!(
        "Buffers: {} x {} bytes, block size {}, watchdog timeout {} ms",
        config.pool_size, config.buffer_size, config.block_size, config.transaction_timeout_ms
    );

    // Interrupt callbacks hold the engine's address for the life of the program.
    let responder: &'static FirmwareResponder = Box::leak(Box::new(SpiResponder::new(
        EspSlaveBus::new(),
        EspClock,
        config,
        None,
    )?));

    responder.begin()?;
    info!("SPI slave ready, waiting for master");

    loop {
        responder.poll();
        FreeRtos::delay_ms(LOOP_YIELD_MS);
    }
}
