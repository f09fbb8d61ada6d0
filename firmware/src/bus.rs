//! # ESP-IDF SPI Slave Driver
//!
//! [`EspSlaveBus`] brings up SPI2 in slave mode with DMA and queues the
//! engine's transactions on it. The driver keeps a pointer to every queued
//! `spi_slave_transaction_t`, so descriptors live in a ring owned by the bus
//! instead of on the caller's stack.
//!
//! ```text
//! SPI2 ISR ──► post_setup_cb ──► trans.user ──► engine.on_pre_transaction()
//!          └─► post_trans_cb ──► trans.user ──► engine.on_post_transaction(trans_len)
//! ```

use esp_idf_svc::hal::delay::BLOCK;
use esp_idf_svc::sys::{self, esp, EspError};
use log::{debug, info, warn};

use shared::{BusSetup, SlaveBus, Transaction};

use crate::FirmwareEngine;

/// Descriptors beyond the driver queue depth: one in flight, one being refilled
const SPARE_DESCRIPTORS: usize = 2;

pub struct EspSlaveBus {
    host: sys::spi_host_device_t,
    descriptors: Vec<sys::spi_slave_transaction_t>,
    next: usize,
    installed: bool,
}

// SAFETY: the raw pointers inside the descriptors reference the engine's
// transfer buffers and the engine itself, both of which outlive the bus.
unsafe impl Send for EspSlaveBus {}

impl EspSlaveBus {
    pub fn new() -> Self {
        Self {
            host: sys::spi_host_device_t_SPI2_HOST,
            descriptors: Vec::new(),
            next: 0,
            installed: false,
        }
    }

    fn next_descriptor(&mut self) -> &mut sys::spi_slave_transaction_t {
        let index = self.next;
        self.next = (self.next + 1) % self.descriptors.len();
        &mut self.descriptors[index]
    }
}

impl Default for EspSlaveBus {
    fn default() -> Self {
        Self::new()
    }
}

fn ticks(timeout_ms: u32) -> sys::TickType_t {
    if timeout_ms == u32::MAX {
        return BLOCK;
    }
    let ticks = (u64::from(timeout_ms) * u64::from(sys::configTICK_RATE_HZ)).div_ceil(1000);
    ticks.min(u64::from(BLOCK - 1)) as sys::TickType_t
}

impl SlaveBus for EspSlaveBus {
    type Error = EspError;

    fn initialize(&mut self, setup: &BusSetup) -> Result<(), Self::Error> {
        let bus_config = sys::spi_bus_config_t {
            __bindgen_anon_1: sys::spi_bus_config_t__bindgen_ty_1 {
                mosi_io_num: setup.pins.mosi,
            },
            __bindgen_anon_2: sys::spi_bus_config_t__bindgen_ty_2 {
                miso_io_num: setup.pins.miso,
            },
            sclk_io_num: setup.pins.sck,
            __bindgen_anon_3: sys::spi_bus_config_t__bindgen_ty_3 { quadwp_io_num: -1 },
            __bindgen_anon_4: sys::spi_bus_config_t__bindgen_ty_4 { quadhd_io_num: -1 },
            max_transfer_sz: setup.max_transfer as i32,
            ..Default::default()
        };

        let slave_config = sys::spi_slave_interface_config_t {
            spics_io_num: setup.pins.cs,
            flags: 0,
            queue_size: i32::from(setup.queue_depth),
            mode: setup.mode as u8,
            post_setup_cb: Some(post_setup_trampoline),
            post_trans_cb: Some(post_trans_trampoline),
            ..Default::default()
        };

        esp!(unsafe {
            sys::spi_slave_initialize(
                self.host,
                &bus_config,
                &slave_config,
                sys::spi_common_dma_t_SPI_DMA_CH_AUTO,
            )
        })?;

        self.descriptors = vec![Default::default(); usize::from(setup.queue_depth) + SPARE_DESCRIPTORS];
        self.next = 0;
        self.installed = true;
        info!(
            "EspSlaveBus: SPI2 slave up (SCK={}, MISO={}, MOSI={}, CS={}, mode {})",
            setup.pins.sck, setup.pins.miso, setup.pins.mosi, setup.pins.cs, setup.mode as u8
        );
        Ok(())
    }

    fn queue_transaction(&mut self, transaction: Transaction, timeout_ms: u32) -> Result<(), Self::Error> {
        if !self.installed {
            return esp!(sys::ESP_ERR_INVALID_STATE as sys::esp_err_t);
        }

        let host = self.host;
        let descriptor = self.next_descriptor();
        *descriptor = sys::spi_slave_transaction_t {
            length: transaction.length_bits,
            trans_len: 0,
            tx_buffer: transaction.tx.cast(),
            rx_buffer: transaction.rx.cast(),
            user: transaction.context.cast_mut().cast(),
            ..Default::default()
        };

        esp!(unsafe { sys::spi_slave_queue_trans(host, descriptor, ticks(timeout_ms)) })
    }

    fn free(&mut self) {
        if !self.installed {
            return;
        }
        if let Err(e) = esp!(unsafe { sys::spi_slave_free(self.host) }) {
            warn!("EspSlaveBus: spi_slave_free failed: {}", e);
        }
        self.installed = false;
        debug!("EspSlaveBus: SPI2 slave freed");
    }

    fn error_code(error: &Self::Error) -> i32 {
        error.code()
    }
}

/// Engine that queued `trans`, recovered from the `user` field
///
/// # Safety
///
/// `trans` must be a descriptor queued by [`EspSlaveBus`], whose `user` field
/// is the address of a live [`FirmwareEngine`].
unsafe fn engine_of<'a>(trans: *mut sys::spi_slave_transaction_t) -> Option<&'a FirmwareEngine> {
    let trans = trans.as_ref()?;
    (trans.user as *const FirmwareEngine).as_ref()
}

unsafe extern "C" fn post_setup_trampoline(trans: *mut sys::spi_slave_transaction_t) {
    if let Some(engine) = engine_of(trans) {
        engine.on_pre_transaction();
    }
}

unsafe extern "C" fn post_trans_trampoline(trans: *mut sys::spi_slave_transaction_t) {
    if let Some(engine) = engine_of(trans) {
        engine.on_post_transaction((*trans).trans_len);
    }
}

