//! # SPI Responder
//!
//! Ties the engine, dispatcher, watchdog and health monitor into one task
//! loop step.
//!
//! ## Poll Cycle
//!
//! ```text
//! poll()
//!   ├─ process_next_receive()      one packet ─► handler ─► prepare_outbound
//!   ├─ ensure_transaction_queued() re-arm requested by the interrupt
//!   ├─ watchdog (every watchdog_interval_ms)
//!   ├─ health   (every health_check_interval_ms)
//!   └─ report packets dropped by the interrupt since the last poll
//! ```
//!
//! The engine is boxed so its address, which the bus driver hands back to
//! the interrupt callbacks, stays fixed even if the responder is moved.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{BusPins, LinkConfig, SpiMode};
use crate::dispatcher::ProtocolDispatcher;
use crate::engine::{LinkStats, TransactionEngine};
use crate::error::LinkResult;
use crate::health::{HealthCheck, HealthStatus};
use crate::traits::{Clock, FrameSource, PacketHandler, SlaveBus};
use crate::watchdog::Watchdog;

type BoxedHandler = Box<dyn PacketHandler + Send>;

/// Task-side driver of the SPI slave link
pub struct SpiResponder<B, C, F: FrameSource> {
    engine: Box<TransactionEngine<B, C>>,
    dispatcher: spin::Mutex<ProtocolDispatcher<F>>,
    handler: spin::Mutex<Option<BoxedHandler>>,
    watchdog: Watchdog,
    health: spin::Mutex<HealthCheck>,
    last_watchdog_ms: AtomicU32,
    reported_drops: AtomicU32,
    reported_transient: AtomicU32,
}

impl<B: SlaveBus, C: Clock, F: FrameSource> SpiResponder<B, C, F> {
    /// Build the engine and the default dispatcher
    ///
    /// `camera` is `None` on boards without a capture device; camera requests
    /// are then answered with a "camera unavailable" NACK.
    pub fn new(bus: B, clock: C, config: LinkConfig, camera: Option<F>) -> LinkResult<Self> {
        let watchdog = Watchdog::new(config.transaction_timeout_ms);
        let health = HealthCheck::with_link_checks(config.health_check_interval_ms);
        let dispatcher = ProtocolDispatcher::new(camera, config.block_size);
        let engine = Box::new(TransactionEngine::new(bus, clock, config)?);

        Ok(Self {
            engine,
            dispatcher: spin::Mutex::new(dispatcher),
            handler: spin::Mutex::new(None),
            watchdog,
            health: spin::Mutex::new(health),
            last_watchdog_ms: AtomicU32::new(0),
            reported_drops: AtomicU32::new(0),
            reported_transient: AtomicU32::new(0),
        })
    }

    /// Initialize with the configured pins and mode
    pub fn begin(&self) -> LinkResult<()> {
        let config = self.engine.config();
        self.begin_with(config.pins, config.mode)
    }

    pub fn begin_with(&self, pins: BusPins, mode: SpiMode) -> LinkResult<()> {
        self.engine.init(pins, mode)?;
        self.last_watchdog_ms
            .store(self.engine.clock().now_ms(), Ordering::Release);
        Ok(())
    }

    pub fn engine(&self) -> &TransactionEngine<B, C> {
        &self.engine
    }

    /// Route every received packet to `handler` instead of the dispatcher
    pub fn set_receive_callback<H>(&self, handler: H)
    where
        H: PacketHandler + Send + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
        log::info!("SpiResponder: custom packet handler registered");
    }

    /// Go back to the built-in dispatcher
    pub fn clear_receive_callback(&self) {
        *self.handler.lock() = None;
    }

    /// Locked access to the built-in dispatcher
    pub fn dispatcher(&self) -> spin::MutexGuard<'_, ProtocolDispatcher<F>> {
        self.dispatcher.lock()
    }

    /// Handle at most one received packet; false when the queue was empty
    pub fn process_next_receive(&self) -> bool {
        let Some(packet) = self.engine.next_packet() else {
            return false;
        };
        log::debug!(
            "SpiResponder: handling {} byte packet, command {:#04x}",
            packet.len(),
            packet.command().unwrap_or(0)
        );

        let sink = &*self.engine;
        let mut handler = self.handler.lock();
        match handler.as_mut() {
            Some(handler) => handler.handle_packet(packet.as_bytes(), sink),
            None => self.dispatcher.lock().handle_packet(packet.as_bytes(), sink),
        }
        true
    }

    /// One iteration of the task loop
    pub fn poll(&self) {
        self.process_next_receive();
        self.engine.ensure_transaction_queued();

        let now = self.engine.clock().now_ms();
        let last = self.last_watchdog_ms.load(Ordering::Acquire);
        if now.wrapping_sub(last) >= self.engine.config().watchdog_interval_ms {
            self.last_watchdog_ms.store(now, Ordering::Release);
            self.watchdog.poll(self.engine());
        }

        let mut health = self.health.lock();
        if health.is_due(now) {
            health.update(now, &self.engine.stats());
        }
        drop(health);

        self.report_interrupt_events();
    }

    /// Log what the interrupt counted since the last poll
    fn report_interrupt_events(&self) {
        let dropped = self.engine.activity().dropped_packets();
        let reported = self.reported_drops.swap(dropped, Ordering::AcqRel);
        if dropped != reported {
            log::warn!(
                "SpiResponder: {} packets dropped since last poll ({} total)",
                dropped.wrapping_sub(reported),
                dropped
            );
        }

        let transient = self.engine.pool().transient_allocations();
        let reported = self.reported_transient.swap(transient, Ordering::AcqRel);
        if transient != reported {
            log::warn!(
                "SpiResponder: buffer pool exhausted, {} transient buffers allocated",
                transient.wrapping_sub(reported)
            );
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.engine.stats()
    }

    pub fn health(&self) -> HealthStatus {
        self.health.lock().overall()
    }

    /// Drop the stored camera frame
    pub fn release_frame(&self) {
        self.dispatcher.lock().release_frame();
    }
}
