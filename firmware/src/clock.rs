//! Millisecond clock backed by the high-resolution ESP timer.

use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::sys;

use shared::Clock;

#[derive(Debug, Default, Clone, Copy)]
pub struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u32 {
        // Microseconds since boot; wraps after ~49 days like the tick count.
        let micros = unsafe { sys::esp_timer_get_time() };
        (micros / 1000) as u32
    }

    fn delay_ms(&self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }
}
