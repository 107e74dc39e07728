//! DATA and SENSE line control.
//!
//! DATA is an open-collector style shared wire: either end may pull it
//! LOW, neither may drive it HIGH. "Busy" asserts LOW; "idle" releases
//! the pin and lets the pull-up win. There is deliberately no way to
//! drive the line high from this interface.

use core::ops::{Deref, DerefMut};

use crate::hal::Platform;

pub struct LineDriver<P: Platform> {
    platform: P,
    data_pin: u8,
    sense_pin: u8,
}

impl<P: Platform> LineDriver<P> {
    pub fn new(platform: P, data_pin: u8, sense_pin: u8) -> Self {
        Self { platform, data_pin, sense_pin }
    }

    pub fn set_pins(&mut self, data_pin: u8, sense_pin: u8) {
        self.data_pin = data_pin;
        self.sense_pin = sense_pin;
    }

    /// Put both lines in their between-sessions state: DATA released,
    /// SENSE asserted so the radio stays in keyload mode.
    pub fn init_pins(&mut self) {
        self.data_idle();
        self.platform.pin_output(self.sense_pin);
        self.sense_connect();
    }

    /// Assert DATA low.
    pub fn data_busy(&mut self) {
        self.platform.pin_output(self.data_pin);
        self.platform.pin_write(self.data_pin, false);
    }

    /// Release DATA; the pull-up returns the line high.
    pub fn data_idle(&mut self) {
        self.platform.pin_input_pullup(self.data_pin);
    }

    pub fn data_is_busy(&mut self) -> bool {
        !self.platform.pin_read(self.data_pin)
    }

    pub fn data_is_idle(&mut self) -> bool {
        self.platform.pin_read(self.data_pin)
    }

    /// Drive SENSE low; the radio sees a KFD attached.
    pub fn sense_connect(&mut self) {
        self.platform.pin_write(self.sense_pin, false);
    }

    pub fn sense_disconnect(&mut self) {
        self.platform.pin_write(self.sense_pin, true);
    }

    pub fn sense_is_connected(&mut self) -> bool {
        !self.platform.pin_read(self.sense_pin)
    }

    pub fn sense_is_disconnected(&mut self) -> bool {
        self.platform.pin_read(self.sense_pin)
    }

    pub fn now_micros(&mut self) -> u64 {
        self.platform.now_micros()
    }

    pub fn now_millis(&mut self) -> u64 {
        self.platform.now_millis()
    }

    pub fn delay_micros(&mut self, us: u32) {
        self.platform.delay_micros(us);
    }

    pub fn delay_millis(&mut self, ms: u32) {
        self.platform.delay_millis(ms);
    }

    /// Suspend preemption for the scope of the returned guard.
    pub fn critical(&mut self) -> CriticalSection<'_, P> {
        self.platform.suspend_preemption();
        CriticalSection { line: self }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }
}

/// Byte-scope critical section. Preemption resumes when the guard
/// drops, including on early return.
pub struct CriticalSection<'a, P: Platform> {
    line: &'a mut LineDriver<P>,
}

impl<P: Platform> Deref for CriticalSection<'_, P> {
    type Target = LineDriver<P>;

    fn deref(&self) -> &Self::Target {
        self.line
    }
}

impl<P: Platform> DerefMut for CriticalSection<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.line
    }
}

impl<P: Platform> Drop for CriticalSection<'_, P> {
    fn drop(&mut self) {
        self.line.platform.resume_preemption();
    }
}
