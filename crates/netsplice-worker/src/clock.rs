use std::time::Duration;

/// Tick rate used when none is configured.
pub const DEFAULT_HZ: u32 = 100;

/// Converts a fractional-second timeout to whole host ticks, truncating.
///
/// NaN and non-positive timeouts map to zero ticks; huge and infinite timeouts saturate.
pub fn timeout_to_ticks(timeout_secs: f64, hz: u32) -> u32 {
    if timeout_secs.is_nan() || timeout_secs <= 0.0 {
        return 0;
    }
    let ticks = (timeout_secs * f64::from(hz)).trunc();
    if ticks >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        ticks as u32
    }
}

/// Pauses the calling context for a timeout expressed in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blocker {
    hz: u32,
}

impl Default for Blocker {
    fn default() -> Self {
        Self::new(DEFAULT_HZ)
    }
}

impl Blocker {
    pub fn new(hz: u32) -> Self {
        Self { hz: hz.max(1) }
    }

    pub fn hz(&self) -> u32 {
        self.hz
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(1) / self.hz
    }

    pub fn ticks_for(&self, timeout_secs: f64) -> u32 {
        timeout_to_ticks(timeout_secs, self.hz)
    }

    /// Sleeps for `timeout_secs` rounded down to ticks, and never less than one tick.
    pub fn block(&self, timeout_secs: f64) {
        let ticks = self.ticks_for(timeout_secs).max(1);
        std::thread::sleep(self.tick() * ticks);
    }
}
