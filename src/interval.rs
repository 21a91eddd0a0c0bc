//! Periodic deadlines on a free-running, wrapping 32-bit tick counter.

/// Fires once every `period` ticks.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period: u32,
    last: u32,
}

impl Interval {
    /// `period` must be below `u32::MAX / 2` ticks so wrap-around is unambiguous.
    pub const fn new(period: u32, now: u32) -> Self {
        Self { period, last: now }
    }

    /// Converts `ms` to ticks of a `ticks_per_second` counter, saturating.
    pub const fn ticks_from_ms(ms: u32, ticks_per_second: u32) -> u32 {
        let ticks = ms as u64 * ticks_per_second as u64 / 1000;
        if ticks > u32::MAX as u64 {
            u32::MAX
        } else {
            ticks as u32
        }
    }

    /// Whether a period elapsed since the last time this returned `true`.
    pub fn poll(&mut self, now: u32) -> bool {
        if now.wrapping_sub(self.last) >= self.period {
            self.last = now;
            true
        } else {
            false
        }
    }
}
