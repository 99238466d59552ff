//! Clock & message-id generation (§4.A).
//!
//! Message ids are 64-bit, strictly increasing, and aligned to a
//! multiple of 4 so that server-origin and client-origin ids can be
//! told apart downstream (dispatch relies on the low bits never being
//! reused across directions).

use std::time::{SystemTime, UNIX_EPOCH};

/// Abstracts wall-clock and monotonic time so tests can drive the
/// scheduler without sleeping. Production code uses `SystemClock`.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn wall_millis(&self) -> i64;

    /// Milliseconds since an arbitrary fixed point, monotonically
    /// increasing even if wall-clock time is adjusted.
    fn monotonic_millis(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock {
    start: std::time::Instant,
    start_wall: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        let start_wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64;
        Self { start: std::time::Instant::now(), start_wall }
    }
}

impl Clock for SystemClock {
    fn wall_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }

    fn monotonic_millis(&self) -> i64 {
        self.start_wall + self.start.elapsed().as_millis() as i64
    }
}

/// Generates strictly increasing, mod-4-aligned 64-bit message ids and
/// tracks the server time offset used to derive them.
///
/// ```text
/// id = floor(((wallMillis + timeOffset*1000) * 2^32) / 1000)
/// if id <= lastId: id = lastId + 1
/// while id % 4 != 0: id++
/// lastId = id
/// ```
pub struct MessageIdGenerator {
    clock: Box<dyn Clock>,
    last_id: i64,
    /// Server time offset in (fractional) seconds, adjusted from ping
    /// replies and bad-msg notifications.
    time_offset: f64,
}

impl MessageIdGenerator {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self { clock, last_id: 0, time_offset: 0.0 }
    }

    pub fn time_offset(&self) -> f64 {
        self.time_offset
    }

    pub fn set_time_offset(&mut self, offset_secs: f64) {
        self.time_offset = offset_secs;
    }

    pub fn adjust_time_offset(&mut self, delta_secs: f64) {
        self.time_offset += delta_secs;
    }

    /// Current wall time adjusted by the server offset, in whole
    /// seconds — used to compare against server-reported timestamps
    /// within the ±5s tolerance of §8's ping scenario.
    pub fn current_time_secs(&self) -> f64 {
        (self.clock.wall_millis() as f64) / 1000.0 + self.time_offset
    }

    pub fn monotonic_secs(&self) -> i64 {
        self.clock.monotonic_millis() / 1000
    }

    pub fn monotonic_millis(&self) -> i64 {
        self.clock.monotonic_millis()
    }

    pub fn generate(&mut self) -> i64 {
        let wall_millis = self.clock.wall_millis() as f64;
        let mut id = ((wall_millis + self.time_offset * 1000.0) * 4294967296.0 / 1000.0) as i64;
        if id <= self.last_id {
            id = self.last_id + 1;
        }
        while id % 4 != 0 {
            id += 1;
        }
        self.last_id = id;
        id
    }

    pub fn last_id(&self) -> i64 {
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeClock {
        wall: AtomicI64,
    }

    impl Clock for FakeClock {
        fn wall_millis(&self) -> i64 {
            self.wall.load(Ordering::SeqCst)
        }
        fn monotonic_millis(&self) -> i64 {
            self.wall.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn ids_are_strictly_monotone_and_aligned() {
        let clock = FakeClock { wall: AtomicI64::new(1_700_000_000_000) };
        let mut gen = MessageIdGenerator::new(Box::new(clock));
        let mut last = -1i64;
        for _ in 0..1_000_000 {
            let id = gen.generate();
            assert!(id > last, "message ids must be strictly increasing");
            assert_eq!(id % 4, 0, "message ids must be 4-aligned");
            last = id;
        }
    }

    #[test]
    fn offset_shifts_subsequent_ids_forward() {
        let clock = FakeClock { wall: AtomicI64::new(1_700_000_000_000) };
        let mut gen = MessageIdGenerator::new(Box::new(clock));
        let before = gen.generate();
        gen.set_time_offset(120.0);
        let after = gen.generate();
        assert!(after > before);
    }
}
