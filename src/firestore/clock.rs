//! Time Source
//!
//! Abstracts the server clock so the commit engine and transaction manager
//! never call `Timestamp::now()` directly — tests can pin, offset, or
//! script time instead of racing the wall clock.
//!
//! # Reference
//! A plain enum of variants over a small closed set of clock modes
//! (system, constant, offset, custom), the same shape `ControllerOptions`
//! uses for a small closed set of configuration values.

use super::timestamp::Timestamp;
use chrono::Utc;
use std::sync::Mutex;

/// A generator function for the `Custom` clock mode.
pub type CustomClockFn = Box<dyn Fn() -> Timestamp + Send + Sync>;

enum Mode {
    System,
    Constant(Timestamp),
    /// Tracks real elapsed time since configuration, with an additional
    /// millisecond offset applied by `advance`.
    Offset {
        configured_at: std::time::Instant,
        base: Timestamp,
        advance_ms: i64,
    },
    Custom(CustomClockFn),
}

/// The abstract server clock used throughout the engine.
///
/// All reads and writes that need "now" go through this type rather than
/// the system clock directly, so tests can hold time still or advance it
/// deterministically.
pub struct TimeSource {
    mode: Mutex<Mode>,
}

impl Default for TimeSource {
    fn default() -> Self {
        TimeSource::system()
    }
}

impl TimeSource {
    /// Use the real system clock.
    pub fn system() -> TimeSource {
        TimeSource {
            mode: Mutex::new(Mode::System),
        }
    }

    /// Always report the same fixed timestamp.
    pub fn constant(at: Timestamp) -> TimeSource {
        TimeSource {
            mode: Mutex::new(Mode::Constant(at)),
        }
    }

    /// Track real elapsed time starting from `base`, adjustable later via
    /// [`TimeSource::advance`].
    pub fn offset(base: Timestamp) -> TimeSource {
        TimeSource {
            mode: Mutex::new(Mode::Offset {
                configured_at: std::time::Instant::now(),
                base,
                advance_ms: 0,
            }),
        }
    }

    /// Delegate to a caller-supplied generator.
    pub fn custom(f: CustomClockFn) -> TimeSource {
        TimeSource {
            mode: Mutex::new(Mode::Custom(f)),
        }
    }

    /// The current server time under whichever mode is configured.
    pub fn now(&self) -> Timestamp {
        let mode = self.mode.lock().expect("clock mode poisoned");
        match &*mode {
            Mode::System => Timestamp::from_datetime(Utc::now()),
            Mode::Constant(ts) => *ts,
            Mode::Offset {
                configured_at,
                base,
                advance_ms,
            } => {
                let elapsed_ms = configured_at.elapsed().as_millis() as i64 + advance_ms;
                add_millis(*base, elapsed_ms)
            }
            Mode::Custom(f) => f(),
        }
    }

    /// Shift the `Offset` mode's clock forward by `ms` milliseconds,
    /// relative to the last reported time. A no-op under any other mode.
    pub fn advance(&self, ms: i64) {
        let mut mode = self.mode.lock().expect("clock mode poisoned");
        if let Mode::Offset { advance_ms, .. } = &mut *mode {
            *advance_ms += ms;
        }
    }
}

fn add_millis(ts: Timestamp, ms: i64) -> Timestamp {
    let total_nanos = ts.nanoseconds as i64 + ms * 1_000_000;
    let extra_seconds = total_nanos.div_euclid(1_000_000_000);
    let nanoseconds = total_nanos.rem_euclid(1_000_000_000) as i32;
    Timestamp::new(ts.seconds + extra_seconds, nanoseconds).expect("rem_euclid keeps nanos in range")
}
