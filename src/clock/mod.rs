use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

/// Errors raised while reading a system clock.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("reading {clock} clock failed (errno {errno})")]
    Read { clock: &'static str, errno: i32 },

    #[error("{clock} clock value out of range")]
    OutOfRange { clock: &'static str },
}

/// Source of the two time domains the aggregator bridges.
///
/// `wall_ns` is Unix time; `device_ns` is the clock GPU profiler timestamps
/// are taken from (boot time on Linux).
pub trait Clock: Send + Sync {
    fn wall_ns(&self) -> Result<i64, ClockError>;

    fn device_ns(&self) -> Result<i64, ClockError>;

    /// Wall time in whole milliseconds, truncating.
    fn wall_ms(&self) -> Result<i64, ClockError> {
        Ok(self.wall_ns()?.div_euclid(1_000_000))
    }
}

/// Kernel-backed clock using `CLOCK_REALTIME` and `CLOCK_BOOTTIME`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall_ns(&self) -> Result<i64, ClockError> {
        clock_gettime_ns(libc::CLOCK_REALTIME, "realtime")
    }

    fn device_ns(&self) -> Result<i64, ClockError> {
        clock_gettime_ns(libc::CLOCK_BOOTTIME, "boottime")
    }
}

fn clock_gettime_ns(clock_id: libc::clockid_t, clock: &'static str) -> Result<i64, ClockError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime` only writes into the provided, valid timespec.
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(ClockError::Read { clock, errno });
    }

    i64::from(ts.tv_sec)
        .checked_mul(1_000_000_000)
        .and_then(|ns| ns.checked_add(i64::from(ts.tv_nsec)))
        .ok_or(ClockError::OutOfRange { clock })
}

/// Manually driven clock for deterministic tests and benchmarks.
///
/// Cloning shares the underlying readings.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    wall_ns: Arc<AtomicI64>,
    device_ns: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(wall_ns: i64, device_ns: i64) -> Self {
        Self {
            wall_ns: Arc::new(AtomicI64::new(wall_ns)),
            device_ns: Arc::new(AtomicI64::new(device_ns)),
        }
    }

    pub fn set_wall_ns(&self, ns: i64) {
        self.wall_ns.store(ns, Ordering::Relaxed);
    }

    pub fn set_wall_secs(&self, secs: i64) {
        self.set_wall_ns(secs * 1_000_000_000);
    }

    /// Advances both clocks by the same amount.
    pub fn advance_ns(&self, ns: i64) {
        self.wall_ns.fetch_add(ns, Ordering::Relaxed);
        self.device_ns.fetch_add(ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn wall_ns(&self) -> Result<i64, ClockError> {
        Ok(self.wall_ns.load(Ordering::Relaxed))
    }

    fn device_ns(&self) -> Result<i64, ClockError> {
        Ok(self.device_ns.load(Ordering::Relaxed))
    }
}

/// Fixed device-to-wall clock offset, measured once.
///
/// Drift between the two clocks after measurement is not corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOffset {
    offset_ns: i64,
}

impl ClockOffset {
    /// Measures `wall - device` from back-to-back clock readings.
    pub fn measure(clock: &impl Clock) -> Result<Self, ClockError> {
        let device_ns = clock.device_ns()?;
        let wall_ns = clock.wall_ns()?;
        let offset_ns = wall_ns
            .checked_sub(device_ns)
            .ok_or(ClockError::OutOfRange { clock: "offset" })?;

        info!(offset_ns, "measured device clock offset");

        Ok(Self { offset_ns })
    }

    pub const fn from_ns(offset_ns: i64) -> Self {
        Self { offset_ns }
    }

    pub const fn as_ns(self) -> i64 {
        self.offset_ns
    }

    /// Converts a device timestamp to Unix milliseconds, truncating.
    pub fn device_to_wall_ms(self, device_ns: u64) -> i64 {
        let device_ns = i64::try_from(device_ns).unwrap_or(i64::MAX);
        device_ns
            .saturating_add(self.offset_ns)
            .div_euclid(1_000_000)
    }
}
