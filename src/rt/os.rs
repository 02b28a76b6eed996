//! Thin OS layer for the real-time task: memory locking, SCHED_FIFO,
//! the monotonic clock, and drift-free periodic pacing.
//!
//! On Linux the pacing uses `clock_nanosleep(TIMER_ABSTIME)` against
//! `CLOCK_MONOTONIC`; elsewhere everything degrades to `Instant` and
//! relative sleeps, and the realtime knobs report
//! [`OsError::Unsupported`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crossbeam::utils::CachePadded;

use crate::error::OsError;

/// Default tick period: 1 ms.
pub const DEFAULT_PERIOD_NS: i64 = 1_000_000;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// State shared between the RT task and the host side: the current
/// period, the finished latch, and whether realtime scheduling is in
/// effect.
pub struct Task {
    period_ns: CachePadded<AtomicI64>,
    finished: CachePadded<AtomicBool>,
    realtime: CachePadded<AtomicBool>,
}

impl Task {
    pub fn new(period_ns: i64) -> Arc<Self> {
        Arc::new(Self {
            period_ns: CachePadded::new(AtomicI64::new(period_ns.max(1))),
            finished: CachePadded::new(AtomicBool::new(false)),
            realtime: CachePadded::new(AtomicBool::new(false)),
        })
    }

    /// Current loop period in nanoseconds.
    #[inline]
    pub fn period(&self) -> i64 {
        self.period_ns.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_period(&self, period_ns: i64) {
        self.period_ns.store(period_ns.max(1), Ordering::Release);
    }

    /// True once the RT loop has exited or was asked to exit.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// True when the loop runs under a realtime scheduling policy.
    /// False means best-effort timing.
    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.realtime.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_realtime(&self, on: bool) {
        self.realtime.store(on, Ordering::Release);
    }
}

/// Lock current and future pages into memory so the RT task never
/// page-faults. Requires CAP_IPC_LOCK; a refusal downgrades the system
/// to best-effort and is not fatal.
#[cfg(target_os = "linux")]
pub fn initiate() -> Result<(), OsError> {
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(code) if code == libc::EPERM || code == libc::ENOMEM => OsError::Permission,
            _ => OsError::Io(err),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn initiate() -> Result<(), OsError> {
    Err(OsError::Unsupported)
}

/// Undo [`initiate`].
#[cfg(target_os = "linux")]
pub fn shutdown() {
    unsafe {
        libc::munlockall();
    }
}

#[cfg(not(target_os = "linux"))]
pub fn shutdown() {}

/// Put the current thread under SCHED_FIFO at the given priority
/// (clamped to 1..=99). Requires CAP_SYS_NICE or root.
#[cfg(target_os = "linux")]
pub fn set_realtime_priority(priority: i32) -> Result<(), OsError> {
    let param = libc::sched_param {
        sched_priority: priority.clamp(1, 99),
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(code) if code == libc::EPERM || code == libc::EACCES => OsError::Permission,
            _ => OsError::Io(err),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime_priority(_priority: i32) -> Result<(), OsError> {
    Err(OsError::Unsupported)
}

/// Monotonic timestamp in nanoseconds.
#[cfg(target_os = "linux")]
pub fn now_ns() -> i64 {
    use nix::time::{ClockId, clock_gettime};
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as i64 * NANOS_PER_SEC + ts.tv_nsec() as i64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn now_ns() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_nanos() as i64
}

/// Sleep until an absolute monotonic deadline.
#[cfg(target_os = "linux")]
pub(crate) fn sleep_until(deadline_ns: i64) {
    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::time::{ClockId, ClockNanosleepFlags, clock_nanosleep};

    let ts = TimeSpec::new(
        (deadline_ns / NANOS_PER_SEC) as _,
        (deadline_ns % NANOS_PER_SEC) as _,
    );
    loop {
        match clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &ts,
        ) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sleep_until(deadline_ns: i64) {
    let remaining = deadline_ns - now_ns();
    if remaining > 0 {
        std::thread::sleep(std::time::Duration::from_nanos(remaining as u64));
    }
}

/// Drift-free periodic sleeper. The wake-up reference is the anchor
/// plus cumulative periods, not "now + period"; boundaries missed by an
/// overrun are skipped, not replayed.
pub struct Pacer {
    period_ns: i64,
    next_wake_ns: i64,
}

impl Pacer {
    pub fn new(period_ns: i64) -> Self {
        let period_ns = period_ns.max(1);
        Self {
            period_ns,
            next_wake_ns: now_ns() + period_ns,
        }
    }

    pub fn period_ns(&self) -> i64 {
        self.period_ns
    }

    /// Change the period and re-anchor the boundary grid at now.
    pub fn set_period(&mut self, period_ns: i64) {
        self.period_ns = period_ns.max(1);
        self.next_wake_ns = now_ns() + self.period_ns;
    }

    /// Sleep to the next boundary and advance it.
    pub fn wait(&mut self) {
        sleep_until(self.next_wake_ns);
        let now = now_ns();
        self.next_wake_ns += self.period_ns;
        while self.next_wake_ns <= now {
            self.next_wake_ns += self.period_ns;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn initiate_succeeds_or_lacks_privileges() {
        // Without CAP_IPC_LOCK this must degrade, not fail hard.
        match initiate() {
            Ok(()) => shutdown(),
            Err(OsError::Permission) | Err(OsError::Unsupported) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn realtime_priority_succeeds_or_lacks_privileges() {
        match set_realtime_priority(50) {
            Ok(()) | Err(OsError::Permission) | Err(OsError::Unsupported) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn pacer_holds_the_boundary_grid() {
        let period = 2_000_000i64; // 2 ms
        let mut pacer = Pacer::new(period);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.wait();
        }
        // Five boundaries at 2 ms spacing; allow generous scheduler slack
        // on the low side only.
        assert!(start.elapsed().as_nanos() as i64 >= 4 * period);
    }

    #[test]
    fn task_state_round_trips() {
        let task = Task::new(DEFAULT_PERIOD_NS);
        assert_eq!(task.period(), DEFAULT_PERIOD_NS);
        assert!(!task.is_finished());
        assert!(!task.is_realtime());
        task.set_period(500_000);
        assert_eq!(task.period(), 500_000);
        task.finish();
        assert!(task.is_finished());
    }
}
