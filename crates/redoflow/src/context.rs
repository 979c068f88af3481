//! Process-wide context shared by every pipeline stage.
//!
//! `Ctx` is built once at startup and handed by reference to every
//! component: runtime flags, disabled consistency checks, the shutdown
//! switches, and the clock. Nothing here is a global; the daemon owns the
//! single instance.

use crate::config::{DisableCheck, RedoFlag};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock abstraction so tests run deterministically
/// (`REDOFLOW_LOCALES=MOCK`).
pub trait Clock: Send + Sync {
    /// Unix time in seconds.
    fn now(&self) -> i64;
    /// Unix time in microseconds.
    fn now_us(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        self.now_us() / 1_000_000
    }

    fn now_us(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }
}

/// Fixed clock for deterministic tests; advance it explicitly.
#[derive(Debug, Default)]
pub struct MockClock {
    micros: std::sync::atomic::AtomicI64,
}

impl MockClock {
    pub fn new(unix_seconds: i64) -> Self {
        MockClock { micros: std::sync::atomic::AtomicI64::new(unix_seconds * 1_000_000) }
    }

    pub fn advance_us(&self, us: i64) {
        self.micros.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> i64 {
        self.now_us() / 1_000_000
    }

    fn now_us(&self) -> i64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Shared context: flags, checks, shutdown switches, clock.
pub struct Ctx {
    pub database: String,
    flags: u64,
    disable_checks: HashSet<DisableCheck>,
    soft_shutdown: AtomicBool,
    hard_shutdown: AtomicBool,
    pub clock: Arc<dyn Clock>,
    /// Condvars registered by stages so a shutdown can unblock every wait.
    wakers: Mutex<Vec<Arc<Condvar>>>,
    /// Log timezone offset in minutes east of UTC (`REDOFLOW_LOG_TIMEZONE`).
    pub log_timezone_min: i32,
}

impl Ctx {
    pub fn new(database: impl Into<String>) -> Self {
        Ctx {
            database: database.into(),
            flags: 0,
            disable_checks: HashSet::new(),
            soft_shutdown: AtomicBool::new(false),
            hard_shutdown: AtomicBool::new(false),
            clock: Arc::new(SystemClock),
            wakers: Mutex::new(Vec::new()),
            log_timezone_min: 0,
        }
    }

    pub fn with_flags(mut self, flags: &[RedoFlag]) -> Self {
        for f in flags {
            self.flags |= f.bit();
        }
        self
    }

    pub fn with_disable_checks(mut self, checks: &[DisableCheck]) -> Self {
        self.disable_checks.extend(checks.iter().copied());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_log_timezone_min(mut self, minutes: i32) -> Self {
        self.log_timezone_min = minutes;
        self
    }

    pub fn is_flag_set(&self, flag: RedoFlag) -> bool {
        self.flags & flag.bit() != 0
    }

    pub fn is_check_disabled(&self, check: DisableCheck) -> bool {
        self.disable_checks.contains(&check)
    }

    /// Finish the current LWN, flush, checkpoint, exit cleanly.
    pub fn stop_soft(&self) {
        if !self.soft_shutdown.swap(true, Ordering::SeqCst) {
            tracing::info!(code = 0u32, "soft shutdown requested");
        }
        self.wake_all();
    }

    /// Abandon in-flight work; nothing past this point is acknowledged.
    pub fn stop_hard(&self) {
        if !self.hard_shutdown.swap(true, Ordering::SeqCst) {
            tracing::warn!(code = 0u32, "hard shutdown requested");
        }
        self.soft_shutdown.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn soft_shutdown(&self) -> bool {
        self.soft_shutdown.load(Ordering::SeqCst)
    }

    pub fn hard_shutdown(&self) -> bool {
        self.hard_shutdown.load(Ordering::SeqCst)
    }

    /// Register a condvar to be notified on shutdown. Every stage registers
    /// the condvars it sleeps on; all waits also carry a timeout so a missed
    /// notify cannot wedge the process.
    pub fn register_waker(&self, cond: Arc<Condvar>) {
        self.wakers.lock().push(cond);
    }

    fn wake_all(&self) {
        for cond in self.wakers.lock().iter() {
            cond.notify_all();
        }
    }
}
