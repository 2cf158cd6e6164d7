//! Stop-the-world support: freezing every sibling thread around live code
//! rewrites that are not single-store atomic.
//!
//! Threads are enumerated from `/proc/self/task` and signalled one by one
//! with `tgkill`. The signal is a real-time one whose handler parks the
//! thread until the freezer releases it; SIGSTOP cannot be used because a
//! stop signal delivered to any thread halts the whole thread group,
//! caller included.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once, OnceLock};
use std::time::{Duration, Instant};

use log::{debug, warn};

/// Threads signalled but not yet parked are given this long before the
/// freezer proceeds anyway (a thread parked in an uninterruptible syscall
/// is not executing code we are about to rewrite).
const PARK_DEADLINE: Duration = Duration::from_millis(100);

static FROZEN: AtomicBool = AtomicBool::new(false);
static PARKED: AtomicUsize = AtomicUsize::new(0);
static HANDLER: Once = Once::new();

fn freeze_signal() -> libc::c_int {
    libc::SIGRTMIN() + 7
}

fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn signal_thread(tid: libc::pid_t, signal: libc::c_int) -> bool {
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signal) };
    rc == 0
}

// Async-signal-safe: atomics and nanosleep only.
extern "C" fn park_handler(_sig: libc::c_int) {
    PARKED.fetch_add(1, Ordering::AcqRel);
    let nap = libc::timespec {
        tv_sec: 0,
        tv_nsec: 100_000,
    };
    while FROZEN.load(Ordering::Acquire) {
        unsafe {
            libc::nanosleep(&nap, core::ptr::null_mut());
        }
    }
    PARKED.fetch_sub(1, Ordering::AcqRel);
}

fn install_handler() {
    HANDLER.call_once(|| unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = park_handler as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(freeze_signal(), &action, core::ptr::null_mut()) != 0 {
            warn!("failed to install freeze signal handler");
        }
    });
}

/// Numeric entries of `/proc/self/task`, i.e. every live thread id.
pub fn all_threads() -> Vec<libc::pid_t> {
    let mut tids = Vec::new();
    let entries = match std::fs::read_dir("/proc/self/task") {
        Ok(entries) => entries,
        Err(_) => return tids,
    };
    for entry in entries.flatten() {
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<libc::pid_t>() {
            tids.push(tid);
        }
    }
    tids
}

/// Park every thread except the caller. A tid that vanished between
/// enumeration and signalling counts as suspended. Returns the number of
/// threads signalled.
pub fn suspend_all_other_threads() -> usize {
    install_handler();
    FROZEN.store(true, Ordering::Release);

    let me = current_tid();
    let mut signalled = 0;
    for tid in all_threads() {
        if tid != me && signal_thread(tid, freeze_signal()) {
            signalled += 1;
        }
    }

    // Best effort: wait for the handlers to report in, but do not hang on
    // threads that are blocked in the kernel.
    let deadline = Instant::now() + PARK_DEADLINE;
    while PARKED.load(Ordering::Acquire) < signalled && Instant::now() < deadline {
        std::thread::yield_now();
    }
    signalled
}

pub fn resume_all_other_threads() {
    FROZEN.store(false, Ordering::Release);
}

fn freeze_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// RAII stop-the-world window. Windows are serialized process-wide; the
/// frozen span must stay short: freeze, patch, flush, drop.
pub struct FreezeGuard(std::sync::MutexGuard<'static, ()>);

impl FreezeGuard {
    pub fn freeze() -> FreezeGuard {
        let guard = freeze_lock().lock().unwrap_or_else(|e| e.into_inner());
        debug!("freezing sibling threads");
        let _ = suspend_all_other_threads();
        FreezeGuard(guard)
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        resume_all_other_threads();
        debug!("resumed sibling threads");
    }
}
