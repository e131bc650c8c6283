//! # Host Port
//!
//! Stand-in port for hosted builds. There is no timer and no context
//! switch: the requests are counted so callers can check the scheduler
//! asked for them, and the slice position is whatever was last set.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::Port;

static SLICE_ELAPSED: AtomicU64 = AtomicU64::new(0);
static RESCHEDULE_REQUESTS: AtomicUsize = AtomicUsize::new(0);
static SWITCH_REQUESTS: AtomicUsize = AtomicUsize::new(0);
static SLICE_RESTARTS: AtomicUsize = AtomicUsize::new(0);

pub struct HostPort;

impl HostPort {
    /// Pretend the running slice is `micros` in.
    pub fn set_slice_elapsed(micros: u64) {
        SLICE_ELAPSED.store(micros, Ordering::Relaxed);
    }

    pub fn reschedule_requests() -> usize {
        RESCHEDULE_REQUESTS.load(Ordering::Relaxed)
    }

    pub fn switch_requests() -> usize {
        SWITCH_REQUESTS.load(Ordering::Relaxed)
    }

    pub fn slice_restarts() -> usize {
        SLICE_RESTARTS.load(Ordering::Relaxed)
    }
}

impl Port for HostPort {
    fn slice_elapsed_micros() -> u64 {
        SLICE_ELAPSED.load(Ordering::Relaxed)
    }

    fn restart_slice() {
        SLICE_ELAPSED.store(0, Ordering::Relaxed);
        SLICE_RESTARTS.fetch_add(1, Ordering::Relaxed);
    }

    fn request_immediate_reschedule() {
        RESCHEDULE_REQUESTS.fetch_add(1, Ordering::Relaxed);
    }

    fn request_context_switch() {
        SWITCH_REQUESTS.fetch_add(1, Ordering::Relaxed);
    }

    fn publish_memory() {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    fn thread_exit_address() -> usize {
        host_thread_exit as usize
    }
}

/// Body of the idle thread. Host builds never run it.
pub extern "C" fn idle_thread(_: usize) {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn host_thread_exit() -> ! {
    panic!("thread returned on a host build");
}
