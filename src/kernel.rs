//! # Kernel
//!
//! The kernel singleton and the public API threads and drivers call.
//!
//! The scheduler and the heap live together in one global behind a
//! `critical_section::Mutex`; every function here is a single critical
//! section. Interrupt handlers reach the same state through [`on_tick`] and
//! [`switch_context`].
//!
//! ## Startup Sequence
//!
//! ```text
//! reset handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init(regions)  ← heap regions, idle thread
//!         ├─► kernel::spawn(...)     ← application threads (×N)
//!         └─► kernel::start(core)    ← no return
//!               ├─► SysTick + exception priorities
//!               └─► first thread via arch::cortex_m7::start_first_thread()
//! ```
//!
//! The exit cleanup hook runs while the kernel is borrowed: it gets the
//! heap directly and must not call back into this module.

use core::cell::RefCell;
use core::fmt;
use core::ptr::NonNull;

use critical_section::Mutex;

use crate::arch::{self, ActivePort};
use crate::config::{IDLE_STACK_WORDS, THREAD_STACK_REGION};
use crate::error::{KernelError, KernelResult};
use crate::memory::{Heap, RegionConfig, RegionId};
use crate::scheduler::{BlockingQueue, ExitCleanupHook, Scheduler, SchedulerStatus, ThreadStats};
use crate::thread::{Priority, ThreadEntry, ThreadHandle};

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

/// Everything the kernel owns.
pub struct Kernel {
    pub scheduler: Scheduler<ActivePort>,
    pub heap: Heap,
}

impl Kernel {
    const fn new() -> Self {
        Self {
            scheduler: Scheduler::new(THREAD_STACK_REGION),
            heap: Heap::new(),
        }
    }
}

static KERNEL: Mutex<RefCell<Option<Kernel>>> = Mutex::new(RefCell::new(None));

/// Run `f` on the kernel inside a critical section.
///
/// # Panics
/// When re-entered from inside `f` (e.g. from the exit cleanup hook).
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> KernelResult<R> {
    critical_section::with(|cs| {
        let mut kernel = KERNEL.borrow_ref_mut(cs);
        kernel.as_mut().map(f).ok_or(KernelError::NotInitialized)
    })
}

fn logged<T>(operation: &str, result: KernelResult<T>) -> KernelResult<T> {
    if let Err(err) = &result {
        log::warn!("{}: {}", operation, err);
    }
    result
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the kernel: hand the regions to the allocator and spawn the
/// idle thread. Calling it again discards the previous kernel.
///
/// # Safety
/// Every region must be valid, writable memory that nothing else uses
/// while the kernel lives. Must not be called once threads are running.
pub unsafe fn init(regions: &[RegionConfig]) -> KernelResult<ThreadHandle> {
    let result = critical_section::with(|cs| {
        let mut slot = KERNEL.borrow_ref_mut(cs);
        let kernel = slot.insert(Kernel::new());
        for config in regions {
            // SAFETY: forwarded from the caller.
            unsafe { kernel.heap.configure(*config) };
        }
        let idle = kernel.scheduler.spawn(
            &mut kernel.heap,
            "idle",
            arch::idle_thread,
            0,
            Priority::Bulk,
            IDLE_STACK_WORDS,
        );
        if idle.is_err() {
            *slot = None;
        }
        idle
    });

    if result.is_ok() {
        log::info!("kernel: initialized with {} region(s)", regions.len());
    }
    logged("init", result)
}

/// Create a thread. It starts at `entry(arg)`; returning from `entry`
/// exits the thread.
pub fn spawn(
    name: &str,
    entry: ThreadEntry,
    arg: usize,
    priority: Priority,
    stack_words: usize,
) -> KernelResult<ThreadHandle> {
    let result = with_kernel(|k| {
        k.scheduler
            .spawn(&mut k.heap, name, entry, arg, priority, stack_words)
    })
    .and_then(|spawned| spawned);
    logged("spawn", result)
}

/// Start scheduling. **Does not return.**
///
/// # Panics
/// If `init()` has not run.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn start(mut core: cortex_m::Peripherals) -> ! {
    use crate::arch::cortex_m7;

    cortex_m::interrupt::disable();
    cortex_m7::configure(&mut core.SYST, &mut core.SCB);

    let first = match with_kernel(|k| k.scheduler.launch()) {
        Ok(context) => context,
        Err(err) => panic!("start: {}", err),
    };
    log::info!("kernel: starting");

    // SAFETY: `first` is a context built by `init_stack`; interrupts are
    // masked until the first thread runs.
    unsafe { cortex_m7::start_first_thread(first) }
}

// ---------------------------------------------------------------------------
// Calls from the running thread
// ---------------------------------------------------------------------------

/// Sleep for `ticks` slices. Returns once the thread has been woken and
/// scheduled again.
///
/// # Panics
/// Between [`suspend_scheduler`] and [`resume_scheduler`], and from the
/// idle thread. The same holds for [`reschedule`],
/// [`move_current_thread_to`] and [`exit_current`].
pub fn delay(ticks: u32) -> KernelResult<()> {
    logged("delay", with_kernel(|k| k.scheduler.delay_current(ticks)))
}

/// Give up the rest of the slice. A no-op before `init()`.
pub fn reschedule() {
    let _ = with_kernel(|k| k.scheduler.request_reschedule());
}

/// Block the current thread on `queue` until a driver wakes it.
pub fn move_current_thread_to(queue: BlockingQueue) -> KernelResult<()> {
    let result = with_kernel(|k| {
        k.scheduler.move_current_to(queue);
        k.scheduler.request_reschedule();
    });
    logged("move_current_thread_to", result)
}

/// Finish the current thread. The thread exit trampoline calls this when
/// an entry function returns.
pub fn exit_current() -> KernelResult<()> {
    logged("exit_current", with_kernel(|k| k.scheduler.exit_current()))
}

// ---------------------------------------------------------------------------
// Calls from drivers and collaborators
// ---------------------------------------------------------------------------

/// Wake every thread blocked on `queue`. Returns how many woke.
pub fn wake_queue(queue: BlockingQueue) -> KernelResult<usize> {
    logged("wake_queue", with_kernel(|k| k.scheduler.wake_queue(queue)))
}

/// Wake the longest-waiting thread on `queue`.
pub fn wake_one(queue: BlockingQueue) -> KernelResult<Option<ThreadHandle>> {
    logged("wake_one", with_kernel(|k| k.scheduler.wake_one(queue)))
}

/// Resume one suspended or blocked thread.
pub fn wake_thread(handle: ThreadHandle) -> KernelResult<bool> {
    let result = with_kernel(|k| k.scheduler.wake_thread(handle)).and_then(|woken| woken);
    logged("wake_thread", result)
}

pub fn set_exit_cleanup_hook(hook: ExitCleanupHook) -> KernelResult<()> {
    logged(
        "set_exit_cleanup_hook",
        with_kernel(|k| k.scheduler.set_exit_cleanup_hook(hook)),
    )
}

pub fn set_thread_id(handle: ThreadHandle, id: u32) -> KernelResult<()> {
    let result = with_kernel(|k| k.scheduler.set_thread_id(handle, id)).and_then(|set| set);
    logged("set_thread_id", result)
}

/// Stop scheduling decisions until the matching [`resume_scheduler`].
pub fn suspend_scheduler() -> KernelResult<()> {
    logged("suspend_scheduler", with_kernel(|k| k.scheduler.suspend()))
}

/// # Panics
/// Without a matching [`suspend_scheduler`].
pub fn resume_scheduler() -> KernelResult<()> {
    logged("resume_scheduler", with_kernel(|k| k.scheduler.resume()))
}

pub fn scheduler_status() -> KernelResult<SchedulerStatus> {
    with_kernel(|k| k.scheduler.status())
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Zeroed block of at least `size` bytes from `region`.
///
/// # Panics
/// On `size == 0`.
pub fn allocate(region: RegionId, size: usize) -> KernelResult<NonNull<u8>> {
    let result = with_kernel(|k| k.heap.allocate(region, size)).and_then(|block| block);
    logged("allocate", result)
}

/// Return a block to the region it came from.
///
/// # Safety
/// `ptr` must come from [`allocate`] and must not be used afterwards.
pub unsafe fn free(ptr: NonNull<u8>) -> KernelResult<()> {
    // SAFETY: forwarded from the caller.
    logged("free", with_kernel(|k| unsafe { k.heap.free(ptr) }))
}

/// Byte counts of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionUsage {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub used_percentage: u8,
}

pub fn region_usage(region: RegionId) -> KernelResult<RegionUsage> {
    let result = with_kernel(|k| {
        k.heap
            .region(region)
            .map(|r| RegionUsage {
                total: r.total_size(),
                used: r.used_size(),
                free: r.free_size(),
                used_percentage: r.used_percentage(),
            })
            .ok_or(KernelError::RegionNotConfigured(region))
    })
    .and_then(|usage| usage);
    logged("region_usage", result)
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

pub fn current_thread() -> KernelResult<Option<ThreadHandle>> {
    with_kernel(|k| k.scheduler.current())
}

/// Kernel time in microseconds.
pub fn tick_micros() -> KernelResult<u64> {
    with_kernel(|k| k.scheduler.tick_micros())
}

pub fn cpu_usage_permille() -> KernelResult<u32> {
    with_kernel(|k| k.scheduler.cpu_usage_permille())
}

pub fn thread_stats(handle: ThreadHandle) -> KernelResult<ThreadStats> {
    with_kernel(|k| k.scheduler.thread_stats(handle)).and_then(|stats| stats)
}

/// Render the runtime statistics table. Runs with interrupts masked, so
/// write into a buffer rather than straight to a slow device.
pub fn write_runtime_statistics<W: fmt::Write>(out: &mut W) -> KernelResult<fmt::Result> {
    with_kernel(|k| k.scheduler.write_statistics(&k.heap, out))
}

// ---------------------------------------------------------------------------
// Port entry points
// ---------------------------------------------------------------------------

/// Tick interrupt body.
pub fn on_tick() {
    let _ = with_kernel(|k| k.scheduler.tick(&mut k.heap));
}

/// Context switch body: store the outgoing context, return the incoming.
pub fn switch_context(saved: usize) -> usize {
    with_kernel(|k| k.scheduler.switch_context(&mut k.heap, saved)).unwrap_or(saved)
}

/// Pick the first thread and return its context. `start` does this on the
/// target; hosted callers use it to drive the kernel by hand.
pub fn launch() -> KernelResult<usize> {
    with_kernel(|k| k.scheduler.launch())
}
