//! # Scheduler
//!
//! Round-robin scheduling within four priority classes, a wake-time
//! ordered delay queue, blocking-condition queues and runtime statistics.
//!
//! ## Scheduling Algorithm
//!
//! At each SysTick interrupt (`tick()`):
//! 1. **Charge time**: a full slice, or only the elapsed part of it when the
//!    running thread gave the CPU up early (`request_reschedule`)
//! 2. **Roll statistics** once per `STATISTICS_WINDOW_MICROS`
//! 3. **Place the outgoing thread**: the queue it asked for, retirement if
//!    it exited, else the head of its run queue
//! 4. **Wake delayed threads** whose wake tick has passed
//! 5. **Select next thread**: the tail of the highest non-empty run queue,
//!    else the idle thread
//!
//! `tick()` only decides. The register swap happens later in
//! `switch_context()`, called from the lower-priority PendSV handler. A
//! thread retired by `tick()` keeps its stack until that switch: PendSV
//! still pushes r4–r11 onto it.
//!
//! Delay, move, exit and reschedule must not be called while the scheduler
//! is suspended; no decision would be taken and the call would return
//! without blocking.
//!
//! ## Round Robin
//!
//! ```text
//!   insert_first              remove_last
//!   ──────────► [C] ⇄ [B] ⇄ [A] ──────────► next
//! ```
//!
//! A thread that has just run re-enters at the head, so every runnable
//! thread of a class is served once before any is served twice.

use core::fmt;
use core::marker::PhantomData;

use crate::arch::{init_stack, Port, INITIAL_FRAME_WORDS};
use crate::config::{LOADED_PROGRAM_THREAD_ID, MAX_THREADS, STATISTICS_WINDOW_MICROS, TICK_MICROS};
use crate::error::{KernelError, KernelResult};
use crate::list::{List, Node};
use crate::memory::{Heap, RegionId};
use crate::thread::{
    Priority, Tcb, ThreadEntry, ThreadHandle, ThreadName, ThreadState, WORD_SIZE,
};

/// Smallest stack `spawn` accepts, in words.
pub const MIN_STACK_WORDS: usize = INITIAL_FRAME_WORDS + 2;

/// Every queue a thread can sit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    /// The run queue of the thread's own priority class.
    Run,
    /// Delay queue, ordered by wake tick. Entered through `delay_current`.
    Delay,
    /// Threads waiting for serial input.
    Serial,
    /// Parked until explicitly woken.
    Suspended,
}

/// Queues a thread blocks on until someone wakes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingQueue {
    /// Threads waiting for serial input.
    Serial,
    /// Parked until explicitly woken.
    Suspended,
}

impl From<BlockingQueue> for QueueId {
    fn from(queue: BlockingQueue) -> Self {
        match queue {
            BlockingQueue::Serial => QueueId::Serial,
            BlockingQueue::Suspended => QueueId::Suspended,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Running,
    Suspended,
}

/// Deferred cleanup run when a thread tagged `LOADED_PROGRAM_THREAD_ID`
/// retires, before its stack is released.
pub type ExitCleanupHook = fn(&mut Heap);

/// Snapshot of one thread for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStats {
    pub handle: ThreadHandle,
    pub id: u32,
    pub name: ThreadName,
    pub priority: Priority,
    pub state: ThreadState,
    pub context_switches: u64,
    pub runtime_micros: u64,
    pub cpu_permille: u32,
    pub stack_size: usize,
    pub stack_in_use: usize,
    pub stack_high_water: usize,
}

const NO_THREAD: Option<Tcb> = None;

/// The scheduler state. One instance lives in the kernel singleton; tests
/// build their own.
pub struct Scheduler<P: Port> {
    threads: [Option<Tcb>; MAX_THREADS],
    generations: [u32; MAX_THREADS],

    /// Run, delay, blocking and suspended queue membership.
    queue_nodes: [Node; MAX_THREADS],
    /// Registry membership.
    registry_nodes: [Node; MAX_THREADS],

    run_queues: [List; Priority::COUNT],
    delay_queue: List,
    serial_queue: List,
    suspended_list: List,
    /// Every thread but idle, in spawn order.
    registry: List,

    current: Option<usize>,
    next: Option<usize>,
    idle: Option<usize>,

    suspend_depth: u32,

    /// Microseconds since launch.
    tick: u64,
    /// Microseconds into the current statistics window.
    window_elapsed: u64,
    /// Earliest wake tick in the delay queue, `u64::MAX` when empty.
    tick_to_wake: u64,

    reschedule_pending: bool,
    reschedule_credit: u64,

    next_id: u32,
    stack_region: RegionId,
    exit_hook: Option<ExitCleanupHook>,
    /// Thread retired by the last tick. Its stack is freed at the switch.
    retiring: Option<Tcb>,

    _port: PhantomData<fn() -> P>,
}

impl<P: Port> Scheduler<P> {
    /// Empty scheduler drawing thread stacks from `stack_region`.
    pub const fn new(stack_region: RegionId) -> Self {
        Self {
            threads: [NO_THREAD; MAX_THREADS],
            generations: [0; MAX_THREADS],
            queue_nodes: [Node::new(); MAX_THREADS],
            registry_nodes: [Node::new(); MAX_THREADS],
            run_queues: [List::new(); Priority::COUNT],
            delay_queue: List::new(),
            serial_queue: List::new(),
            suspended_list: List::new(),
            registry: List::new(),
            current: None,
            next: None,
            idle: None,
            suspend_depth: 0,
            tick: 0,
            window_elapsed: 0,
            tick_to_wake: u64::MAX,
            reschedule_pending: false,
            reschedule_credit: 0,
            next_id: 0,
            stack_region,
            exit_hook: None,
            retiring: None,
            _port: PhantomData,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self) -> SchedulerStatus {
        if self.suspend_depth == 0 {
            SchedulerStatus::Running
        } else {
            SchedulerStatus::Suspended
        }
    }

    /// Kernel time in microseconds.
    pub fn tick_micros(&self) -> u64 {
        self.tick
    }

    /// Earliest pending wake tick, `u64::MAX` when nobody sleeps.
    pub fn tick_to_wake(&self) -> u64 {
        self.tick_to_wake
    }

    pub fn current(&self) -> Option<ThreadHandle> {
        self.current.map(|slot| self.handle(slot))
    }

    /// Thread chosen by the last tick and not yet switched to.
    pub fn next(&self) -> Option<ThreadHandle> {
        self.next.map(|slot| self.handle(slot))
    }

    pub fn idle(&self) -> Option<ThreadHandle> {
        self.idle.map(|slot| self.handle(slot))
    }

    /// Live threads, idle included.
    pub fn thread_count(&self) -> usize {
        self.threads.iter().flatten().count()
    }

    /// Number of threads in a queue. `Run` counts every priority class.
    pub fn queue_len(&self, queue: QueueId) -> usize {
        match queue {
            QueueId::Run => self.run_queues.iter().map(List::len).sum(),
            QueueId::Delay => self.delay_queue.len(),
            QueueId::Serial => self.serial_queue.len(),
            QueueId::Suspended => self.suspended_list.len(),
        }
    }

    pub fn tcb(&self, handle: ThreadHandle) -> KernelResult<&Tcb> {
        let slot = self.resolve(handle)?;
        self.threads[slot].as_ref().ok_or(KernelError::StaleHandle)
    }

    /// Idle thread first, then the registry in spawn order.
    pub fn threads(&self) -> impl Iterator<Item = (ThreadHandle, &Tcb)> + '_ {
        self.idle
            .into_iter()
            .chain(self.registry.iter(&self.registry_nodes))
            .filter_map(move |slot| {
                self.threads[slot]
                    .as_ref()
                    .map(|tcb| (self.handle(slot), tcb))
            })
    }

    fn handle(&self, slot: usize) -> ThreadHandle {
        ThreadHandle {
            slot,
            generation: self.generations[slot],
        }
    }

    fn resolve(&self, handle: ThreadHandle) -> KernelResult<usize> {
        match self.threads.get(handle.slot) {
            Some(Some(tcb)) if tcb.generation == handle.generation => Ok(handle.slot),
            _ => Err(KernelError::StaleHandle),
        }
    }

    fn tcb_mut(&mut self, slot: usize) -> &mut Tcb {
        self.threads[slot]
            .as_mut()
            .unwrap_or_else(|| panic!("thread slot {} is empty", slot))
    }

    /// Blocking calls only take effect through a scheduling decision.
    fn assert_not_suspended(&self, operation: &str) {
        assert!(
            self.suspend_depth == 0,
            "{}: called while the scheduler is suspended",
            operation
        );
    }

    /// Current thread's slot; the idle thread never blocks or exits.
    fn current_blockable(&self, operation: &str) -> usize {
        match self.current {
            Some(slot) if Some(slot) != self.idle => slot,
            Some(_) => panic!("{}: the idle thread cannot block", operation),
            None => panic!("{}: no current thread", operation),
        }
    }

    // -----------------------------------------------------------------------
    // Suspension
    // -----------------------------------------------------------------------

    /// Stop scheduling decisions. Calls nest.
    pub fn suspend(&mut self) {
        self.suspend_depth += 1;
    }

    /// Undo one `suspend`.
    ///
    /// # Panics
    /// When not suspended.
    pub fn resume(&mut self) {
        assert!(self.suspend_depth > 0, "resume_scheduler without suspend_scheduler");
        self.suspend_depth -= 1;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a thread. The first thread ever created becomes the idle
    /// thread and the current thread; it is never queued or retired. Every
    /// later thread enters the head of its run queue.
    ///
    /// # Panics
    /// If `stack_words` is below [`MIN_STACK_WORDS`].
    pub fn spawn(
        &mut self,
        heap: &mut Heap,
        name: &str,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        stack_words: usize,
    ) -> KernelResult<ThreadHandle> {
        assert!(
            stack_words >= MIN_STACK_WORDS,
            "{}: stack of {} words is too small",
            name,
            stack_words
        );

        self.suspend();
        let result = self.spawn_suspended(heap, name, entry, arg, priority, stack_words);
        self.resume();
        result
    }

    fn spawn_suspended(
        &mut self,
        heap: &mut Heap,
        name: &str,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        stack_words: usize,
    ) -> KernelResult<ThreadHandle> {
        let slot = self
            .threads
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::ThreadLimit)?;

        let stack_size = stack_words.saturating_mul(WORD_SIZE);
        let stack = heap.allocate(self.stack_region, stack_size)?;

        let generation = self.generations[slot].wrapping_add(1);
        self.generations[slot] = generation;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut tcb = Tcb::new(id, generation, name, priority, stack, stack_size);
        tcb.paint_stack();
        // SAFETY: the thread has never run; nothing else uses its stack.
        let words = unsafe { tcb.stack_words() };
        tcb.context = init_stack(words, entry as usize, arg, P::thread_exit_address());
        self.threads[slot] = Some(tcb);

        if self.idle.is_none() {
            self.idle = Some(slot);
            self.current = Some(slot);
        } else {
            self.run_queues[priority.index()].insert_first(&mut self.queue_nodes, slot);
            self.registry.insert_last(&mut self.registry_nodes, slot);
        }

        P::publish_memory();
        log::debug!(
            "spawn: {} (id {}, {:?}, {} bytes of stack)",
            name,
            id,
            priority,
            stack_size
        );
        Ok(self.handle(slot))
    }

    /// Pick the first thread to run. Called once when the kernel starts;
    /// returns the context to load.
    pub fn launch(&mut self) -> usize {
        self.tick = 0;
        self.window_elapsed = 0;
        self.tick_to_wake = u64::MAX;
        self.next = None;

        let first = self.pick_next();
        self.current = Some(first);
        self.tcb_mut(first).context
    }

    /// Re-tag a thread, e.g. with `LOADED_PROGRAM_THREAD_ID`.
    pub fn set_thread_id(&mut self, handle: ThreadHandle, id: u32) -> KernelResult<()> {
        let slot = self.resolve(handle)?;
        self.tcb_mut(slot).id = id;
        Ok(())
    }

    pub fn set_exit_cleanup_hook(&mut self, hook: ExitCleanupHook) {
        self.exit_hook = Some(hook);
    }

    // -----------------------------------------------------------------------
    // Calls made by the running thread
    // -----------------------------------------------------------------------

    /// Give up the rest of the slice. Only the part that was used is
    /// charged, and the next thread starts on a fresh slice.
    ///
    /// # Panics
    /// While the scheduler is suspended.
    pub fn request_reschedule(&mut self) {
        self.assert_not_suspended("reschedule");
        self.reschedule_credit = P::slice_elapsed_micros().min(TICK_MICROS);
        self.reschedule_pending = true;
        P::restart_slice();
        P::request_immediate_reschedule();
    }

    /// Sleep the current thread for `ticks` slices.
    ///
    /// # Panics
    /// While the scheduler is suspended, and from the idle thread.
    pub fn delay_current(&mut self, ticks: u32) {
        self.assert_not_suspended("delay");
        let slot = self.current_blockable("delay");
        let wake = self.tick + u64::from(ticks) * TICK_MICROS;
        let tcb = self.tcb_mut(slot);
        tcb.wake_tick = wake;
        tcb.pending_queue = Some(QueueId::Delay);

        self.request_reschedule();
    }

    /// Have the next scheduling pass put the current thread on `queue`.
    /// The caller reschedules when it is ready to block.
    ///
    /// # Panics
    /// While the scheduler is suspended, and from the idle thread.
    pub fn move_current_to(&mut self, queue: BlockingQueue) {
        self.assert_not_suspended("move_current_thread_to");
        let slot = self.current_blockable("move_current_thread_to");
        self.tcb_mut(slot).pending_queue = Some(queue.into());
    }

    /// Mark the current thread finished and give up the CPU. The next tick
    /// retires it.
    ///
    /// # Panics
    /// While the scheduler is suspended, and from the idle thread.
    pub fn exit_current(&mut self) {
        self.assert_not_suspended("exit");
        let slot = self.current_blockable("exit");
        let tcb = self.tcb_mut(slot);
        tcb.state = ThreadState::ExitPending;
        tcb.pending_queue = None;
        self.request_reschedule();
    }

    // -----------------------------------------------------------------------
    // Waking blocked threads
    // -----------------------------------------------------------------------

    /// Move the longest-waiting thread of a blocking queue back to its run
    /// queue.
    pub fn wake_one(&mut self, queue: BlockingQueue) -> Option<ThreadHandle> {
        let list = match queue {
            BlockingQueue::Serial => &mut self.serial_queue,
            BlockingQueue::Suspended => &mut self.suspended_list,
        };
        let slot = list.remove_last(&mut self.queue_nodes)?;
        self.make_runnable(slot);
        Some(self.handle(slot))
    }

    /// Wake every thread of a blocking queue. Returns how many woke.
    pub fn wake_queue(&mut self, queue: BlockingQueue) -> usize {
        let mut woken = 0;
        while self.wake_one(queue).is_some() {
            woken += 1;
        }
        woken
    }

    /// Wake one specific blocked or suspended thread. Returns `false` if it
    /// was not waiting on a blocking queue.
    pub fn wake_thread(&mut self, handle: ThreadHandle) -> KernelResult<bool> {
        let slot = self.resolve(handle)?;
        let removed = self.serial_queue.remove(&mut self.queue_nodes, slot)
            || self.suspended_list.remove(&mut self.queue_nodes, slot);
        if removed {
            self.make_runnable(slot);
        }
        Ok(removed)
    }

    fn make_runnable(&mut self, slot: usize) {
        let tcb = self.tcb_mut(slot);
        tcb.state = ThreadState::Running;
        let priority = tcb.priority;
        self.run_queues[priority.index()].insert_first(&mut self.queue_nodes, slot);
    }

    // -----------------------------------------------------------------------
    // Tick and context switch
    // -----------------------------------------------------------------------

    /// SysTick entry. Charges time, rolls statistics and, unless the
    /// scheduler is suspended or the last decision is still waiting for its
    /// context switch, decides the next thread and pends the switch.
    pub fn tick(&mut self, heap: &mut Heap) {
        let elapsed = if self.reschedule_pending {
            self.reschedule_pending = false;
            self.reschedule_credit
        } else {
            TICK_MICROS
        };

        self.tick += elapsed;
        self.window_elapsed += elapsed;
        if let Some(slot) = self.current {
            if let Some(tcb) = self.threads[slot].as_mut() {
                tcb.time.charge(elapsed);
            }
        }

        if self.window_elapsed >= STATISTICS_WINDOW_MICROS {
            self.roll_statistics_window();
            self.window_elapsed = 0;
        }

        if self.suspend_depth > 0 || self.next.is_some() || self.idle.is_none() {
            return;
        }

        self.place_current(heap);

        if self.tick_to_wake <= self.tick {
            self.wake_expired();
        }

        let next = self.pick_next();
        self.next = Some(next);
        P::request_context_switch();
    }

    /// PendSV entry. Stores the outgoing context and returns the incoming
    /// one. The outgoing registers are already pushed, so a stack retired
    /// by the last tick is released here.
    pub fn switch_context(&mut self, heap: &mut Heap, saved: usize) -> usize {
        if let Some(slot) = self.current {
            if let Some(tcb) = self.threads[slot].as_mut() {
                tcb.context = saved;
            }
        }
        if let Some(retired) = self.retiring.take() {
            // SAFETY: the stack came from `heap.allocate` in `spawn`, its
            // thread is retired and nothing is pushed onto it any more.
            unsafe { heap.free(retired.stack) };
        }
        if let Some(next) = self.next.take() {
            self.current = Some(next);
        }
        self.current
            .and_then(|slot| self.threads[slot].as_ref())
            .map_or(saved, |tcb| tcb.context)
    }

    /// Policy step for the thread that just ran.
    fn place_current(&mut self, heap: &mut Heap) {
        let Some(slot) = self.current else {
            return;
        };
        if Some(slot) == self.idle {
            return;
        }

        let tcb = self.tcb_mut(slot);
        let pending = tcb.pending_queue.take();
        let state = tcb.state;
        let priority = tcb.priority;
        let wake_tick = tcb.wake_tick;

        match pending {
            Some(QueueId::Delay) => {
                self.tcb_mut(slot).state = ThreadState::Delayed;
                self.delay_queue
                    .insert_sorted(&mut self.queue_nodes, slot, wake_tick);
                self.refresh_tick_to_wake();
            }
            Some(QueueId::Serial) => {
                self.tcb_mut(slot).state = ThreadState::Blocked;
                self.serial_queue.insert_first(&mut self.queue_nodes, slot);
            }
            Some(QueueId::Suspended) => {
                self.tcb_mut(slot).state = ThreadState::Suspended;
                self.suspended_list.insert_first(&mut self.queue_nodes, slot);
            }
            Some(QueueId::Run) | None if state != ThreadState::ExitPending => {
                self.run_queues[priority.index()].insert_first(&mut self.queue_nodes, slot);
            }
            Some(QueueId::Run) | None => self.retire(heap, slot),
        }
    }

    /// Unlink an exited thread and release its slot. Runs inside the tick
    /// handler; the stack is handed to `switch_context` to free.
    fn retire(&mut self, heap: &mut Heap, slot: usize) {
        assert!(
            !self.queue_nodes[slot].is_linked(),
            "retiring thread {} is still queued",
            slot
        );
        self.registry.remove(&mut self.registry_nodes, slot);

        let Some(tcb) = self.threads[slot].take() else {
            panic!("retiring empty thread slot {}", slot);
        };
        if self.current == Some(slot) {
            self.current = None;
        }

        if tcb.id == LOADED_PROGRAM_THREAD_ID {
            if let Some(hook) = self.exit_hook {
                hook(heap);
            }
        }

        if tcb.stack_overflowed() {
            log::warn!("thread {} overflowed its stack", tcb.name);
        }

        log::debug!("exit: {} (id {})", tcb.name, tcb.id);
        debug_assert!(self.retiring.is_none(), "two retirements before one switch");
        self.retiring = Some(tcb);
    }

    /// Move every delayed thread whose wake tick has passed to its run
    /// queue. They are placed at the tail so they run next, earliest wake
    /// first.
    fn wake_expired(&mut self) {
        let mut woken: heapless::Vec<usize, MAX_THREADS> = heapless::Vec::new();

        while let Some(first) = self.delay_queue.first() {
            if self.queue_nodes[first].key() > self.tick || woken.is_full() {
                break;
            }
            self.delay_queue.remove_first(&mut self.queue_nodes);
            // Cannot fail: checked `is_full` above
            let _ = woken.push(first);
        }

        for &slot in woken.iter().rev() {
            let tcb = self.tcb_mut(slot);
            tcb.state = ThreadState::Running;
            let priority = tcb.priority;
            self.run_queues[priority.index()].insert_last(&mut self.queue_nodes, slot);
        }

        self.refresh_tick_to_wake();
    }

    fn refresh_tick_to_wake(&mut self) {
        self.tick_to_wake = self
            .delay_queue
            .first()
            .map_or(u64::MAX, |slot| self.queue_nodes[slot].key());
    }

    /// Tail of the highest-priority non-empty run queue, else idle.
    fn pick_next(&mut self) -> usize {
        let queue_nodes = &mut self.queue_nodes;
        let picked = self
            .run_queues
            .iter_mut()
            .find_map(|queue| queue.remove_last(queue_nodes))
            .or(self.idle)
            .unwrap_or_else(|| panic!("no runnable thread and no idle thread"));

        self.tcb_mut(picked).context_switches += 1;
        picked
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    fn roll_statistics_window(&mut self) {
        for tcb in self.threads.iter_mut().flatten() {
            tcb.time.roll_window();
        }
    }

    pub fn thread_stats(&self, handle: ThreadHandle) -> KernelResult<ThreadStats> {
        let tcb = self.tcb(handle)?;
        Ok(ThreadStats {
            handle,
            id: tcb.id,
            name: tcb.name.clone(),
            priority: tcb.priority,
            state: tcb.state,
            context_switches: tcb.context_switches,
            runtime_micros: tcb.time.runtime,
            cpu_permille: tcb.time.cpu_permille(),
            stack_size: tcb.stack_size,
            stack_in_use: tcb.stack_in_use(),
            stack_high_water: tcb.stack_high_water(),
        })
    }

    /// CPU load over the last window, in tenths of a percent: everything
    /// the idle thread did not get.
    pub fn cpu_usage_permille(&self) -> u32 {
        let idle = self
            .idle
            .and_then(|slot| self.threads[slot].as_ref())
            .map_or(0, |tcb| tcb.time.cpu_permille());
        1000 - idle.min(1000)
    }

    /// Runtime statistics table: CPU load, region usage, then one line per
    /// thread with context switches, stack high-water mark and CPU share.
    pub fn write_statistics<W: fmt::Write>(&self, heap: &Heap, out: &mut W) -> fmt::Result {
        let cpu = self.cpu_usage_permille();
        writeln!(out, "CPU {:>3}.{}%", cpu / 10, cpu % 10)?;

        for region in heap.regions() {
            writeln!(
                out,
                "{:<16} {:>3}% of {} bytes",
                region.name(),
                region.used_percentage(),
                region.total_size()
            )?;
        }

        writeln!(out, "{:<24} {:>10} {:>7} {:>7}", "thread", "switches", "stack", "cpu")?;
        for (_, tcb) in self.threads() {
            let stack = (tcb.stack_high_water() * 1000 / tcb.stack_size.max(1)) as u32;
            let cpu = tcb.time.cpu_permille();
            writeln!(
                out,
                "{:<24} {:>10} {:>4}.{}% {:>4}.{}%",
                tcb.name.as_str(),
                tcb.context_switches,
                stack / 10,
                stack % 10,
                cpu / 10,
                cpu % 10
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionConfig;
    use core::cell::Cell;
    use std::boxed::Box;
    use std::string::String;
    use std::vec::Vec;

    std::thread_local! {
        static ELAPSED: Cell<u64> = const { Cell::new(0) };
        static SWITCHES: Cell<usize> = const { Cell::new(0) };
        static IMMEDIATE: Cell<usize> = const { Cell::new(0) };
    }

    struct TestPort;

    impl Port for TestPort {
        fn slice_elapsed_micros() -> u64 {
            ELAPSED.with(Cell::get)
        }
        fn restart_slice() {
            ELAPSED.with(|e| e.set(0));
        }
        fn request_immediate_reschedule() {
            IMMEDIATE.with(|c| c.set(c.get() + 1));
        }
        fn request_context_switch() {
            SWITCHES.with(|c| c.set(c.get() + 1));
        }
        fn publish_memory() {}
        fn thread_exit_address() -> usize {
            0x0040_1001
        }
    }

    #[repr(C, align(16))]
    struct Arena([u8; 32 * 1024]);

    struct Fixture {
        _arena: Box<Arena>,
        heap: Heap,
        sched: Scheduler<TestPort>,
    }

    const STACK: usize = 64;

    extern "C" fn worker(_: usize) {}

    impl Fixture {
        fn new() -> Self {
            let mut arena = Box::new(Arena([0; 32 * 1024]));
            let start = arena.0.as_mut_ptr() as usize;
            let mut heap = Heap::new();
            unsafe {
                heap.configure(RegionConfig::new(
                    RegionId::Sram,
                    "SRAM",
                    start,
                    start + arena.0.len(),
                ))
            };
            let mut sched = Scheduler::new(RegionId::Sram);
            sched
                .spawn(&mut heap, "idle", worker, 0, Priority::Bulk, STACK)
                .unwrap();
            ELAPSED.with(|e| e.set(0));
            Self {
                _arena: arena,
                heap,
                sched,
            }
        }

        fn spawn(&mut self, name: &str, priority: Priority) -> ThreadHandle {
            self.sched
                .spawn(&mut self.heap, name, worker, 0, priority, STACK)
                .unwrap()
        }

        /// One SysTick followed by the PendSV switch.
        fn run_tick(&mut self) -> ThreadHandle {
            self.sched.tick(&mut self.heap);
            let saved = self
                .sched
                .current()
                .and_then(|h| self.sched.tcb(h).ok())
                .map_or(0, |tcb| tcb.context);
            self.sched.switch_context(&mut self.heap, saved);
            self.sched.current().unwrap()
        }

        fn name_of(&self, handle: ThreadHandle) -> String {
            String::from(self.sched.tcb(handle).unwrap().name.as_str())
        }
    }

    #[test]
    fn test_first_thread_becomes_idle() {
        let f = Fixture::new();
        let idle = f.sched.idle().unwrap();
        assert_eq!(f.sched.current(), Some(idle));
        assert_eq!(f.sched.queue_len(QueueId::Run), 0);
        assert_eq!(f.sched.threads().count(), 1);
    }

    #[test]
    fn test_three_threads_each_run_once_in_three_ticks() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        let b = f.spawn("b", Priority::Normal);
        let c = f.spawn("c", Priority::Normal);

        let picks: Vec<_> = (0..3).map(|_| f.run_tick()).collect();
        assert_eq!(picks, [a, b, c]);

        let next_round: Vec<_> = (0..3).map(|_| f.run_tick()).collect();
        assert_eq!(next_round, [a, b, c]);
    }

    #[test]
    fn test_round_robin_serves_everyone_once_per_round() {
        let mut f = Fixture::new();
        let threads: Vec<_> = (0..5)
            .map(|i| f.spawn(["t0", "t1", "t2", "t3", "t4"][i], Priority::Normal))
            .collect();

        for _round in 0..4 {
            let mut seen: Vec<_> = (0..threads.len()).map(|_| f.run_tick()).collect();
            seen.sort_by_key(|h| h.slot());
            let mut expected = threads.clone();
            expected.sort_by_key(|h| h.slot());
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_launch_picks_oldest_thread() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        let _b = f.spawn("b", Priority::Normal);

        let context = f.sched.launch();
        assert_eq!(f.sched.current(), Some(a));
        assert_eq!(context, f.sched.tcb(a).unwrap().context);
        assert_eq!(f.sched.tcb(a).unwrap().context_switches, 1);
    }

    #[test]
    fn test_launch_without_threads_runs_idle() {
        let mut f = Fixture::new();
        f.sched.launch();
        assert_eq!(f.sched.current(), f.sched.idle());
        assert_eq!(f.run_tick(), f.sched.idle().unwrap());
    }

    #[test]
    fn test_delay_wakes_in_wake_order_with_stable_ties() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        let b = f.spawn("b", Priority::Normal);
        let c = f.spawn("c", Priority::Normal);

        assert_eq!(f.run_tick(), a);
        f.sched.delay_current(5);
        assert_eq!(f.run_tick(), b);
        f.sched.delay_current(3);
        assert_eq!(f.run_tick(), c);
        // Same tick as b: ties go by call order
        f.sched.delay_current(3);
        assert_eq!(f.run_tick(), f.sched.idle().unwrap());

        assert_eq!(f.sched.queue_len(QueueId::Delay), 3);
        assert_eq!(f.sched.tick_to_wake(), 3 * TICK_MICROS + TICK_MICROS);

        let mut order = Vec::new();
        for _ in 0..10 {
            let current = f.run_tick();
            if Some(current) != f.sched.idle() && !order.contains(&current) {
                order.push(current);
            }
        }
        assert_eq!(order, [b, c, a]);
        assert_eq!(f.sched.queue_len(QueueId::Delay), 0);
        for handle in [a, b, c] {
            assert_eq!(f.sched.tcb(handle).unwrap().state, ThreadState::Running);
        }
        assert_eq!(f.sched.tick_to_wake(), u64::MAX);
    }

    #[test]
    fn test_delay_charges_partial_slice() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        assert_eq!(f.run_tick(), a);
        let before = f.sched.tcb(a).unwrap().time.runtime;
        let now = f.sched.tick_micros();

        ELAPSED.with(|e| e.set(250));
        f.sched.delay_current(2);
        assert_eq!(f.sched.tcb(a).unwrap().wake_tick, now + 2 * TICK_MICROS);
        assert!(IMMEDIATE.with(Cell::get) > 0);
        assert_eq!(ELAPSED.with(Cell::get), 0);

        f.run_tick();
        assert_eq!(f.sched.tcb(a).unwrap().time.runtime, before + 250);
        assert_eq!(f.sched.tcb(a).unwrap().state, ThreadState::Delayed);
        assert_eq!(f.sched.tick_micros(), now + 250);

        // Next periodic tick charges a full slice again
        let idle = f.sched.idle().unwrap();
        let idle_before = f.sched.tcb(idle).unwrap().time.runtime;
        f.run_tick();
        assert_eq!(
            f.sched.tcb(idle).unwrap().time.runtime,
            idle_before + TICK_MICROS
        );
    }

    #[test]
    fn test_higher_priority_class_runs_first() {
        let mut f = Fixture::new();
        let bulk = f.spawn("bulk", Priority::Bulk);
        let normal = f.spawn("normal", Priority::Normal);
        let rt = f.spawn("rt", Priority::RealTime);

        assert_eq!(f.run_tick(), rt);
        assert_eq!(f.run_tick(), rt);

        f.sched.delay_current(2);
        assert_eq!(f.run_tick(), normal);
        f.sched.move_current_to(BlockingQueue::Suspended);
        f.sched.request_reschedule();
        assert_eq!(f.run_tick(), bulk);

        // rt wakes and preempts at the next decision
        let mut picks = Vec::new();
        for _ in 0..3 {
            picks.push(f.run_tick());
        }
        assert!(picks.contains(&rt));
        assert!(!picks.contains(&normal));
    }

    #[test]
    fn test_blocking_queue_and_wake() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        let b = f.spawn("b", Priority::Normal);

        assert_eq!(f.run_tick(), a);
        f.sched.move_current_to(BlockingQueue::Serial);
        f.sched.request_reschedule();
        assert_eq!(f.run_tick(), b);
        assert_eq!(f.sched.queue_len(QueueId::Serial), 1);
        assert_eq!(f.sched.thread_stats(a).unwrap().state, ThreadState::Blocked);

        for _ in 0..3 {
            assert_eq!(f.run_tick(), b);
        }

        assert_eq!(f.sched.wake_queue(BlockingQueue::Serial), 1);
        assert_eq!(f.sched.queue_len(QueueId::Serial), 0);
        assert_eq!(f.sched.tcb(a).unwrap().state, ThreadState::Running);
        assert_eq!(f.sched.wake_one(BlockingQueue::Serial), None);
        assert_eq!(f.run_tick(), a);
        assert_eq!(f.run_tick(), b);
    }

    #[test]
    fn test_suspended_thread_resumed_by_handle() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);

        assert_eq!(f.run_tick(), a);
        f.sched.move_current_to(BlockingQueue::Suspended);
        f.run_tick();
        assert_eq!(f.sched.tcb(a).unwrap().state, ThreadState::Suspended);
        assert_eq!(f.sched.current(), f.sched.idle());

        assert_eq!(f.sched.wake_thread(a), Ok(true));
        assert_eq!(f.sched.tcb(a).unwrap().state, ThreadState::Running);
        assert_eq!(f.sched.wake_thread(a), Ok(false));
        assert_eq!(f.run_tick(), a);
    }

    #[test]
    fn test_exit_frees_stack_and_invalidates_handle() {
        let mut f = Fixture::new();
        let free_before = f.heap.free_size(RegionId::Sram);
        let a = f.spawn("a", Priority::Normal);
        assert!(f.heap.free_size(RegionId::Sram) < free_before);

        assert_eq!(f.run_tick(), a);
        f.sched.exit_current();
        assert_eq!(f.sched.tcb(a).unwrap().state, ThreadState::ExitPending);

        assert_eq!(f.run_tick(), f.sched.idle().unwrap());
        assert_eq!(f.heap.free_size(RegionId::Sram), free_before);
        assert_eq!(f.sched.tcb(a).err(), Some(KernelError::StaleHandle));
        assert_eq!(f.sched.threads().count(), 1);

        // The slot is reused under a new generation
        let b = f.spawn("b", Priority::Normal);
        assert_eq!(b.slot(), a.slot());
        assert_ne!(a, b);
        assert!(f.sched.tcb(a).is_err());
    }

    #[test]
    fn test_retired_stack_held_until_switch() {
        let mut f = Fixture::new();
        let free_before = f.heap.free_size(RegionId::Sram);
        let a = f.spawn("a", Priority::Normal);
        let free_spawned = f.heap.free_size(RegionId::Sram);
        assert_eq!(f.run_tick(), a);

        let tcb = f.sched.tcb(a).unwrap();
        let stack_start = tcb.stack.as_ptr() as usize;
        let stack_end = stack_start + tcb.stack_size;

        f.sched.exit_current();
        f.sched.tick(&mut f.heap);
        assert!(f.sched.tcb(a).is_err());
        assert_eq!(f.heap.free_size(RegionId::Sram), free_spawned);

        // An interrupt between SysTick and PendSV allocates
        let block = f.heap.allocate(RegionId::Sram, 256).unwrap();
        let block_start = block.as_ptr() as usize;
        let block_end = block_start + 256;
        assert!(block_end <= stack_start || block_start >= stack_end);

        f.sched.switch_context(&mut f.heap, 0);
        assert_eq!(f.sched.current(), f.sched.idle());
        unsafe { f.heap.free(block) };
        assert_eq!(f.heap.free_size(RegionId::Sram), free_before);
    }

    static HOOK_CALLS: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

    fn count_hook(_heap: &mut Heap) {
        HOOK_CALLS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
    }

    #[test]
    fn test_cleanup_hook_runs_only_for_loaded_program() {
        let mut f = Fixture::new();
        f.sched.set_exit_cleanup_hook(count_hook);
        let plain = f.spawn("plain", Priority::Normal);
        let loaded = f.spawn("loaded", Priority::Normal);
        f.sched.set_thread_id(loaded, LOADED_PROGRAM_THREAD_ID).unwrap();

        let before = HOOK_CALLS.load(core::sync::atomic::Ordering::SeqCst);
        assert_eq!(f.run_tick(), plain);
        f.sched.exit_current();
        f.run_tick();
        assert_eq!(HOOK_CALLS.load(core::sync::atomic::Ordering::SeqCst), before);

        assert_eq!(f.sched.current(), Some(loaded));
        f.sched.exit_current();
        f.run_tick();
        assert_eq!(HOOK_CALLS.load(core::sync::atomic::Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_suspended_scheduler_makes_no_decision() {
        let mut f = Fixture::new();
        let _a = f.spawn("a", Priority::Normal);
        let idle = f.sched.idle().unwrap();

        f.sched.suspend();
        f.sched.suspend();
        assert_eq!(f.sched.status(), SchedulerStatus::Suspended);
        f.sched.tick(&mut f.heap);
        assert_eq!(f.sched.next(), None);
        assert_eq!(f.sched.tick_micros(), TICK_MICROS);
        assert_eq!(f.sched.tcb(idle).unwrap().time.runtime, TICK_MICROS);

        f.sched.resume();
        f.sched.tick(&mut f.heap);
        assert_eq!(f.sched.next(), None);

        f.sched.resume();
        assert_eq!(f.sched.status(), SchedulerStatus::Running);
        f.sched.tick(&mut f.heap);
        assert!(f.sched.next().is_some());
    }

    #[test]
    #[should_panic(expected = "without suspend")]
    fn test_unbalanced_resume_panics() {
        let mut f = Fixture::new();
        f.sched.resume();
    }

    #[test]
    fn test_unapplied_decision_is_not_overwritten() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        let _b = f.spawn("b", Priority::Normal);

        f.sched.tick(&mut f.heap);
        assert_eq!(f.sched.next(), Some(a));
        f.sched.tick(&mut f.heap);
        assert_eq!(f.sched.next(), Some(a));
        assert_eq!(f.sched.queue_len(QueueId::Run), 1);
    }

    #[test]
    fn test_switch_context_saves_and_loads() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        let idle = f.sched.idle().unwrap();
        let a_context = f.sched.tcb(a).unwrap().context;

        f.sched.tick(&mut f.heap);
        let loaded = f.sched.switch_context(&mut f.heap, 0x2040_1000);
        assert_eq!(loaded, a_context);
        assert_eq!(f.sched.tcb(idle).unwrap().context, 0x2040_1000);
        assert_eq!(f.sched.current(), Some(a));
    }

    #[test]
    fn test_statistics_window() {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        let b = f.spawn("b", Priority::Normal);
        let ticks = (STATISTICS_WINDOW_MICROS / TICK_MICROS) as usize;

        // The first tick charges idle; the window closes on tick `ticks`
        for _ in 0..ticks {
            f.run_tick();
        }

        let sa = f.sched.thread_stats(a).unwrap();
        let sb = f.sched.thread_stats(b).unwrap();
        let idle = f.sched.thread_stats(f.sched.idle().unwrap()).unwrap();
        assert_eq!(idle.cpu_permille, 1);
        assert_eq!(sa.cpu_permille + sb.cpu_permille + idle.cpu_permille, 1000);
        assert!(sa.cpu_permille.abs_diff(sb.cpu_permille) <= 1);
        assert_eq!(f.sched.cpu_usage_permille(), 999);

        // The new window starts empty
        assert_eq!(f.sched.tcb(a).unwrap().time.new_window_time, 0);
        assert!(sa.context_switches >= 499);
        assert_eq!(sa.stack_size, STACK * WORD_SIZE);
        assert!(sa.stack_high_water >= INITIAL_FRAME_WORDS * WORD_SIZE);
    }

    #[test]
    fn test_write_statistics_lists_threads_and_regions() {
        let mut f = Fixture::new();
        f.spawn("blink", Priority::Normal);
        f.spawn("runtime", Priority::Normal);
        f.run_tick();

        let mut out = String::new();
        f.sched.write_statistics(&f.heap, &mut out).unwrap();
        assert!(out.starts_with("CPU"));
        assert!(out.contains("SRAM"));
        assert!(out.contains("idle"));
        assert!(out.contains("blink"));
        assert!(out.contains("runtime"));
    }

    #[test]
    fn test_thread_limit() {
        let mut f = Fixture::new();
        for _ in 1..MAX_THREADS {
            f.spawn("filler", Priority::Bulk);
        }
        let free = f.heap.free_size(RegionId::Sram);
        assert_eq!(
            f.sched
                .spawn(&mut f.heap, "extra", worker, 0, Priority::Bulk, STACK)
                .err(),
            Some(KernelError::ThreadLimit)
        );
        assert_eq!(f.heap.free_size(RegionId::Sram), free);
        assert_eq!(f.sched.status(), SchedulerStatus::Running);
    }

    #[test]
    fn test_spawn_out_of_memory() {
        let mut f = Fixture::new();
        let result = f
            .sched
            .spawn(&mut f.heap, "huge", worker, 0, Priority::Normal, 1 << 20);
        assert!(matches!(result, Err(KernelError::OutOfMemory { .. })));
        assert_eq!(f.sched.thread_count(), 1);
        assert_eq!(f.sched.status(), SchedulerStatus::Running);
    }

    #[test]
    fn test_spawn_builds_initial_frame() {
        let mut f = Fixture::new();
        let a = f
            .sched
            .spawn(&mut f.heap, "arg", worker, 77, Priority::Normal, STACK)
            .unwrap();
        let tcb = f.sched.tcb(a).unwrap();
        let frame = tcb.context as *const usize;
        unsafe {
            assert_eq!(*frame.add(8), 77);
            assert_eq!(*frame.add(13), TestPort::thread_exit_address());
            assert_eq!(*frame.add(14), worker as usize & !1);
        }
        assert_eq!(f.name_of(a), "arg");
    }

    #[test]
    #[should_panic(expected = "idle thread cannot block")]
    fn test_idle_cannot_delay() {
        let mut f = Fixture::new();
        f.sched.delay_current(1);
    }

    /// Fixture with a worker running and the scheduler suspended.
    fn suspended_worker() -> Fixture {
        let mut f = Fixture::new();
        let a = f.spawn("a", Priority::Normal);
        assert_eq!(f.run_tick(), a);
        f.sched.suspend();
        f
    }

    #[test]
    #[should_panic(expected = "delay: called while the scheduler is suspended")]
    fn test_delay_while_suspended_panics() {
        let mut f = suspended_worker();
        f.sched.delay_current(100);
    }

    #[test]
    #[should_panic(expected = "move_current_thread_to: called while the scheduler is suspended")]
    fn test_move_while_suspended_panics() {
        let mut f = suspended_worker();
        f.sched.move_current_to(BlockingQueue::Serial);
    }

    #[test]
    #[should_panic(expected = "exit: called while the scheduler is suspended")]
    fn test_exit_while_suspended_panics() {
        let mut f = suspended_worker();
        f.sched.exit_current();
    }

    #[test]
    #[should_panic(expected = "reschedule: called while the scheduler is suspended")]
    fn test_reschedule_while_suspended_panics() {
        let mut f = suspended_worker();
        f.sched.request_reschedule();
    }

    #[test]
    fn test_delay_after_resume_blocks() {
        let mut f = suspended_worker();
        let a = f.sched.current().unwrap();
        f.sched.resume();

        f.sched.delay_current(3);
        assert_eq!(f.run_tick(), f.sched.idle().unwrap());
        assert_eq!(f.sched.queue_len(QueueId::Delay), 1);
        assert_eq!(f.sched.tcb(a).unwrap().state, ThreadState::Delayed);
    }
}
