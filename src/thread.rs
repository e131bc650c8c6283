//! # Thread Control Block
//!
//! Per-thread persistent state. TCBs live in the scheduler's slot table and
//! are named by a [`ThreadHandle`] (slot plus generation), so a handle kept
//! past the thread's retirement is detected instead of aliasing whatever
//! thread reuses the slot.
//!
//! The thread's stack is one block from the allocator. It is painted with
//! [`STACK_PAINT`] at spawn so the high-water mark can be read back later.

use core::mem::size_of;
use core::ptr::NonNull;

use heapless::String;

use crate::config::{MAX_NAME_LEN, STATISTICS_WINDOW_MICROS};

/// Machine word. Stacks are sized in words.
pub type Word = usize;

/// Size of one stack word in bytes.
pub const WORD_SIZE: usize = size_of::<Word>();

/// Fill pattern for unused stack.
pub const STACK_PAINT: Word = 0xA5A5_A5A5 as Word;

/// Thread entry point. The argument arrives in r0.
pub type ThreadEntry = extern "C" fn(usize);

// ---------------------------------------------------------------------------
// Priority and state
// ---------------------------------------------------------------------------

/// Priority class. Each class has its own run queue; a lower class only
/// runs when every higher class is idle.
///
/// - **RealTime**: streaming, control loops. Can starve everything else.
/// - **Interactive**: waits on user input, must answer quickly.
/// - **Normal**: most threads.
/// - **Bulk**: long-running background computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    RealTime = 0,
    Interactive = 1,
    Normal = 2,
    Bulk = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle state.
///
/// ```text
///                ┌──► Delayed ───┐  (wake tick passed)
///                ├──► Blocked ───┤  (wake_one / wake_queue / wake_thread)
///   spawn ──► Running ◄──────────┘
///                ├──► Suspended ──► Running
///                └──► ExitPending ──► (retired by the scheduler)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to run, or running.
    Running,
    /// In the delay queue until its wake tick.
    Delayed,
    /// Waiting on a blocking-condition queue such as serial input.
    Blocked,
    /// Parked on the suspended list until resumed.
    Suspended,
    /// Finished; the next scheduling pass frees it.
    ExitPending,
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Names one live thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub(crate) slot: usize,
    pub(crate) generation: u32,
}

impl ThreadHandle {
    /// Slot index in the scheduler table.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Runtime accounting in microseconds.
///
/// `new_window_time` accrues during the current statistics window and is
/// copied into `window_time` when the window closes, so readers always see
/// a complete window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTime {
    pub runtime: u64,
    pub window_time: u64,
    pub new_window_time: u64,
}

impl ThreadTime {
    pub const fn new() -> Self {
        Self {
            runtime: 0,
            window_time: 0,
            new_window_time: 0,
        }
    }

    pub fn charge(&mut self, micros: u64) {
        self.runtime += micros;
        self.new_window_time += micros;
    }

    pub fn roll_window(&mut self) {
        self.window_time = self.new_window_time;
        self.new_window_time = 0;
    }

    /// Share of the last window, in tenths of a percent.
    pub fn cpu_permille(&self) -> u32 {
        (self.window_time.min(STATISTICS_WINDOW_MICROS) * 1000 / STATISTICS_WINDOW_MICROS) as u32
    }
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

pub type ThreadName = String<MAX_NAME_LEN>;

/// Thread Control Block.
#[derive(Debug)]
pub struct Tcb {
    /// User-visible id. Unique unless a collaborator re-tags the thread.
    pub id: u32,

    /// Bumped every time the slot is reused.
    pub generation: u32,

    /// Saved process stack pointer. Opaque to the scheduler; the port
    /// stores it on switch-out and loads it on switch-in.
    pub context: usize,

    pub priority: Priority,

    pub state: ThreadState,

    /// Absolute wake time in microseconds, valid while delayed.
    pub wake_tick: u64,

    pub time: ThreadTime,

    pub context_switches: u64,

    pub name: ThreadName,

    /// Stack block from the allocator (lowest address).
    pub stack: NonNull<u8>,

    /// Stack size in bytes.
    pub stack_size: usize,

    /// Queue the scheduler should move the thread to on its next pass.
    pub pending_queue: Option<crate::scheduler::QueueId>,
}

// Safety: the stack pointer is owned by this TCB and only touched by the
// scheduler, itself only reached inside critical sections.
unsafe impl Send for Tcb {}

impl Tcb {
    pub fn new(
        id: u32,
        generation: u32,
        name: &str,
        priority: Priority,
        stack: NonNull<u8>,
        stack_size: usize,
    ) -> Self {
        Self {
            id,
            generation,
            context: 0,
            priority,
            state: ThreadState::Running,
            wake_tick: 0,
            time: ThreadTime::new(),
            context_switches: 0,
            name: truncated_name(name),
            stack,
            stack_size,
            pending_queue: None,
        }
    }

    /// Stack as words.
    ///
    /// # Safety
    /// The stack must not be in use by a running thread while the slice is
    /// written through.
    pub unsafe fn stack_words(&mut self) -> &mut [Word] {
        core::slice::from_raw_parts_mut(self.stack.as_ptr() as *mut Word, self.stack_size / WORD_SIZE)
    }

    /// Fill the stack with the paint pattern.
    pub fn paint_stack(&mut self) {
        // SAFETY: only called before the thread first runs.
        unsafe { self.stack_words() }.fill(STACK_PAINT);
    }

    /// Deepest stack use seen so far, in bytes: everything above the lowest
    /// overwritten paint word.
    pub fn stack_high_water(&self) -> usize {
        let words = self.stack_size / WORD_SIZE;
        let base = self.stack.as_ptr() as *const Word;
        let untouched = (0..words)
            // SAFETY: reads stay inside the stack block; a word torn by a
            // concurrent write only shifts the estimate by one word.
            .take_while(|&i| unsafe { core::ptr::read_volatile(base.add(i)) } == STACK_PAINT)
            .count();
        (words - untouched) * WORD_SIZE
    }

    /// Stack in use at the last switch-out, in bytes.
    pub fn stack_in_use(&self) -> usize {
        let top = self.stack.as_ptr() as usize + self.stack_size;
        if self.context == 0 {
            return 0;
        }
        top.saturating_sub(self.context)
    }

    /// Whether the saved context has left the stack block.
    pub fn stack_overflowed(&self) -> bool {
        let base = self.stack.as_ptr() as usize;
        self.context != 0 && self.context < base
    }
}

fn truncated_name(name: &str) -> ThreadName {
    let mut out = ThreadName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
