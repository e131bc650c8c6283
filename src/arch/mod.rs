//! # Architecture Abstraction Layer
//!
//! The scheduler never touches hardware. Everything it needs from the
//! platform goes through [`Port`]: how far into the current slice we are,
//! how to force the tick handler to run now, how to request the
//! register-level context switch, and how to make freshly written memory
//! visible to the rest of the system.
//!
//! The Cortex-M7 port drives SysTick and PendSV. The host port backs the
//! unit tests and records what the scheduler asked for.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m7;
pub mod fault;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod host;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m7::{idle_thread, CortexM7 as ActivePort};
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use host::{idle_thread, HostPort as ActivePort};

use crate::thread::Word;

/// Platform capabilities used by the scheduler. All functions are
/// associated functions: a port is a type, not a value.
pub trait Port {
    /// Microseconds elapsed in the slice that is currently running.
    fn slice_elapsed_micros() -> u64;

    /// Restart the slice timer so the next thread gets a full slice.
    fn restart_slice();

    /// Run the tick handler as soon as possible (voluntary reschedule).
    fn request_immediate_reschedule();

    /// Pend the lower-priority context switch.
    fn request_context_switch();

    /// Make memory written by the scheduler visible to other bus masters
    /// (D-cache clean on the M7).
    fn publish_memory();

    /// Address a thread returns to when its entry function returns.
    fn thread_exit_address() -> usize;
}

/// Words in the initial frame: r4–r11 saved by software, then the
/// r0–r3, r12, lr, pc, xPSR frame stacked by hardware on exception entry.
pub const INITIAL_FRAME_WORDS: usize = 16;

/// xPSR with only the Thumb bit set.
pub const INITIAL_XPSR: Word = 0x0100_0000;

/// Build the first context of a thread at the top of its stack.
///
/// ## Stack Layout (top = high address, growing down)
///
/// ```text
/// [Hardware stacked frame]
///   xPSR  (Thumb bit set)
///   PC    (entry, bit 0 cleared)
///   LR    (thread exit trampoline)
///   R12   (0)
///   R3    (0)
///   R2    (0)
///   R1    (0)
///   R0    (arg)
/// [Software saved context]
///   R11 … R4 (0)          <- returned context
/// ```
///
/// Returns the address of the r4 slot, which is what the switch code
/// saves and restores.
///
/// # Panics
/// If the stack cannot hold the frame.
pub fn init_stack(stack: &mut [Word], entry: usize, arg: usize, exit: usize) -> usize {
    assert!(stack.len() >= INITIAL_FRAME_WORDS + 2, "stack too small for the initial frame");

    // Keep the frame 8-byte aligned (AAPCS) and leave one guard word on top
    let top = stack.as_ptr() as usize + stack.len() * core::mem::size_of::<Word>();
    let aligned_top = (top - core::mem::size_of::<Word>()) & !0x07;
    let frame_start = (aligned_top - stack.as_ptr() as usize) / core::mem::size_of::<Word>()
        - INITIAL_FRAME_WORDS;
    let frame = &mut stack[frame_start..frame_start + INITIAL_FRAME_WORDS];

    frame[..8].fill(0); // r4–r11
    frame[8] = arg; // r0
    frame[9..13].fill(0); // r1, r2, r3, r12
    frame[13] = exit; // lr
    frame[14] = entry & !1; // pc, exception return wants bit 0 clear
    frame[15] = INITIAL_XPSR;

    frame.as_ptr() as usize
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
