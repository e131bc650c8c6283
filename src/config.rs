//! # Strawberry Configuration
//!
//! Compile-time constants governing the scheduler, the allocator and the
//! board memory map. Everything here is fixed at build time.

use crate::memory::RegionId;

/// Core clock after PLL bring-up (SAM E70 at 300 MHz).
pub const SYSTEM_CLOCK_HZ: u32 = 300_000_000;

/// SysTick frequency in Hz. One tick is one scheduling slice.
pub const TICK_HZ: u32 = 1000;

/// Length of one slice in microseconds. The kernel tick counter and all
/// runtime statistics are kept in microseconds.
pub const TICK_MICROS: u64 = 1_000_000 / TICK_HZ as u64;

/// Statistics window. Every window each thread's accrued runtime is
/// published as its reportable window time and the accumulator restarts.
pub const STATISTICS_WINDOW_MICROS: u64 = 1_000_000;

/// Maximum number of threads, idle thread included. Bounds the slot table
/// and every queue.
pub const MAX_THREADS: usize = 16;

/// Thread names longer than this are truncated.
pub const MAX_NAME_LEN: usize = 24;

/// Region names longer than this are truncated.
pub const MAX_REGION_NAME_LEN: usize = 16;

/// Stack of the idle thread, in words. It only ever sleeps in `wfi`.
pub const IDLE_STACK_WORDS: usize = 64;

/// Region that thread stacks are carved from.
pub const THREAD_STACK_REGION: RegionId = RegionId::Sram;

/// Threads re-tagged with this id own a dynamically loaded program. When
/// such a thread retires the exit cleanup hook runs before its stack is
/// released.
pub const LOADED_PROGRAM_THREAD_ID: u32 = 6969;

/// Default allocator alignment in bytes.
pub const HEAP_ALIGNMENT: usize = 8;

/// Default minimum payload of a heap block. Smaller requests are rounded
/// up, and splits never leave a remainder below this.
pub const HEAP_MINIMUM_BLOCK: usize = 8;

/// External SDRAM bank 0 (SDRAMC chip select, first half).
pub const DRAM_BANK_0_START: usize = 0x7000_0000;
pub const DRAM_BANK_0_END: usize = 0x7008_0000;

/// External SDRAM bank 1 (second half).
pub const DRAM_BANK_1_START: usize = 0x7008_0000;
pub const DRAM_BANK_1_END: usize = 0x7010_0000;
