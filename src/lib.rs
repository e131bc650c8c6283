//! # Strawberry
//!
//! A preemptive round-robin kernel core for a single-core ARM Cortex-M7
//! (SAM E70), paired with a segmented allocator that serves thread stacks
//! and heap blocks from several physically distinct memory regions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │     init() · spawn() · start() · delay() · allocate()   │
//! ├──────────────────┬───────────────────┬─────────────────┤
//! │  Scheduler       │  Allocator        │  Sync           │
//! │  scheduler.rs    │  memory.rs        │  sync.rs        │
//! │  ─ tick()        │  ─ allocate()     │  ─ Spinlock     │
//! │  ─ delay queue   │  ─ free()         │  ─ Mutex        │
//! │  ─ statistics    │  ─ merge on insert│                 │
//! ├──────────────────┴───────────────────┴─────────────────┤
//! │      Threads (thread.rs) · Index lists (list.rs)        │
//! ├────────────────────────────────────────────────────────┤
//! │          Arch Port (arch/cortex_m7.rs, arch/host.rs)    │
//! │      PendSV · SysTick · Stack Init · ITM logging        │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling
//!
//! - Four priority classes, each with a round-robin run queue
//! - A 1 ms slice driven by SysTick; time is kept in microseconds
//! - Delayed threads wait in a wake-time ordered queue and run first once
//!   their time has come
//! - A voluntary reschedule is charged only the part of the slice it used
//! - Per-thread CPU share is published once per one-second window
//!
//! ## Memory Model
//!
//! - **Regions**: internal SRAM plus two optional external SDRAM banks
//! - **Blocks**: first-fit, address-ordered free list per region; adjacent
//!   free blocks are merged on every insert
//! - **Tagging**: every block header names its region, so `free` needs only
//!   the pointer
//! - **Threads**: control blocks live in a fixed slot table; only the stack
//!   is allocated
//! - **Critical sections**: `critical_section::with` around all shared state

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod list;
pub mod memory;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use error::{KernelError, KernelResult};
