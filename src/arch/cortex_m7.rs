//! # Cortex-M7 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M7 (SAM E70). Implements the
//! context switch via PendSV, the SysTick slice timer, the thread exit
//! trampoline, fault reporting and an ITM logger.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M7 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV saves and restores R4–R11, which completes the
//! context. The target is soft-float, so there is no FPU state to carry.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: highest, so the slice is charged on time
//! - PendSV: lowest, so the switch runs only when no other handler is active

use core::arch::{asm, naked_asm};
use core::fmt::Write as _;

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use cortex_m_rt::{exception, ExceptionFrame};

use super::fault::{self, FaultKind, FaultStatus};
use super::Port;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};

/// SysTick reload for one slice.
const SYSTICK_RELOAD: u32 = SYSTEM_CLOCK_HZ / TICK_HZ - 1;

const CYCLES_PER_MICRO: u32 = SYSTEM_CLOCK_HZ / 1_000_000;

const SYSTICK_PRIORITY: u8 = 0x00;
const PENDSV_PRIORITY: u8 = 0xFF;

/// SHCSR enable bits for the configurable fault handlers.
const MEMFAULTENA: u32 = 1 << 16;
const BUSFAULTENA: u32 = 1 << 17;
const USGFAULTENA: u32 = 1 << 18;

pub struct CortexM7;

impl Port for CortexM7 {
    fn slice_elapsed_micros() -> u64 {
        // SysTick counts down from the reload value
        let elapsed = SYST::get_reload().saturating_sub(SYST::get_current());
        u64::from(elapsed / CYCLES_PER_MICRO)
    }

    fn restart_slice() {
        // SAFETY: any write to CVR clears it; the next count reloads.
        unsafe { (*SYST::PTR).cvr.write(0) };
    }

    fn request_immediate_reschedule() {
        SCB::set_pendst();
    }

    fn request_context_switch() {
        SCB::set_pendsv();
    }

    fn publish_memory() {
        // SAFETY: only the cache maintenance registers are touched.
        let mut core = unsafe { cortex_m::Peripherals::steal() };
        core.SCB.clean_dcache(&mut core.CPUID);
        cortex_m::asm::dsb();
    }

    fn thread_exit_address() -> usize {
        thread_exit as usize
    }
}

// ---------------------------------------------------------------------------
// SysTick and priorities
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the core clock, set the
/// SysTick and PendSV priorities and enable the MemManage, BusFault and
/// UsageFault handlers so those faults are reported instead of escalating.
pub fn configure(syst: &mut SYST, scb: &mut SCB) {
    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(SYSTICK_RELOAD);
    syst.clear_current();

    // SAFETY: changing system handler priorities before the first thread
    // runs cannot break a priority-based critical section.
    unsafe {
        scb.set_priority(SystemHandler::SysTick, SYSTICK_PRIORITY);
        scb.set_priority(SystemHandler::PendSV, PENDSV_PRIORITY);
        scb.shcsr
            .modify(|shcsr| shcsr | MEMFAULTENA | BUSFAULTENA | USGFAULTENA);
    }

    syst.enable_interrupt();
    syst.enable_counter();
}

#[exception]
fn SysTick() {
    crate::kernel::on_tick();
}

// ---------------------------------------------------------------------------
// Fault handlers
// ---------------------------------------------------------------------------

fn fault_status() -> FaultStatus {
    // SAFETY: read-only access to the fault status registers.
    let scb = unsafe { &*SCB::PTR };
    FaultStatus {
        cfsr: scb.cfsr.read(),
        hfsr: scb.hfsr.read(),
        mmfar: scb.mmfar.read(),
        bfar: scb.bfar.read(),
    }
}

fn halt_on_fault(kind: FaultKind, pc: Option<u32>) -> ! {
    fault::report(kind, &fault_status(), pc);
    loop {
        cortex_m::asm::wfi();
    }
}

#[exception]
fn MemoryManagement() -> ! {
    halt_on_fault(FaultKind::MemoryManagement, None)
}

#[exception]
fn BusFault() -> ! {
    halt_on_fault(FaultKind::BusFault, None)
}

#[exception]
fn UsageFault() -> ! {
    halt_on_fault(FaultKind::UsageFault, None)
}

#[exception]
unsafe fn HardFault(frame: &ExceptionFrame) -> ! {
    halt_on_fault(FaultKind::HardFault, Some(frame.pc()))
}

// ---------------------------------------------------------------------------
// First thread launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and jump into the first thread.
///
/// The frame built by `init_stack` is unwound by hand since this is not an
/// exception return: skip the zeroed r4–r11, pop r0–r3, r12 and lr, then
/// branch to the stacked pc with the Thumb bit set.
///
/// # Safety
/// Called once, with interrupts disabled, with a context from `init_stack`.
pub unsafe fn start_first_thread(context: usize) -> ! {
    asm!(
        "adds r0, #32",
        "msr psp, r0",
        "movs r0, #2",
        "msr control, r0",
        "isb",
        "pop {{r0-r3, r12, lr}}",
        "pop {{r4, r5}}",
        "orr r4, r4, #1",
        "cpsie i",
        "bx r4",
        in("r0") context,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the context switch decided by the
/// last tick.
///
/// ## Sequence
/// 1. Push R4–R11 onto the outgoing thread's stack (PSP)
/// 2. `kernel::switch_context` stores that PSP and returns the incoming one
/// 3. Pop R4–R11 from the incoming stack and load PSP
/// 4. Return from exception; hardware unstacks the rest
///
/// Naked so the compiler neither pushes to the stack nor reuses registers
/// holding thread state.
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn PendSV() {
    naked_asm!(
        "cpsid i",
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        // r3 keeps the MSP 8-byte aligned; lr holds EXC_RETURN
        "push {{r3, lr}}",
        "bl {switch}",
        "pop {{r3, lr}}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "cpsie i",
        "bx lr",
        switch = sym pendsv_switch,
    );
}

extern "C" fn pendsv_switch(saved: usize) -> usize {
    crate::kernel::switch_context(saved)
}

// ---------------------------------------------------------------------------
// Thread bodies
// ---------------------------------------------------------------------------

/// Where a thread lands when its entry function returns.
extern "C" fn thread_exit() -> ! {
    let _ = crate::kernel::exit_current();
    loop {
        cortex_m::asm::wfi();
    }
}

/// Body of the idle thread.
pub extern "C" fn idle_thread(_: usize) {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// ITM logger
// ---------------------------------------------------------------------------

/// `log` backend writing to ITM stimulus port 0. Filtering follows
/// `log::max_level()`.
pub struct ItmLogger;

static LOGGER: ItmLogger = ItmLogger;

impl log::Log for ItmLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        critical_section::with(|_| {
            // SAFETY: the stimulus port is only written inside a critical
            // section.
            let mut core = unsafe { cortex_m::Peripherals::steal() };
            let mut line: heapless::String<160> = heapless::String::new();
            let _ = writeln!(line, "[{}] {}: {}", record.level(), record.target(), record.args());
            cortex_m::itm::write_str(&mut core.ITM.stim[0], &line);
        });
    }

    fn flush(&self) {}
}

/// Install the ITM logger.
pub fn init_logger(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}
