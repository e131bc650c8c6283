//! # Strawberry Demo Firmware
//!
//! Brings the kernel up on the SAM E70 and runs a handful of threads that
//! exercise it:
//!
//! | Thread | Priority | Behavior |
//! |--------|----------|----------|
//! | `blink` | Normal | Toggles a counter every 500 ms through `delay` |
//! | `worker` | Bulk | Busy computation, preempted every slice |
//! | `allocator` | Normal | Allocates and frees blocks of varying size |
//! | `shared` ×2 | Interactive | Contend for a `Mutex`, yielding while blocked |
//! | `stats` | Interactive | Logs the runtime statistics table every second |
//!
//! Internal SRAM from the end of `.bss`/`.data` up to the main stack is the
//! stack region. With `external-dram` the SDRAM banks are configured too;
//! the SDRAM controller is assumed to be initialized before `main`.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use strawberry::arch::cortex_m7;
use strawberry::kernel;
use strawberry::memory::{RegionConfig, RegionId};
use strawberry::sync::Mutex;
use strawberry::thread::Priority;

extern "C" {
    static mut __sheap: u8;
    static _eheap: u8;
}

static BLINKS: AtomicU32 = AtomicU32::new(0);
static SHARED: Mutex<u64> = Mutex::new(0);

// ---------------------------------------------------------------------------
// Thread entry points
// ---------------------------------------------------------------------------

extern "C" fn blink(_: usize) {
    loop {
        BLINKS.fetch_add(1, Ordering::Relaxed);
        let _ = kernel::delay(500);
    }
}

extern "C" fn worker(_: usize) {
    let mut x: u32 = 1;
    loop {
        x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        core::hint::black_box(x);
    }
}

extern "C" fn allocator(_: usize) {
    let mut size = 16;
    loop {
        if let Ok(block) = kernel::allocate(RegionId::Sram, size) {
            // SAFETY: the block came from `allocate` and is not used again.
            let _ = unsafe { kernel::free(block) };
        }
        size = if size >= 4096 { 16 } else { size * 2 };
        let _ = kernel::delay(10);
    }
}

extern "C" fn shared(increments: usize) {
    for _ in 0..increments {
        *SHARED.lock() += 1;
        kernel::reschedule();
    }
    log::info!("shared: done, total {}", *SHARED.lock());
}

extern "C" fn stats(_: usize) {
    loop {
        let _ = kernel::delay(1000);
        let mut table: heapless::String<1024> = heapless::String::new();
        if let Ok(Ok(())) = kernel::write_runtime_statistics(&mut table) {
            log::info!("\n{}", table);
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let Some(core) = cortex_m::Peripherals::take() else {
        panic!("core peripherals taken twice");
    };
    let _ = cortex_m7::init_logger(log::LevelFilter::Info);

    // SAFETY: linker symbols; only their addresses are used.
    let sram = unsafe {
        RegionConfig::new(
            RegionId::Sram,
            "SRAM",
            core::ptr::addr_of_mut!(__sheap) as usize,
            core::ptr::addr_of!(_eheap) as usize,
        )
    };

    #[cfg(feature = "external-dram")]
    let regions = {
        use strawberry::config::{
            DRAM_BANK_0_END, DRAM_BANK_0_START, DRAM_BANK_1_END, DRAM_BANK_1_START,
        };
        [
            sram,
            RegionConfig::new(RegionId::DramBank0, "DRAM0", DRAM_BANK_0_START, DRAM_BANK_0_END),
            RegionConfig::new(RegionId::DramBank1, "DRAM1", DRAM_BANK_1_START, DRAM_BANK_1_END),
        ]
    };
    #[cfg(not(feature = "external-dram"))]
    let regions = [sram];

    // SAFETY: the regions are unused memory between the static data and the
    // main stack, plus the SDRAM banks when present.
    if let Err(err) = unsafe { kernel::init(&regions) } {
        panic!("kernel init: {}", err);
    }

    let threads: [(&str, extern "C" fn(usize), usize, Priority, usize); 6] = [
        ("blink", blink, 0, Priority::Normal, 128),
        ("worker", worker, 0, Priority::Bulk, 128),
        ("allocator", allocator, 0, Priority::Normal, 256),
        ("shared-a", shared, 10_000, Priority::Interactive, 256),
        ("shared-b", shared, 10_000, Priority::Interactive, 256),
        ("stats", stats, 0, Priority::Interactive, 1024),
    ];
    for (name, entry, arg, priority, stack_words) in threads {
        if let Err(err) = kernel::spawn(name, entry, arg, priority, stack_words) {
            panic!("spawn {}: {}", name, err);
        }
    }

    kernel::start(core)
}
