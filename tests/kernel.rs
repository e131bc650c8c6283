//! Kernel facade tests on the host port.
//!
//! The kernel is a process-wide singleton, so every test takes `SERIAL`
//! and boots a fresh kernel over its own leaked arena.

use std::boxed::Box;
use std::ptr::NonNull;
use std::string::String;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::thread;
use std::time::Duration;

use strawberry::arch::host::HostPort;
use strawberry::config::{LOADED_PROGRAM_THREAD_ID, TICK_MICROS};
use strawberry::kernel;
use strawberry::memory::{Heap, RegionConfig, RegionId};
use strawberry::scheduler::{BlockingQueue, QueueId, SchedulerStatus};
use strawberry::sync::Mutex;
use strawberry::thread::{Priority, ThreadHandle, ThreadState};
use strawberry::KernelError;

static SERIAL: StdMutex<()> = StdMutex::new(());

const ARENA_SIZE: usize = 64 * 1024;

#[repr(C, align(16))]
struct Arena([u8; ARENA_SIZE]);

extern "C" fn body(_: usize) {}

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn boot() -> ThreadHandle {
    let arena: &'static mut Arena = Box::leak(Box::new(Arena([0; ARENA_SIZE])));
    let start = arena.0.as_mut_ptr() as usize;
    let sram = RegionConfig::new(RegionId::Sram, "SRAM", start, start + ARENA_SIZE);
    HostPort::set_slice_elapsed(0);
    unsafe { kernel::init(&[sram]) }.unwrap()
}

fn spawn(name: &str) -> ThreadHandle {
    kernel::spawn(name, body, 0, Priority::Normal, 64).unwrap()
}

/// SysTick, then the PendSV switch.
fn tick() -> ThreadHandle {
    kernel::on_tick();
    let saved = kernel::with_kernel(|k| {
        k.scheduler
            .current()
            .and_then(|h| k.scheduler.tcb(h).ok())
            .map_or(0, |tcb| tcb.context)
    })
    .unwrap();
    kernel::switch_context(saved);
    kernel::current_thread().unwrap().unwrap()
}

#[test]
fn test_init_makes_idle_current() {
    let _guard = serial();
    let idle = boot();
    assert_eq!(kernel::current_thread().unwrap(), Some(idle));
    assert_eq!(kernel::tick_micros().unwrap(), 0);
    assert_eq!(kernel::scheduler_status().unwrap(), SchedulerStatus::Running);
}

#[test]
fn test_round_robin_through_facade() {
    let _guard = serial();
    boot();
    let a = spawn("a");
    let b = spawn("b");
    let c = spawn("c");

    let picks: Vec<_> = (0..6).map(|_| tick()).collect();
    assert_eq!(picks, [a, b, c, a, b, c]);
    assert_eq!(kernel::tick_micros().unwrap(), 6 * TICK_MICROS);
    assert_eq!(kernel::thread_stats(a).unwrap().context_switches, 2);
}

#[test]
fn test_launch_then_delay() {
    let _guard = serial();
    let idle = boot();
    let a = spawn("sleeper");

    kernel::launch().unwrap();
    assert_eq!(kernel::current_thread().unwrap(), Some(a));

    let requests = HostPort::reschedule_requests();
    HostPort::set_slice_elapsed(300);
    kernel::delay(2).unwrap();
    assert!(HostPort::reschedule_requests() > requests);

    assert_eq!(tick(), idle);
    assert_eq!(kernel::tick_micros().unwrap(), 300);
    assert_eq!(kernel::thread_stats(a).unwrap().runtime_micros, 300);

    // Wake tick is 2000 µs
    assert_eq!(tick(), idle);
    assert_eq!(tick(), a);
    assert_eq!(kernel::tick_micros().unwrap(), 2300);
}

#[test]
fn test_allocate_and_free_through_facade() {
    let _guard = serial();
    boot();

    let before = kernel::region_usage(RegionId::Sram).unwrap();
    let block = kernel::allocate(RegionId::Sram, 1000).unwrap();
    let during = kernel::region_usage(RegionId::Sram).unwrap();
    assert!(during.used >= before.used + 1000);
    assert_eq!(during.total, before.total);
    assert_eq!(during.used + during.free, during.total);

    unsafe { kernel::free(block) }.unwrap();
    assert_eq!(kernel::region_usage(RegionId::Sram).unwrap(), before);

    assert_eq!(
        kernel::allocate(RegionId::DramBank0, 16).err(),
        Some(KernelError::RegionNotConfigured(RegionId::DramBank0))
    );
    assert!(matches!(
        kernel::allocate(RegionId::Sram, ARENA_SIZE * 2),
        Err(KernelError::OutOfMemory { region: RegionId::Sram, .. })
    ));
    assert_eq!(
        kernel::region_usage(RegionId::DramBank1).err(),
        Some(KernelError::RegionNotConfigured(RegionId::DramBank1))
    );
}

static PROGRAM: AtomicUsize = AtomicUsize::new(0);

fn release_program(heap: &mut Heap) {
    if let Some(block) = NonNull::new(PROGRAM.swap(0, Ordering::SeqCst) as *mut u8) {
        unsafe { heap.free(block) };
    }
}

#[test]
fn test_loaded_program_memory_released_on_exit() {
    let _guard = serial();
    boot();
    kernel::set_exit_cleanup_hook(release_program).unwrap();
    let baseline = kernel::region_usage(RegionId::Sram).unwrap();

    let program = kernel::allocate(RegionId::Sram, 4096).unwrap();
    PROGRAM.store(program.as_ptr() as usize, Ordering::SeqCst);
    let loaded = spawn("program");
    kernel::set_thread_id(loaded, LOADED_PROGRAM_THREAD_ID).unwrap();

    assert_eq!(tick(), loaded);
    kernel::exit_current().unwrap();
    tick();

    assert_eq!(PROGRAM.load(Ordering::SeqCst), 0);
    assert_eq!(kernel::region_usage(RegionId::Sram).unwrap(), baseline);
    assert_eq!(
        kernel::thread_stats(loaded).err(),
        Some(KernelError::StaleHandle)
    );
    assert_eq!(
        kernel::set_thread_id(loaded, 1).err(),
        Some(KernelError::StaleHandle)
    );
}

#[test]
fn test_serial_queue_blocks_until_woken() {
    let _guard = serial();
    let idle = boot();
    let reader = spawn("reader");

    assert_eq!(tick(), reader);
    kernel::move_current_thread_to(BlockingQueue::Serial).unwrap();
    assert_eq!(tick(), idle);
    assert_eq!(tick(), idle);
    assert_eq!(kernel::thread_stats(reader).unwrap().state, ThreadState::Blocked);
    assert_eq!(
        kernel::with_kernel(|k| k.scheduler.queue_len(QueueId::Serial)).unwrap(),
        1
    );

    assert_eq!(kernel::wake_one(BlockingQueue::Serial).unwrap(), Some(reader));
    assert_eq!(kernel::wake_one(BlockingQueue::Serial).unwrap(), None);
    assert_eq!(kernel::thread_stats(reader).unwrap().state, ThreadState::Running);
    assert_eq!(tick(), reader);

    kernel::move_current_thread_to(BlockingQueue::Suspended).unwrap();
    assert_eq!(tick(), idle);
    assert!(kernel::wake_thread(reader).unwrap());
    assert_eq!(kernel::wake_queue(BlockingQueue::Suspended).unwrap(), 0);
    assert_eq!(tick(), reader);
}

#[test]
fn test_suspend_blocks_decisions() {
    let _guard = serial();
    let idle = boot();
    spawn("a");

    kernel::suspend_scheduler().unwrap();
    assert_eq!(kernel::scheduler_status().unwrap(), SchedulerStatus::Suspended);
    assert_eq!(tick(), idle);
    assert_eq!(tick(), idle);

    kernel::resume_scheduler().unwrap();
    assert_ne!(tick(), idle);
}

#[test]
fn test_runtime_statistics_table() {
    let _guard = serial();
    boot();
    spawn("blink");
    for _ in 0..10 {
        tick();
    }

    let mut table = String::new();
    kernel::write_runtime_statistics(&mut table).unwrap().unwrap();
    assert!(table.contains("SRAM"));
    assert!(table.contains("blink"));
    assert!(table.contains("idle"));
    assert!(kernel::cpu_usage_permille().unwrap() <= 1000);
}

#[test]
fn test_mutex_waiter_reschedules() {
    let _guard = serial();
    boot();

    let mutex: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let held = mutex.lock();
    let requests = HostPort::reschedule_requests();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || {
            *mutex.lock() += 1;
        })
    };

    while HostPort::reschedule_requests() == requests {
        thread::sleep(Duration::from_millis(1));
    }
    drop(held);
    waiter.join().unwrap();

    assert_eq!(*mutex.lock(), 1);
    assert!(HostPort::reschedule_requests() > requests);
}
