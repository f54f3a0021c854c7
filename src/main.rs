/*
 * Myrtos Kernel Main Entry Point
 *
 * Boot path for the myrtos teaching kernel: a small multicore process and
 * thread kernel with a multilevel-feedback scheduler, pipes and in-kernel
 * stream sockets.
 *
 * The boot core switches to its own stack, brings up the machine substrate
 * (serial, logging, heap, interrupts, timer), builds the scheduler and the
 * process table, launches the init process, and then turns itself into the
 * core's idle thread by entering the scheduler. Secondary cores park; the
 * kernel is shaped for them but only the boot core is brought up.
 */

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![feature(lang_items)]
#![allow(dead_code)]

extern crate alloc;

use core::panic::PanicInfo;

#[macro_use]
mod utils;
mod io;
mod machine;
mod proc;
mod sched;
mod tests;

#[repr(C, align(16))]
pub struct AlignedBootStack([u8; 64 * 1024]);

#[unsafe(no_mangle)]
pub static mut BOOT_STACK: AlignedBootStack = AlignedBootStack([0; 64 * 1024]);

/// ===============================
///  EARLY ENTRY POINT (_start)
/// ===============================
///
/// Entered on every started core. Required to:
///   - Identify the boot core via its APIC id (CPUID leaf 1)
///   - Switch the boot core to its own 64 KiB kernel stack
///   - Call into Rust's `kmain`
///   - Park every other core
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        // CPUID leaf 1 -> EBX[31:24] = APIC id
        "mov eax, 1",
        "cpuid",
        "shr ebx, 24",
        "test ebx, ebx",
        "jnz 2f",
        // Boot core: switch to the kernel stack and enter Rust.
        "lea rax, [rip + BOOT_STACK]",
        "add rax, {stack_size}",
        "mov rsp, rax",
        "jmp kmain",
        // Everyone else parks.
        "2:",
        "hlt",
        "jmp 2b",
        stack_size = const 64 * 1024,
    );
}

/// ===============================
///  RUST KERNEL ENTRY POINT
/// ===============================
#[unsafe(no_mangle)]
pub extern "C" fn kmain() -> ! {
    machine::serial::init();
    utils::logger::init();
    log::info!("myrtos kernel starting...");

    machine::heap::init();
    machine::interrupts::init();
    machine::timer::init();

    sched::init();
    proc::init();
    io::socket::init();

    // Init (pid 1) drives the in-kernel test suites and adopts every
    // orphan the tests leave behind.
    let init_pid = proc::exec(Some(init_main), None);
    assert!(init_pid == proc::Pid(1), "init must get pid 1");
    log::info!("Init process launched ({})", init_pid);

    // The boot context becomes this core's idle thread. Returns only when
    // the last thread is gone and the scheduler shuts down.
    sched::run_scheduler();

    log::info!("All threads finished. System halted.");
    loop {
        machine::core_halt();
    }
}

/// Main task of the init process.
fn init_main(_args: Option<&[u8]>) -> i32 {
    tests::comprehensive::run_all()
}

/// ===============================
///  PANIC HANDLER
/// ===============================
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    loop {
        x86_64::instructions::hlt();
    }
}

/// Unwinding is never triggered under `panic = "abort"`; this satisfies the
/// linker's reference to the lang item without providing real unwind support.
#[lang = "eh_personality"]
extern "C" fn eh_personality() {}
