#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

mod vga_buffer;
mod serial;
mod interrupts;
mod gdt;
mod allocator;
mod process;
mod vm;

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;

/// Physical memory reserved for the frame pool. This teaching kernel
/// does not parse a bootloader memory map (the teacher's own `_start`
/// never does either) — it claims a fixed region above the kernel and
/// heap, sized to back a handful of user pages.
const FRAME_POOL_BASE: u64 = 0x0010_0000;
const FRAME_POOL_FRAMES: usize = 1024;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    println!("uvm_kernel starting...");
    serial_println!("Stage 1: GDT");
    gdt::init();

    serial_println!("Stage 2: IDT");
    interrupts::init_idt();

    serial_println!("Stage 3: PICs");
    unsafe {
        interrupts::PICS.lock().initialize();
    }

    serial_println!("Stage 4: heap");
    allocator::init_heap();

    serial_println!("Stage 5: frame pool + swap disk");
    vm::physalloc::init(FRAME_POOL_BASE, FRAME_POOL_FRAMES);
    vm::swap::init(Box::new(vm::swap::RamSwapDisk::new(4096)));

    serial_println!("Stage 6: enabling interrupts");
    x86_64::instructions::interrupts::enable();

    serial_println!("Stage 7: spawning initial process");
    let pid = process::spawn();
    process::set_current(pid);

    let address_space = process::current_address_space().expect("just spawned");
    {
        let mut aspace = address_space.lock();
        vm::register_lazy(&mut aspace, 0x0040_0000, true, Arc::new(vm::page::ZeroInit));
    }

    // Drive the fault handler directly rather than through a real
    // trap: nothing in this teaching kernel loads a process's
    // `PageTableHandle` into CR3 (there is no scheduler to do it), so
    // an actual CPU access to this address would fault against the
    // boot page table instead of the one `handle_fault` maintains.
    let claimed = vm::fault::handle_fault(&address_space, 0x0040_0040, 0, true, false, true);
    serial_println!("Stage 8: demand page claim -> {}", claimed);

    #[cfg(test)]
    test_main();

    println!("uvm_kernel idle.");
    hlt_loop();
}

pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    serial_println!("\n\n=== KERNEL PANIC ===");
    println!("\n\n=== KERNEL PANIC ===");
    serial_println!("{}", info);
    println!("{}", info);

    unsafe {
        let rsp: u64;
        let rbp: u64;
        core::arch::asm!(
            "mov {}, rsp",
            "mov {}, rbp",
            out(reg) rsp,
            out(reg) rbp,
        );
        serial_println!("  RSP: {:#018x}", rsp);
        serial_println!("  RBP: {:#018x}", rbp);
    }

    hlt_loop()
}

// Required by the linker for unwind tables emitted by the prebuilt core/alloc
// sysroot; never invoked since this crate builds with `panic = "abort"`.
#[no_mangle]
extern "C" fn rust_eh_personality() {}

#[cfg(test)]
fn test_runner(tests: &[&dyn Fn()]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test();
    }
    serial_println!("All tests passed");
}

#[test_case]
fn trivial_assertion() {
    assert_eq!(1, 1);
}
