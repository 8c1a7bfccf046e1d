use crate::{println, serial_println};
use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::{self, Mutex};
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    LPT1 = PIC_1_OFFSET + 7,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt[InterruptIndex::LPT1.as_usize()].set_handler_fn(spurious_interrupt_handler);
        idt
    };
}

pub fn init_idt() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn spurious_interrupt_handler(_stack_frame: InterruptStackFrame) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::LPT1.as_u8());
    }
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    serial_println!("\n=== CRITICAL: DOUBLE FAULT EXCEPTION ===");
    serial_println!("Error Code: {:#x}", error_code);
    serial_println!("Stack Frame: {:#?}", stack_frame);

    let cr2: u64;
    let cr3: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2);
        core::arch::asm!("mov {}, cr3", out(reg) cr3);
    }
    serial_println!("CR2 (Page Fault Address): {:#x}", cr2);
    serial_println!("CR3 (Page Table Base): {:#x}", cr3);

    panic!("EXCEPTION: DOUBLE FAULT - System cannot recover");
}

pub static TIMER_TICKS: Mutex<u64> = Mutex::new(0);

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    let mut counter = TIMER_TICKS.lock();
    *counter += 1;
}

use crate::vm::fault;
use x86_64::structures::idt::PageFaultErrorCode;

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let addr = Cr2::read();
    let rsp = stack_frame.stack_pointer.as_u64();
    let fault_addr = addr.as_u64();

    let user = error_code.contains(PageFaultErrorCode::USER_MODE);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let not_present = !error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);

    if let Some(address_space) = crate::process::current_address_space() {
        if fault::handle_fault(&address_space, fault_addr, rsp, user, write, not_present) {
            return;
        }
    }

    serial_println!("\n=== PAGE FAULT ===");
    serial_println!("Address: {:?}", addr);
    serial_println!("Error Code: {:?}", error_code);
    serial_println!("  Present: {}", error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION));
    serial_println!("  Write: {}", write);
    serial_println!("  User mode: {}", user);
    serial_println!(
        "  Instruction fetch: {}",
        error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH)
    );

    println!("EXCEPTION: PAGE FAULT");
    println!("Accessed Address: {:?}", addr);
    println!("Error Code: {:?}", error_code);
    println!("{:#?}", stack_frame);
    crate::process::exit_current(-1);
}
