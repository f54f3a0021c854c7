/*
 * Interrupts
 *
 * IDT setup, PIC remap, and the ALARM (timer) vector. The kernel runs with
 * the flat GDT left by the bootstrap environment; only the interrupt side is
 * installed here.
 *
 * The timer handler acknowledges the PIC before entering the scheduler:
 * preemption context-switches away inside the handler, and the EOI must not
 * wait until the interrupted thread is eventually resumed.
 */

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// ALARM is IRQ0 (the PIT) after remap.
pub const ALARM_VECTOR: u8 = PIC_1_OFFSET;

static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt[ALARM_VECTOR].set_handler_fn(alarm_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Unmask only the timer line; everything else stays off.
        pics.write_masks(0b1111_1110, 0b1111_1111);
    }
    log::info!("IDT loaded, PIC remapped to {}..{}", PIC_1_OFFSET, PIC_2_OFFSET + 8);
}

/// ALARM delivery. Ticks the clock, acknowledges the PIC, and hands control
/// to the scheduler when the armed deadline has expired. The scheduler may
/// switch threads here; the interrupted thread finishes this handler and its
/// iretq only when it is eventually switched back in.
extern "x86-interrupt" fn alarm_interrupt_handler(_frame: InterruptStackFrame) {
    let expired = super::timer::on_tick();
    unsafe {
        PICS.lock().notify_end_of_interrupt(ALARM_VECTOR);
    }
    if expired {
        crate::sched::alarm_handler();
    }
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("double fault\n{:#?}", frame);
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, code: u64) {
    panic!("general protection fault (code {:#x})\n{:#?}", code, frame);
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, code: PageFaultErrorCode) {
    let addr = x86_64::registers::control::Cr2::read();
    panic!("page fault at {:?} ({:?})\n{:#?}", addr, code, frame);
}
