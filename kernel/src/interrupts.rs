//! Interrupt descriptor table and handlers.
//!
//! CPU exceptions report their vector, error code and faulting RIP, then
//! halt; there is no recovery path. IRQ 0 drives the tick counter and the
//! preemptive scheduler. The syscall gate at 0x80 is registered by the
//! syscall layer through [`with_idt`] before the table is loaded.

use core::arch::asm;

use log::{error, info};
use spinning_top::RwSpinlock;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::pic;
use crate::scheduler;
use crate::time;

static DESCRIPTOR_TABLE: RwSpinlock<InterruptDescriptorTable> =
    RwSpinlock::new(InterruptDescriptorTable::new());

/// Vector the timer IRQ lands on after the PIC remap.
const TIMER_VECTOR: u8 = pic::PIC1_OFFSET;

/// Mutate the descriptor table. The table memory is static, so entries
/// written after `load` take effect immediately as well.
pub fn with_idt(f: impl FnOnce(&mut InterruptDescriptorTable)) {
    f(&mut DESCRIPTOR_TABLE.write());
}

/// Install the exception and IRQ handlers and load the table. Interrupts
/// stay disabled; the boot path enables them once every subsystem is up.
pub fn init() {
    {
        let mut idt = DESCRIPTOR_TABLE.write();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.general_protection_fault.set_handler_fn(gpf_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);
    }

    unsafe {
        (*DESCRIPTOR_TABLE.data_ptr()).load();
    }
    info!("IDT loaded");
}

/// Disable interrupts and halt forever; the terminal state after a fault.
fn halt() -> ! {
    loop {
        unsafe {
            asm!("cli", "hlt");
        }
    }
}

/// Report a fatal exception the way the fault screen expects: vector, error
/// code, faulting instruction.
fn fatal(vector: u8, error_code: u64, frame: &InterruptStackFrame) -> ! {
    error!(
        "EXCEPTION: INT={:#04x} ERR={:#018x} RIP={:#018x}",
        vector,
        error_code,
        frame.instruction_pointer.as_u64()
    );
    halt();
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    fatal(0x00, 0, &frame);
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    info!("BREAKPOINT at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    fatal(0x06, 0, &frame);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    fatal(0x08, error_code, &frame);
}

extern "x86-interrupt" fn gpf_handler(frame: InterruptStackFrame, error_code: u64) {
    fatal(0x0d, error_code, &frame);
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    error!("page fault address: {:?}", Cr2::read());
    fatal(0x0e, error_code.bits(), &frame);
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    time::tick();
    pic::end_of_interrupt(0);
    scheduler::schedule();
}
