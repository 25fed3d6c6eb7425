//! Legacy 8259 PIC: remap, masking and end-of-interrupt.
//!
//! The kernel core only needs the narrow contract "remap away from the
//! exception vectors" and "send EOI"; everything else about the chip stays
//! here.

use x86_64::instructions::port::Port;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xa0;
const PIC2_DATA: u16 = 0xa1;

/// Vector base for IRQ 0..7 after remapping.
pub const PIC1_OFFSET: u8 = 0x20;
/// Vector base for IRQ 8..15 after remapping.
pub const PIC2_OFFSET: u8 = 0x28;

const EOI: u8 = 0x20;

/// Remap both PICs above the CPU exception range and unmask the timer line.
pub fn init() {
    unsafe {
        let mut cmd1 = Port::<u8>::new(PIC1_COMMAND);
        let mut cmd2 = Port::<u8>::new(PIC2_COMMAND);
        let mut data1 = Port::<u8>::new(PIC1_DATA);
        let mut data2 = Port::<u8>::new(PIC2_DATA);

        // ICW1: initialise, expect ICW4.
        cmd1.write(0x11);
        cmd2.write(0x11);
        // ICW2: vector offsets.
        data1.write(PIC1_OFFSET);
        data2.write(PIC2_OFFSET);
        // ICW3: wiring (slave on IRQ2).
        data1.write(0x04);
        data2.write(0x02);
        // ICW4: 8086 mode.
        data1.write(0x01);
        data2.write(0x01);

        // Mask everything except the timer (IRQ 0) and the cascade (IRQ 2).
        data1.write(!0b0000_0101);
        data2.write(0xff);
    }
    log::debug!("PIC remapped to {:#x}/{:#x}", PIC1_OFFSET, PIC2_OFFSET);
}

/// Acknowledge an interrupt on the given IRQ line.
pub fn end_of_interrupt(irq: u8) {
    unsafe {
        if irq >= 8 {
            Port::<u8>::new(PIC2_COMMAND).write(EOI);
        }
        Port::<u8>::new(PIC1_COMMAND).write(EOI);
    }
}
