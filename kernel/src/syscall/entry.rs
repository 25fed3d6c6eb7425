//! The `int 0x80` software-interrupt gate.
//!
//! The naked stub preserves the caller's scratch registers, moves the
//! syscall arguments into the SysV argument registers and calls the
//! dispatcher. The result comes back in `rax`, which is deliberately not
//! restored. Register contract: `rax` = number, `rdi`/`rsi`/`rdx` = args.

use core::arch::naked_asm;

use x86_64::PrivilegeLevel;
use x86_64::VirtAddr;

/// Interrupt vector for syscalls.
pub const SYSCALL_VECTOR: u8 = 0x80;

#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        // Interrupt frames leave rsp 8 off the SysV call alignment.
        "sub rsp, 8",
        // dispatch(number, arg1, arg2, arg3)
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",
        "add rsp, 8",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "iretq",
        dispatch = sym super::dispatch,
    )
}

/// Register the gate in the IDT with user privilege so `int 0x80` works from
/// ring 3.
pub fn init() {
    crate::interrupts::with_idt(|idt| {
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(syscall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
    });
    log::debug!("syscall gate installed at vector {:#x}", SYSCALL_VECTOR);
}
