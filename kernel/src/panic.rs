//! Kernel panic handling: report over serial, then park the CPU for good.

#[panic_handler]
#[cfg(not(test))]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // No interrupt may preempt the report or wake the halted CPU back up.
    x86_64::instructions::interrupts::disable();

    match info.location() {
        Some(location) => log::error!(
            "kernel panic at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        ),
        None => log::error!("kernel panic: {}", info.message()),
    }
    log::error!("uptime {} ticks, halting", crate::time::ticks());

    loop {
        x86_64::instructions::hlt();
    }
}
