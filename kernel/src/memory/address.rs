//! Higher-half direct map translation.
//!
//! The bootloader maps all of physical memory at a constant offset in the
//! higher half. Once that offset is captured, any physical address the
//! kernel owns can be reached as `phys + offset` without touching the page
//! tables. The offset stays zero until boot captures it, which keeps the
//! translation an identity for hosted unit tests.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map offset reported by the bootloader.
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// The current direct-map offset.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Translate a physical address into a kernel-reachable virtual address.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + hhdm_offset())
}
