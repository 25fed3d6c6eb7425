//! Kernel heap.
//!
//! The heap lives in a physically contiguous run of frames taken from the
//! frame allocator and reached through the HHDM. The boot path requests the
//! frames one by one and verifies contiguity; a fresh bitmap hands out
//! ascending frames, so a hole means the machine is already in trouble and
//! heap-dependent services degrade to their failure paths instead.

use linked_list_allocator::LockedHeap;
use log::{info, warn};

use super::FRAME_SIZE;
use super::address::phys_to_virt;
use super::frame;

/// Frames backing the kernel heap (1 MiB). The contract only needs 16
/// contiguous frames; process records and 16 KiB task stacks want more.
const HEAP_FRAMES: usize = 256;

#[cfg_attr(not(test), global_allocator)]
static HEAP: LockedHeap = LockedHeap::empty();

/// Carve the heap out of the frame allocator.
///
/// Returns `false` when the frames did not come out contiguous, in which
/// case the heap stays empty and every allocation fails.
pub fn init() -> bool {
    let Some(base) = frame::alloc_frame() else {
        warn!("heap: no frames available");
        return false;
    };

    let mut current = base;
    for _ in 1..HEAP_FRAMES {
        let Some(next) = frame::alloc_frame() else {
            warn!("heap: ran out of frames mid-reservation");
            return false;
        };
        if next.as_u64() != current.as_u64() + FRAME_SIZE {
            warn!(
                "heap: frames not contiguous ({:#x} then {:#x}), heap disabled",
                current.as_u64(),
                next.as_u64()
            );
            return false;
        }
        current = next;
    }

    let size = HEAP_FRAMES * FRAME_SIZE as usize;
    unsafe {
        HEAP.lock().init(phys_to_virt(base).as_mut_ptr::<u8>(), size);
    }
    info!("heap: {} KiB at phys {:#x}", size / 1024, base.as_u64());
    true
}
