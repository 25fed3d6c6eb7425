//! Physical frame allocator.
//!
//! Owns every usable 4 KiB frame reported by the bootloader's memory map.
//! The allocator is a single bitmap sized to cover the highest usable frame;
//! the bitmap's own storage is carved out of the first usable region large
//! enough to hold it and reached through the HHDM.

use limine::memmap::{Entry, MEMMAP_USABLE};
use log::info;
use spinning_top::Spinlock;
use x86_64::PhysAddr;

use super::FRAME_SIZE;
use super::address::phys_to_virt;
use super::bitmap::Bitmap;

static FRAME_ALLOCATOR: Spinlock<Option<FrameAllocator>> = Spinlock::new(None);

pub struct FrameAllocator {
    bitmap: Bitmap<'static>,
    free_frames: usize,
    total_usable: u64,
}

impl FrameAllocator {
    /// Allocate the lowest free frame.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        let frame = self.bitmap.alloc_lowest()?;
        self.free_frames -= 1;
        Some(PhysAddr::new(frame as u64 * FRAME_SIZE))
    }

    /// Return a frame to the free set.
    pub fn free(&mut self, frame: PhysAddr) {
        let bit = (frame.as_u64() / FRAME_SIZE) as usize;
        debug_assert!(
            self.bitmap.is_set(bit),
            "double free of frame {:#x}",
            frame.as_u64()
        );
        self.bitmap.clear(bit);
        self.free_frames += 1;
    }

    pub fn free_memory(&self) -> u64 {
        self.free_frames as u64 * FRAME_SIZE
    }

    pub fn total_memory(&self) -> u64 {
        self.total_usable
    }
}

/// Build the allocator from the bootloader memory map.
///
/// # Safety
/// Must run exactly once, before any frame is handed out, with the HHDM
/// offset already captured. The chosen bitmap region is written through the
/// direct map.
pub unsafe fn init(entries: &[&Entry]) {
    let highest = entries
        .iter()
        .filter(|e| e.type_ == MEMMAP_USABLE)
        .map(|e| e.base + e.length)
        .max()
        .expect("memory map contains no usable memory");

    let frame_count = (highest / FRAME_SIZE) as usize;
    let words = Bitmap::words_for(frame_count);
    let bitmap_bytes = (words * 8) as u64;

    // First usable region that can hold the bitmap itself.
    let storage_base = entries
        .iter()
        .filter(|e| e.type_ == MEMMAP_USABLE)
        .find(|e| e.length >= bitmap_bytes)
        .map(|e| e.base)
        .expect("no usable region large enough for the frame bitmap");

    let storage = unsafe {
        core::slice::from_raw_parts_mut(
            phys_to_virt(PhysAddr::new(storage_base)).as_mut_ptr::<u64>(),
            words,
        )
    };
    let mut bitmap = Bitmap::new(storage, frame_count);

    // Everything starts allocated; usable ranges are then released.
    bitmap.fill();
    let mut total_usable = 0u64;
    let mut free_frames = 0usize;
    for entry in entries
        .iter()
        .filter(|e| e.type_ == MEMMAP_USABLE)
    {
        total_usable += entry.length;
        let first = entry.base / FRAME_SIZE;
        let last = (entry.base + entry.length) / FRAME_SIZE;
        for frame in first..last {
            bitmap.clear(frame as usize);
            free_frames += 1;
        }
    }

    // Re-reserve the frames occupied by the bitmap's own storage.
    let first = storage_base / FRAME_SIZE;
    let last = (storage_base + bitmap_bytes).div_ceil(FRAME_SIZE);
    for frame in first..last {
        if !bitmap.is_set(frame as usize) {
            bitmap.set(frame as usize);
            free_frames -= 1;
        }
    }

    info!(
        "frame allocator: {} MiB usable, {} frames tracked",
        total_usable / 1024 / 1024,
        frame_count
    );

    *FRAME_ALLOCATOR.lock() = Some(FrameAllocator {
        bitmap,
        free_frames,
        total_usable,
    });
}

/// Allocate one 4 KiB frame. `None` when physical memory is exhausted.
pub fn alloc_frame() -> Option<PhysAddr> {
    FRAME_ALLOCATOR.lock().as_mut()?.alloc()
}

/// Release a frame previously returned by [`alloc_frame`].
pub fn free_frame(frame: PhysAddr) {
    if let Some(allocator) = FRAME_ALLOCATOR.lock().as_mut() {
        allocator.free(frame);
    }
}

/// Bytes currently free.
pub fn free_memory() -> u64 {
    FRAME_ALLOCATOR
        .lock()
        .as_ref()
        .map_or(0, FrameAllocator::free_memory)
}

/// Bytes of usable RAM at boot.
pub fn total_memory() -> u64 {
    FRAME_ALLOCATOR
        .lock()
        .as_ref()
        .map_or(0, FrameAllocator::total_memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with_frames(count: usize) -> FrameAllocator {
        let words = Bitmap::words_for(count);
        let storage = alloc::vec![0u64; words].leak();
        FrameAllocator {
            bitmap: Bitmap::new(storage, count),
            free_frames: count,
            total_usable: count as u64 * FRAME_SIZE,
        }
    }

    #[test]
    fn frames_come_out_lowest_first_and_page_aligned() {
        let mut allocator = allocator_with_frames(8);
        let first = allocator.alloc().unwrap();
        let second = allocator.alloc().unwrap();
        assert_eq!(first.as_u64(), 0);
        assert_eq!(second.as_u64(), FRAME_SIZE);
        assert_eq!(second.as_u64() % FRAME_SIZE, 0);
    }

    #[test]
    fn freeing_makes_the_frame_reusable() {
        let mut allocator = allocator_with_frames(4);
        let a = allocator.alloc().unwrap();
        let _b = allocator.alloc().unwrap();
        allocator.free(a);
        assert_eq!(allocator.alloc(), Some(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut allocator = allocator_with_frames(2);
        assert!(allocator.alloc().is_some());
        assert!(allocator.alloc().is_some());
        assert_eq!(allocator.alloc(), None);
        assert_eq!(allocator.free_memory(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_detected() {
        let mut allocator = allocator_with_frames(2);
        let frame = allocator.alloc().unwrap();
        allocator.free(frame);
        allocator.free(frame);
    }

    #[test]
    fn accounting_tracks_alloc_and_free() {
        let mut allocator = allocator_with_frames(4);
        let total = allocator.total_memory();
        assert_eq!(allocator.free_memory(), total);
        let frame = allocator.alloc().unwrap();
        assert_eq!(allocator.free_memory(), total - FRAME_SIZE);
        allocator.free(frame);
        assert_eq!(allocator.free_memory(), total);
    }
}
