//! Memory management.
//!
//! - `address`: the higher-half direct map (HHDM) translation
//! - `bitmap`/`frame`: the physical frame allocator
//! - `paging`: 4-level page-table walking and mapping
//! - `heap`: the kernel heap backing `alloc`

mod address;
mod bitmap;
pub mod frame;
pub mod heap;
pub mod paging;

pub use address::{hhdm_offset, phys_to_virt, set_hhdm_offset};
pub use frame::{alloc_frame, free_frame, free_memory, total_memory};
pub use paging::{AddressSpace, MapError};

/// Size of a physical frame and of a mapped page.
pub const FRAME_SIZE: u64 = 4096;
