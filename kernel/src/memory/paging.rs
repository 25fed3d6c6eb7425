//! Page-table walking and mapping.
//!
//! The mapper works on the live 4-level table through the HHDM: an entry's
//! physical target plus the direct-map offset is always a dereferenceable
//! kernel pointer. Missing intermediate tables are allocated from the frame
//! allocator and zero-initialised before they become reachable.

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use super::address::phys_to_virt;
use super::frame;

/// Why a mapping attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// An intermediate table could not be allocated.
    OutOfFrames,
}

/// A page-table hierarchy rooted at a physical PML4 address.
pub struct AddressSpace {
    root: PhysAddr,
}

impl AddressSpace {
    /// The address space currently loaded in CR3.
    pub fn current() -> Self {
        Self {
            root: Cr3::read().0.start_address(),
        }
    }

    /// Wrap an existing PML4.
    pub fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    fn root_table(&mut self) -> &mut PageTable {
        unsafe { &mut *phys_to_virt(self.root).as_mut_ptr() }
    }

    /// Install a 4 KiB mapping `virt -> phys` with the given leaf flags.
    ///
    /// Intermediate tables are created with {present, writable, user} so the
    /// leaf flags alone decide the effective permissions.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let mut alloc = || frame::alloc_frame();
        self.map_page_with(virt, phys, flags, &mut alloc)
    }

    /// Mapping walk with an explicit frame source.
    pub fn map_page_with(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<(), MapError> {
        debug_assert!(virt.is_aligned(4096u64), "virtual address not page-aligned");
        debug_assert!(phys.is_aligned(4096u64), "physical address not page-aligned");

        let l4 = self.root_table();
        let l3 = next_table(&mut l4[virt.p4_index()], alloc)?;
        let l2 = next_table(&mut l3[virt.p3_index()], alloc)?;
        let l1 = next_table(&mut l2[virt.p2_index()], alloc)?;
        l1[virt.p1_index()].set_addr(phys, flags);

        #[cfg(not(test))]
        x86_64::instructions::tlb::flush(virt);

        Ok(())
    }

    /// Walk the hierarchy without allocating. Returns the leaf target for a
    /// mapped address.
    pub fn translate(&mut self, virt: VirtAddr) -> Option<PhysAddr> {
        let l4 = self.root_table();
        let l3 = follow(&l4[virt.p4_index()])?;
        let l2 = follow(&l3[virt.p3_index()])?;
        let l1 = follow(&l2[virt.p2_index()])?;
        let entry = &l1[virt.p1_index()];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            Some(entry.addr() + u64::from(virt.page_offset()))
        } else {
            None
        }
    }
}

/// Follow a present entry to the table it points at.
fn follow(entry: &PageTableEntry) -> Option<&mut PageTable> {
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(unsafe { &mut *phys_to_virt(entry.addr()).as_mut_ptr() })
}

/// Follow a present entry, or allocate, zero and install a new table.
fn next_table<'a>(
    entry: &'a mut PageTableEntry,
    alloc: &mut dyn FnMut() -> Option<PhysAddr>,
) -> Result<&'a mut PageTable, MapError> {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        // Masking out the flag bits recovers the physical table address.
        return Ok(unsafe { &mut *phys_to_virt(entry.addr()).as_mut_ptr() });
    }

    let frame = alloc().ok_or(MapError::OutOfFrames)?;
    let table: &mut PageTable = unsafe { &mut *phys_to_virt(frame).as_mut_ptr() };
    table.zero();
    entry.set_addr(
        frame,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
    );
    Ok(table)
}
