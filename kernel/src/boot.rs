//! Limine boot protocol glue and the kernel entry point.
//!
//! The request statics are answered by the bootloader before `kmain` runs:
//! framebuffer, HHDM offset, memory map, the UniFS image as module 0 and the
//! RSDP. `kmain` brings the subsystems up in dependency order and then
//! settles into the main polling loop.

use limine::request::{FramebufferRequest, HhdmRequest, MemmapRequest, ModulesRequest, RsdpRequest};
use limine::{BaseRevision, RequestsEndMarker, RequestsStartMarker};

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemmapRequest = MemmapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MODULE_REQUEST: ModulesRequest = ModulesRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

#[used]
#[unsafe(link_section = ".requests_end_marker")]
static END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// The boot framebuffer, for the display collaborator. XRGB8888 pixels.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub width: u64,
    pub height: u64,
    /// Bytes per scanline.
    pub pitch: u64,
}

static FRAMEBUFFER: spinning_top::RwSpinlock<Option<FramebufferInfo>> =
    spinning_top::RwSpinlock::new(None);

/// The framebuffer captured at boot, if the loader provided one.
pub fn framebuffer() -> Option<FramebufferInfo> {
    *FRAMEBUFFER.read()
}

#[cfg(not(test))]
fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Kernel entry point, called by Limine with a 64 KiB boot stack.
#[cfg(not(test))]
#[unsafe(no_mangle)]
unsafe extern "C" fn kmain() -> ! {
    use log::{info, warn};

    use crate::devices::hid;
    use crate::memory;
    use crate::vfs::unifs;

    if !BASE_REVISION.is_supported() {
        halt();
    }

    crate::logging::init();
    info!("ursa booting");

    // Memory first: everything after the heap may allocate.
    let Some(hhdm) = HHDM_REQUEST.response() else {
        halt();
    };
    memory::set_hhdm_offset(hhdm.offset);

    let Some(memory_map) = MEMORY_MAP_REQUEST.response() else {
        halt();
    };
    unsafe {
        memory::frame::init(memory_map.entries());
    }
    if !memory::heap::init() {
        warn!("continuing without a kernel heap");
    }

    crate::init();

    if let Some(framebuffers) = FRAMEBUFFER_REQUEST.response() {
        if let Some(fb) = framebuffers.framebuffers().first() {
            *FRAMEBUFFER.write() = Some(FramebufferInfo {
                addr: fb.address() as u64,
                width: fb.width,
                height: fb.height,
                pitch: fb.pitch,
            });
            info!("framebuffer {}x{}", fb.width, fb.height);
        }
    }

    // Module 0 is the filesystem image.
    match MODULE_REQUEST.response() {
        Some(modules) if !modules.modules().is_empty() => {
            let module = modules.modules()[0];
            unifs::mount(module.data());
        }
        _ => warn!("no boot module, filesystem not mounted"),
    }

    // Limine reports the RSDP inside the direct map; discovery wants the
    // physical address.
    let rsdp_hint = RSDP_REQUEST.response().map(|response| {
        let addr = response.address as u64;
        addr.checked_sub(memory::hhdm_offset()).unwrap_or(addr)
    });
    crate::acpi::init(rsdp_hint);

    x86_64::instructions::interrupts::enable();
    info!("boot complete, entering main loop");

    // The HID layer polls here once an xHCI driver registers itself; the
    // shell collaborator drains the character ring the same way.
    loop {
        hid::poll();
        while let Some(c) = hid::keyboard_get_char() {
            crate::devices::display::write(&[c]);
        }
        x86_64::instructions::hlt();
    }
}
