//! ACPI discovery and S5 poweroff.
//!
//! Discovery runs once at boot: find the RSDP, walk the (X)SDT to the FADT,
//! capture the PM1 control ports and pull the S5 sleep type out of the DSDT.
//! The only long-lived state is the handful of values [`poweroff`] needs.

pub mod tables;

use log::{info, warn};
use spinning_top::RwSpinlock;
use x86_64::PhysAddr;
use x86_64::instructions::port::Port;

use crate::memory::phys_to_virt;
use tables::{DEFAULT_SLP_TYP, Fadt, Rsdp, Rsdp2, SLP_TYP_SHIFT, SdtHeader};

/// SCI_EN bit of PM1_CNT: set once ACPI owns power management.
const SCI_EN: u16 = 1 << 0;
/// SLP_EN bit of PM1_CNT: writing it triggers the sleep transition.
const SLP_EN: u16 = 1 << 13;

/// QEMU's isa-debug shutdown port, and the older Bochs one.
const QEMU_SHUTDOWN_PORT: u16 = 0x604;
const BOCHS_SHUTDOWN_PORT: u16 = 0xb004;
const SHUTDOWN_VALUE: u16 = 0x2000;

/// Everything poweroff needs, captured at discovery time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerInfo {
    pub pm1a_cnt: u32,
    pub pm1b_cnt: u32,
    pub slp_typa: u16,
    pub slp_typb: u16,
    pub smi_cmd_port: u32,
    pub acpi_enable_val: u8,
}

static POWER: RwSpinlock<Option<PowerInfo>> = RwSpinlock::new(None);

unsafe fn phys_slice(base: u64, len: usize) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(phys_to_virt(PhysAddr::new(base)).as_ptr(), len) }
}

/// Scan a physical range for the RSDP signature at 16-byte alignment.
unsafe fn find_rsdp_in_range(start: u64, end: u64) -> Option<u64> {
    let mut addr = start & !0xf;
    while addr + 20 <= end {
        let candidate: &[u8; 20] = unsafe { &*(phys_slice(addr, 20).as_ptr() as *const [u8; 20]) };
        if tables::rsdp_valid(candidate) {
            return Some(addr);
        }
        addr += 16;
    }
    None
}

/// Locate the RSDP: the EBDA (segment pointer at physical 0x40E) first, then
/// the BIOS ROM window.
unsafe fn find_rsdp() -> Option<u64> {
    let ebda_segment =
        u16::from_le_bytes(unsafe { phys_slice(0x40e, 2) }.try_into().unwrap()) as u64;
    let ebda = ebda_segment << 4;
    if ebda != 0 {
        if let Some(found) = unsafe { find_rsdp_in_range(ebda, ebda + 0x400) } {
            return Some(found);
        }
    }
    unsafe { find_rsdp_in_range(0xe0000, 0x10_0000) }
}

unsafe fn sdt_at(phys: u64) -> Option<&'static [u8]> {
    let header = unsafe { &*(phys_to_virt(PhysAddr::new(phys)).as_ptr::<SdtHeader>()) };
    let length = header.length as usize;
    if length < core::mem::size_of::<SdtHeader>() {
        return None;
    }
    let bytes = unsafe { phys_slice(phys, length) };
    tables::checksum_ok(bytes).then_some(bytes)
}

/// Walk (X)SDT entries to the FADT and capture the power state.
unsafe fn discover(rsdp_addr: u64) -> Option<PowerInfo> {
    let rsdp = unsafe { &*(phys_to_virt(PhysAddr::new(rsdp_addr)).as_ptr::<Rsdp>()) };

    // Revision 2 with a populated XSDT wins; 8-byte entries instead of 4.
    let (sdt_phys, wide_entries) = if rsdp.revision >= 2 {
        let rsdp2 = unsafe { &*(phys_to_virt(PhysAddr::new(rsdp_addr)).as_ptr::<Rsdp2>()) };
        let xsdt = rsdp2.xsdt_addr;
        if xsdt != 0 {
            (xsdt, true)
        } else {
            (rsdp.rsdt_addr as u64, false)
        }
    } else {
        (rsdp.rsdt_addr as u64, false)
    };

    let sdt = unsafe { sdt_at(sdt_phys) }?;
    let entry_size = if wide_entries { 8 } else { 4 };
    let entries = &sdt[core::mem::size_of::<SdtHeader>()..];

    for entry in entries.chunks_exact(entry_size) {
        let table_phys = if wide_entries {
            u64::from_le_bytes(entry.try_into().unwrap())
        } else {
            u32::from_le_bytes(entry.try_into().unwrap()) as u64
        };

        let signature = unsafe { phys_slice(table_phys, 4) };
        if signature != b"FACP" {
            continue;
        }

        let fadt = unsafe { &*(phys_to_virt(PhysAddr::new(table_phys)).as_ptr::<Fadt>()) };
        let mut power = PowerInfo {
            pm1a_cnt: fadt.pm1a_cnt_blk,
            pm1b_cnt: fadt.pm1b_cnt_blk,
            slp_typa: DEFAULT_SLP_TYP,
            slp_typb: DEFAULT_SLP_TYP,
            smi_cmd_port: fadt.smi_cmd,
            acpi_enable_val: fadt.acpi_enable,
        };

        if fadt.dsdt != 0 {
            if let Some(dsdt) = unsafe { sdt_at(fadt.dsdt as u64) } {
                if let Some((typ_a, typ_b)) = tables::parse_s5(dsdt) {
                    power.slp_typa = typ_a;
                    power.slp_typb = typ_b;
                } else {
                    warn!("acpi: no _S5_ package, using default sleep type");
                }
            }
        }

        return Some(power);
    }
    None
}

/// Run discovery. `rsdp_hint` is the bootloader-provided RSDP physical
/// address; without one the legacy EBDA/BIOS scan runs.
pub fn init(rsdp_hint: Option<u64>) {
    let rsdp_addr = match rsdp_hint {
        Some(addr) => Some(addr),
        None => unsafe { find_rsdp() },
    };

    let Some(rsdp_addr) = rsdp_addr else {
        warn!("acpi: RSDP not found");
        return;
    };

    match unsafe { discover(rsdp_addr) } {
        Some(power) => {
            info!(
                "acpi: PM1a={:#x} PM1b={:#x} SLP_TYPa={:#x}",
                power.pm1a_cnt, power.pm1b_cnt, power.slp_typa
            );
            *POWER.write() = Some(power);
        }
        None => warn!("acpi: FADT not found"),
    }
}

pub fn available() -> bool {
    POWER.read().is_some()
}

/// The captured power state, for diagnostics.
pub fn power_info() -> Option<PowerInfo> {
    *POWER.read()
}

fn short_delay() {
    for _ in 0..10_000 {
        core::hint::spin_loop();
    }
}

/// Enter S5. On success the machine is off and this never returns; returning
/// `false` means every strategy failed.
pub fn poweroff() -> bool {
    x86_64::instructions::interrupts::disable();

    let power = *POWER.read();
    if let Some(power) = power {
        if power.pm1a_cnt != 0 {
            let mut pm1a: Port<u16> = Port::new(power.pm1a_cnt as u16);

            // Hand the SMI path a chance to enable ACPI first.
            unsafe {
                if pm1a.read() & SCI_EN == 0
                    && power.smi_cmd_port != 0
                    && power.acpi_enable_val != 0
                {
                    Port::<u8>::new(power.smi_cmd_port as u16).write(power.acpi_enable_val);
                    for _ in 0..1000 {
                        if pm1a.read() & SCI_EN != 0 {
                            break;
                        }
                        short_delay();
                    }
                }

                pm1a.write(power.slp_typa | SLP_EN);
                short_delay();

                if power.pm1b_cnt != 0 {
                    Port::<u16>::new(power.pm1b_cnt as u16).write(power.slp_typb | SLP_EN);
                    short_delay();
                }

                // Still here: walk the sleep types different firmware uses.
                for slp_typ in [5u16, 7, 0, 6] {
                    pm1a.write((slp_typ << SLP_TYP_SHIFT) | SLP_EN);
                    short_delay();
                    if power.pm1b_cnt != 0 {
                        Port::<u16>::new(power.pm1b_cnt as u16)
                            .write((slp_typ << SLP_TYP_SHIFT) | SLP_EN);
                        short_delay();
                    }
                }
            }
        }
    }

    // Emulator back doors.
    unsafe {
        Port::<u16>::new(QEMU_SHUTDOWN_PORT).write(SHUTDOWN_VALUE);
        Port::<u16>::new(BOCHS_SHUTDOWN_PORT).write(SHUTDOWN_VALUE);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s5_parse_feeds_the_pm1_write_value() {
        // A DSDT fragment with SLP_TYP 5 produces the PM1_CNT image
        // (5 << 10) | SLP_EN.
        let dsdt = [b'_', b'S', b'5', b'_', 0x12, 0x0a, 0x0a, 0x05, 0x0a, 0x05];
        let (typ_a, _) = tables::parse_s5(&dsdt).unwrap();
        assert_eq!(typ_a, 5 << SLP_TYP_SHIFT);
        assert_eq!(typ_a | SLP_EN, (5 << 10) | (1 << 13));
    }

    #[test]
    fn default_sleep_type_matches_the_fallback_contract() {
        assert_eq!(DEFAULT_SLP_TYP, 5 << 10);
    }
}
