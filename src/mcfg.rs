//! ACPI MCFG parsing.
//!
//! Locates the ECAM window (memory-mapped extended configuration space) by
//! walking RSDP → XSDT/RSDT → MCFG. The platform firmware publishes the RSDP
//! through the UEFI configuration table; everything here is plain pointer
//! parsing of the identity-mapped ACPI tables.

use core::mem::size_of;
use core::ptr;

/// One ECAM allocation from the MCFG table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcamRegion {
    pub base: u64,
    pub segment: u16,
    pub start_bus: u8,
    pub end_bus: u8,
}

/// Common system-description-table header (36 bytes).
#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

/// Root System Description Pointer (ACPI 2.0+ layout).
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

/// MCFG configuration-space allocation entry (16 bytes).
#[repr(C, packed)]
struct McfgEntry {
    base_address: u64,
    segment_group: u16,
    start_bus: u8,
    end_bus: u8,
    _reserved: u32,
}

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const MCFG_SIGNATURE: &[u8; 4] = b"MCFG";

/// MCFG header: SDT header plus 8 reserved bytes.
const MCFG_HEADER_LEN: usize = size_of::<SdtHeader>() + 8;

unsafe fn checksum_ok(ptr: *const u8, len: usize) -> bool {
    let mut sum = 0u8;
    for i in 0..len {
        sum = sum.wrapping_add(unsafe { ptr.add(i).read() });
    }
    sum == 0
}

/// Validate an SDT at `addr` against `signature` and its own checksum.
unsafe fn validate_sdt(addr: *const u8, signature: &[u8; 4]) -> Option<u32> {
    let header = unsafe { ptr::read_unaligned(addr.cast::<SdtHeader>()) };
    if &header.signature != signature {
        return None;
    }
    let length = header.length;
    if (length as usize) < size_of::<SdtHeader>() {
        return None;
    }
    if !unsafe { checksum_ok(addr, length as usize) } {
        return None;
    }
    Some(length)
}

unsafe fn parse_mcfg(addr: *const u8, segment: u16, bus: u8) -> Option<EcamRegion> {
    let length = unsafe { validate_sdt(addr, MCFG_SIGNATURE)? } as usize;
    if length < MCFG_HEADER_LEN {
        return None;
    }
    let count = (length - MCFG_HEADER_LEN) / size_of::<McfgEntry>();
    let entries = unsafe { addr.add(MCFG_HEADER_LEN) }.cast::<McfgEntry>();
    for i in 0..count {
        let entry = unsafe { ptr::read_unaligned(entries.add(i)) };
        if entry.segment_group == segment && entry.start_bus <= bus && bus <= entry.end_bus {
            return Some(EcamRegion {
                base: entry.base_address,
                segment: entry.segment_group,
                start_bus: entry.start_bus,
                end_bus: entry.end_bus,
            });
        }
    }
    None
}

/// Walk the root table (XSDT with 64-bit entries, or RSDT with 32-bit ones)
/// looking for an MCFG covering `segment`/`bus`.
unsafe fn scan_root(root: *const u8, entry_width: usize, segment: u16, bus: u8) -> Option<EcamRegion> {
    let header = unsafe { ptr::read_unaligned(root.cast::<SdtHeader>()) };
    let length = header.length as usize;
    if length < size_of::<SdtHeader>() || !unsafe { checksum_ok(root, length) } {
        return None;
    }
    let count = (length - size_of::<SdtHeader>()) / entry_width;
    let entries = unsafe { root.add(size_of::<SdtHeader>()) };
    for i in 0..count {
        let table = unsafe {
            if entry_width == 8 {
                ptr::read_unaligned(entries.add(i * 8).cast::<u64>())
            } else {
                ptr::read_unaligned(entries.add(i * 4).cast::<u32>()) as u64
            }
        };
        if table == 0 {
            continue;
        }
        if let Some(region) = unsafe { parse_mcfg(table as *const u8, segment, bus) } {
            return Some(region);
        }
    }
    None
}

/// Find the ECAM region decoding `bus` in `segment`, starting from the RSDP.
///
/// # Safety
/// `rsdp` must point at the platform's RSDP, and all ACPI tables it
/// references must be identity-mapped and readable, as they are in the
/// pre-boot environment.
pub unsafe fn find_ecam(rsdp: *const u8, segment: u16, bus: u8) -> Option<EcamRegion> {
    let rsdp_struct = unsafe { ptr::read_unaligned(rsdp.cast::<Rsdp>()) };
    if &rsdp_struct.signature != RSDP_SIGNATURE {
        return None;
    }
    // The first 20 bytes are the ACPI 1.0 structure with its own checksum.
    if !unsafe { checksum_ok(rsdp, 20) } {
        return None;
    }
    if rsdp_struct.revision >= 2 && rsdp_struct.xsdt_address != 0 {
        let len = rsdp_struct.length as usize;
        if len >= size_of::<Rsdp>() && !unsafe { checksum_ok(rsdp, len) } {
            return None;
        }
        unsafe { scan_root(rsdp_struct.xsdt_address as *const u8, 8, segment, bus) }
    } else {
        unsafe { scan_root(rsdp_struct.rsdt_address as *const u8, 4, segment, bus) }
    }
}
