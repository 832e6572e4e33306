//! BAR sizing, address assignment, and programming.
//!
//! Three strictly separated phases over the discovered chain:
//!
//! 1. probe every BAR's size (all-ones write, read back, two's complement),
//! 2. compute assignments from one monotonic cursor per address space (a
//!    pure function of the probed sizes and traversal order),
//! 3. write BAR values leaf-to-root and bridge windows root-to-leaf, so no
//!    function ever sits behind a transiently invalid window.
//!
//! Nothing the firmware left in the registers is trusted: sizes are
//! re-probed and assignments re-derived from fresh cursors on every pass.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::access::{ConfigAccess, ConfigAddress, reg};
use crate::error::{BringUpError, Result};
use crate::topology::Chain;

/// Low type bits of a memory BAR.
const BAR_MEM_MASK: u32 = !0xf;
/// Low type bits of an I/O BAR.
const BAR_IO_MASK: u32 = !0x3;
/// Address bits of an expansion-ROM BAR (bit 0 is the enable bit).
const ROM_ADDR_MASK: u32 = 0xffff_f800;
const ROM_ENABLE: u32 = 0x1;

/// Bridge memory windows decode at 1 MiB granularity, I/O windows at 4 KiB.
const WINDOW_MEM_GRANULARITY: u64 = 0x10_0000;
const WINDOW_IO_GRANULARITY: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Memory32 { prefetchable: bool },
    Memory64 { prefetchable: bool },
    Io,
    ExpansionRom,
}

/// A half-open address range `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
}

impl AddressRange {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// One BAR with its probed size and, after assignment, its base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarDescriptor {
    /// BAR slot index (6 for the expansion ROM).
    pub index: u8,
    /// Config-space offset of the (low) register.
    pub offset: u16,
    pub kind: BarKind,
    /// Power of two, probed, never assumed.
    pub size: u64,
    pub assigned: Option<u64>,
}

impl BarDescriptor {
    pub fn range(&self) -> Option<AddressRange> {
        self.assigned.map(|base| AddressRange {
            base,
            size: self.size,
        })
    }
}

/// One allocatable address window of the target platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    pub base: u64,
    pub size: u64,
}

/// The windows the engine may hand out, per address space.
#[derive(Debug, Clone, Copy)]
pub struct AllocationWindows {
    /// 32-bit non-prefetchable memory; also hosts expansion-ROM BARs.
    pub mmio32: AddressWindow,
    /// 64-bit / prefetchable memory.
    pub mmio64: AddressWindow,
    pub io: AddressWindow,
}

// ---------------------------------------------------------------------------
// Phase 1: probing

fn pow2_or_skip(size: u64, addr: ConfigAddress, index: u8) -> Option<u64> {
    if size != 0 && size.is_power_of_two() {
        Some(size)
    } else {
        warn!("{addr} BAR{index}: probe yields non-power-of-two size {size:#x}, skipping");
        None
    }
}

fn probe_function_bars<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
    count: u8,
) -> Result<Vec<BarDescriptor>> {
    let mut bars = Vec::new();
    let mut index = 0u8;
    while index < count {
        let offset = reg::BAR0 + 4 * index as u16;
        access.write32(addr, offset, 0xffff_ffff)?;
        let probe = access.read32(addr, offset)?;
        if probe == 0 {
            index += 1;
            continue;
        }
        if probe & 0x1 != 0 {
            // I/O BAR. Devices commonly hardwire the upper half to zero, in
            // which case only the low 16 bits take part in sizing.
            let mut mask = probe & BAR_IO_MASK;
            if mask & 0xffff_0000 == 0 {
                mask |= 0xffff_0000;
            }
            let size = (!mask).wrapping_add(1) as u64;
            if let Some(size) = pow2_or_skip(size, addr, index) {
                bars.push(BarDescriptor {
                    index,
                    offset,
                    kind: BarKind::Io,
                    size,
                    assigned: None,
                });
            }
            index += 1;
            continue;
        }
        let is_64bit = probe >> 1 & 0x3 == 0x2;
        let prefetchable = probe & 0x8 != 0;
        if is_64bit {
            if index + 1 >= count {
                warn!("{addr} BAR{index}: 64-bit BAR in last slot, skipping");
                break;
            }
            access.write32(addr, offset + 4, 0xffff_ffff)?;
            let probe_hi = access.read32(addr, offset + 4)?;
            let mask = (probe_hi as u64) << 32 | (probe & BAR_MEM_MASK) as u64;
            let size = (!mask).wrapping_add(1);
            if let Some(size) = pow2_or_skip(size, addr, index) {
                bars.push(BarDescriptor {
                    index,
                    offset,
                    kind: BarKind::Memory64 { prefetchable },
                    size,
                    assigned: None,
                });
            }
            index += 2;
        } else {
            let mask = probe & BAR_MEM_MASK;
            let size = ((!mask).wrapping_add(1)) as u64;
            if let Some(size) = pow2_or_skip(size, addr, index) {
                bars.push(BarDescriptor {
                    index,
                    offset,
                    kind: BarKind::Memory32 { prefetchable },
                    size,
                    assigned: None,
                });
            }
            index += 1;
        }
    }
    Ok(bars)
}

fn probe_rom_bar<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
    offset: u16,
) -> Result<Option<BarDescriptor>> {
    access.write32(addr, offset, ROM_ADDR_MASK)?;
    let probe = access.read32(addr, offset)?;
    let mask = probe & ROM_ADDR_MASK;
    if mask == 0 {
        return Ok(None);
    }
    let size = (!mask).wrapping_add(1) as u64;
    let Some(size) = pow2_or_skip(size, addr, 6) else {
        return Ok(None);
    };
    Ok(Some(BarDescriptor {
        index: 6,
        offset,
        kind: BarKind::ExpansionRom,
        size,
        assigned: None,
    }))
}

/// Probe every function on the chain: the bridges' own BARs (two type-1
/// slots) and the endpoints' six BARs plus expansion ROM.
pub fn probe_chain<A: ConfigAccess + ?Sized>(access: &mut A, chain: &mut Chain) -> Result<()> {
    for bridge in chain.bridges_mut() {
        bridge.bars = probe_function_bars(access, bridge.address, 2)?;
    }
    for endpoint in &mut chain.endpoints {
        endpoint.bars = probe_function_bars(access, endpoint.address, 6)?;
        endpoint.rom_bar = probe_rom_bar(access, endpoint.address, reg::ROM_BAR_TYPE0)?;
        debug!(
            "{}: {} BARs, ROM {}",
            endpoint.address,
            endpoint.bars.len(),
            if endpoint.rom_bar.is_some() { "present" } else { "absent" },
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Phase 2: assignment

struct Cursor {
    next: u64,
    limit: u64,
}

impl Cursor {
    fn new(window: AddressWindow) -> Self {
        Self {
            next: window.base,
            limit: window.base + window.size,
        }
    }

    /// Align up to `size` (the BAR's required alignment), hand out the
    /// range, and advance past it.
    fn take(&mut self, size: u64) -> Result<u64> {
        let base = self
            .next
            .checked_add(size - 1)
            .map(|v| v & !(size - 1))
            .ok_or(BringUpError::AddressSpaceExhausted)?;
        let end = base
            .checked_add(size)
            .ok_or(BringUpError::AddressSpaceExhausted)?;
        if end > self.limit {
            return Err(BringUpError::AddressSpaceExhausted);
        }
        self.next = end;
        Ok(base)
    }
}

/// The address space a BAR allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Mem32,
    Mem64,
    Io,
}

fn space_of(kind: BarKind) -> Space {
    match kind {
        BarKind::Memory32 { .. } | BarKind::ExpansionRom => Space::Mem32,
        BarKind::Memory64 { .. } => Space::Mem64,
        BarKind::Io => Space::Io,
    }
}

fn union(ranges: impl Iterator<Item = AddressRange>) -> Option<AddressRange> {
    let mut acc: Option<(u64, u64)> = None;
    for r in ranges {
        acc = Some(match acc {
            None => (r.base, r.end()),
            Some((lo, hi)) => (lo.min(r.base), hi.max(r.end())),
        });
    }
    acc.map(|(lo, hi)| AddressRange {
        base: lo,
        size: hi - lo,
    })
}

fn align_window(range: AddressRange, granularity: u64) -> AddressRange {
    let base = range.base & !(granularity - 1);
    let end = range.end().div_ceil(granularity) * granularity;
    AddressRange {
        base,
        size: end - base,
    }
}

/// Defensive verification of the invariants the allocator is supposed to
/// uphold: per space, assignments are pairwise disjoint and naturally
/// aligned. Should be unreachable; a hit is a defect.
fn verify_assignments(chain: &Chain) -> Result<()> {
    let mut seen: Vec<(Space, AddressRange)> = Vec::new();
    for bar in all_bars(chain) {
        let Some(range) = bar.range() else { continue };
        if range.base % bar.size != 0 {
            return Err(BringUpError::BarOverlap);
        }
        let space = space_of(bar.kind);
        if seen
            .iter()
            .any(|(s, r)| *s == space && r.overlaps(&range))
        {
            return Err(BringUpError::BarOverlap);
        }
        seen.push((space, range));
    }
    Ok(())
}

fn all_bars(chain: &Chain) -> impl Iterator<Item = &BarDescriptor> {
    chain
        .bridges()
        .flat_map(|b| b.bars.iter())
        .chain(chain.endpoints.iter().flat_map(|e| e.bars.iter()))
        .chain(chain.endpoints.iter().filter_map(|e| e.rom_bar.as_ref()))
}

/// Assign every probed BAR an address and derive each bridge's windows.
///
/// Deterministic traversal order: bridges root-to-leaf (their own BARs),
/// then endpoints in discovery order, BAR index order within a function.
pub fn assign(chain: &mut Chain, windows: &AllocationWindows) -> Result<()> {
    let mut mem32 = Cursor::new(windows.mmio32);
    let mut mem64 = Cursor::new(windows.mmio64);
    let mut io = Cursor::new(windows.io);

    {
        let mut take = |bar: &mut BarDescriptor| -> Result<()> {
            let cursor = match space_of(bar.kind) {
                Space::Mem32 => &mut mem32,
                Space::Mem64 => &mut mem64,
                Space::Io => &mut io,
            };
            bar.assigned = Some(cursor.take(bar.size)?);
            Ok(())
        };
        for bridge in chain.bridges_mut() {
            for bar in &mut bridge.bars {
                take(bar)?;
            }
        }
        for endpoint in &mut chain.endpoints {
            for bar in &mut endpoint.bars {
                take(bar)?;
            }
            if let Some(rom) = &mut endpoint.rom_bar {
                take(rom)?;
            }
        }
    }

    verify_assignments(chain)?;

    // Each bridge's window encloses exactly the assignments strictly below
    // it: deeper bridges' own BARs plus the endpoints. The bridge's own BARs
    // live in its parent's window.
    let endpoint_ranges: Vec<(Space, AddressRange)> = chain
        .endpoints
        .iter()
        .flat_map(|e| e.bars.iter().chain(e.rom_bar.as_ref()))
        .filter_map(|bar| bar.range().map(|r| (space_of(bar.kind), r)))
        .collect();
    let switch_ranges: Vec<(usize, Space, AddressRange)> = chain
        .switches
        .iter()
        .enumerate()
        .flat_map(|(i, b)| {
            b.bars
                .iter()
                .filter_map(move |bar| bar.range().map(|r| (i + 1, space_of(bar.kind), r)))
        })
        .collect();

    let levels = chain.depth() + 1;
    for level in 0..levels {
        let downstream = |space: Space| {
            let from_switches = switch_ranges
                .iter()
                .filter(move |(l, s, _)| *l > level && *s == space)
                .map(|(_, _, r)| *r);
            let from_endpoints = endpoint_ranges
                .iter()
                .filter(move |(s, _)| *s == space)
                .map(|(_, r)| *r);
            from_switches.chain(from_endpoints)
        };
        let mem = union(downstream(Space::Mem32)).map(|r| align_window(r, WINDOW_MEM_GRANULARITY));
        let pref = union(downstream(Space::Mem64)).map(|r| align_window(r, WINDOW_MEM_GRANULARITY));
        let io_w = union(downstream(Space::Io)).map(|r| align_window(r, WINDOW_IO_GRANULARITY));

        let bridge = if level == 0 {
            &mut chain.root_port
        } else {
            &mut chain.switches[level - 1]
        };
        bridge.mem_window = mem;
        bridge.pref_window = pref;
        bridge.io_window = io_w;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Phase 3: programming

fn program_function_bars<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
    bars: &[BarDescriptor],
) -> Result<()> {
    for bar in bars {
        let Some(base) = bar.assigned else { continue };
        match bar.kind {
            BarKind::Memory32 { .. } | BarKind::Io => {
                access.write32(addr, bar.offset, base as u32)?;
            }
            BarKind::Memory64 { .. } => {
                access.write32(addr, bar.offset, base as u32)?;
                access.write32(addr, bar.offset + 4, (base >> 32) as u32)?;
            }
            BarKind::ExpansionRom => {
                access.write32(addr, bar.offset, base as u32 | ROM_ENABLE)?;
            }
        }
        debug!("{addr} BAR{}: {:#x} ({:#x} bytes)", bar.index, base, bar.size);
    }
    Ok(())
}

fn program_windows<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
    mem: Option<AddressRange>,
    pref: Option<AddressRange>,
    io: Option<AddressRange>,
) -> Result<()> {
    // Non-prefetchable memory window, 1 MiB granularity. An empty window is
    // expressed as base > limit.
    let (mem_base, mem_limit) = match mem {
        Some(r) => (
            (r.base >> 16) as u16 & 0xfff0,
            ((r.end() - 1) >> 16) as u16 & 0xfff0,
        ),
        None => (0xfff0, 0x0000),
    };
    access.write16(addr, reg::MEMORY_BASE, mem_base)?;
    access.write16(addr, reg::MEMORY_LIMIT, mem_limit)?;

    // Prefetchable window with 64-bit upper halves.
    let (pref_base, pref_limit, pref_base_hi, pref_limit_hi) = match pref {
        Some(r) => (
            (r.base >> 16) as u16 & 0xfff0,
            ((r.end() - 1) >> 16) as u16 & 0xfff0,
            (r.base >> 32) as u32,
            ((r.end() - 1) >> 32) as u32,
        ),
        None => (0xfff0, 0x0000, 0, 0),
    };
    access.write16(addr, reg::PREF_MEMORY_BASE, pref_base)?;
    access.write16(addr, reg::PREF_MEMORY_LIMIT, pref_limit)?;
    access.write32(addr, reg::PREF_BASE_UPPER, pref_base_hi)?;
    access.write32(addr, reg::PREF_LIMIT_UPPER, pref_limit_hi)?;

    // I/O window, 4 KiB granularity, upper 16 bits in separate registers.
    let (io_base, io_limit, io_base_hi, io_limit_hi) = match io {
        Some(r) => (
            (r.base >> 8) as u8 & 0xf0,
            ((r.end() - 1) >> 8) as u8 & 0xf0,
            (r.base >> 16) as u16,
            ((r.end() - 1) >> 16) as u16,
        ),
        None => (0xf0, 0x00, 0, 0),
    };
    access.write8(addr, reg::IO_BASE, io_base)?;
    access.write8(addr, reg::IO_LIMIT, io_limit)?;
    access.write16(addr, reg::IO_BASE_UPPER, io_base_hi)?;
    access.write16(addr, reg::IO_LIMIT_UPPER, io_limit_hi)?;
    Ok(())
}

/// Write the computed assignment to hardware: BAR values leaf-to-root, then
/// bridge windows root-to-leaf.
pub fn program<A: ConfigAccess + ?Sized>(access: &mut A, chain: &Chain) -> Result<()> {
    for endpoint in &chain.endpoints {
        program_function_bars(access, endpoint.address, &endpoint.bars)?;
        if let Some(rom) = &endpoint.rom_bar {
            program_function_bars(access, endpoint.address, core::slice::from_ref(rom))?;
        }
    }
    for bridge in chain.switches.iter().rev() {
        program_function_bars(access, bridge.address, &bridge.bars)?;
    }
    program_function_bars(access, chain.root_port.address, &chain.root_port.bars)?;

    for bridge in chain.bridges() {
        program_windows(
            access,
            bridge.address,
            bridge.mem_window,
            bridge.pref_window,
            bridge.io_window,
        )?;
    }
    Ok(())
}
