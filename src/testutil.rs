//! Mock PCI fabric for host-run tests.
//!
//! Emulates the slice of PCI behavior the engine relies on: configuration
//! reads routed through bridge secondary/subordinate windows, BAR size
//! latching on all-ones writes, capability chains, power-state registers,
//! and an expansion-ROM backing store serving the 0x55 0xaa signature.
//! Absent functions read as all-ones; writes to them are dropped.

use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use crate::access::{BootOps, ConfigAccess, ConfigAddress, Width, check_access, reg};
use crate::bar::{AddressWindow, AllocationWindows};
use crate::engine::EngineConfig;
use crate::error::Result;
use crate::topology::{self, Chain, ChainDiscovery, TargetDevice};

const ROOT_BUS: u8 = 0;
const ROOT_PORT: ConfigAddress = ConfigAddress::new(0, 2, 1);
const BASE_BUS: u8 = 0x08;

/// PM capability at 0x50, PCIe capability at 0x60.
const PM_CAP: u16 = 0x50;
const PCIE_CAP: u16 = 0x60;

/// How one BAR slot decodes.
#[derive(Debug, Clone, Copy)]
enum BarSlot {
    Mem32 { size: u64, prefetchable: bool },
    Mem64Lo { size: u64, prefetchable: bool },
    /// Upper half of the preceding 64-bit slot.
    Mem64Hi { mask_hi: u32 },
    Io { size: u64 },
}

/// One emulated PCI function with its raw 256-byte register file.
#[derive(Debug, Clone)]
struct MockDevice {
    slot: u8,
    function: u8,
    regs: [u32; 64],
    bars: [Option<BarSlot>; 6],
    rom_size: Option<u64>,
    is_bridge: bool,
    children: Vec<MockDevice>,
}

impl MockDevice {
    fn new(slot: u8, function: u8, vendor: u16, device: u16, class: u32, header: u8) -> Self {
        let mut regs = [0u32; 64];
        regs[0] = (device as u32) << 16 | vendor as u32;
        // Status advertises a capability list.
        regs[1] = (reg::STATUS_CAP_LIST as u32) << 16;
        regs[2] = class << 8;
        regs[3] = (header as u32) << 16;
        regs[(reg::CAP_POINTER / 4) as usize] |= PM_CAP as u32;
        // PM capability: id 0x01, next -> PCIe capability.
        regs[(PM_CAP / 4) as usize] = (PCIE_CAP as u32) << 8 | reg::CAP_ID_POWER_MGMT as u32;
        // PCIe capability: id 0x10, end of list.
        regs[(PCIE_CAP / 4) as usize] = reg::CAP_ID_PCI_EXPRESS as u32;
        Self {
            slot,
            function,
            regs,
            bars: [None; 6],
            rom_size: None,
            is_bridge: header & !reg::HEADER_MULTIFUNCTION == reg::HEADER_TYPE_BRIDGE,
            children: Vec::new(),
        }
    }

    fn bridge(slot: u8, function: u8, vendor: u16) -> Self {
        Self::new(slot, function, vendor, 0x1478, 0x060400, 0x01)
    }

    fn byte(&self, offset: u16) -> u8 {
        (self.regs[(offset / 4) as usize] >> (offset % 4 * 8)) as u8
    }

    fn secondary(&self) -> u8 {
        self.byte(reg::SECONDARY_BUS)
    }

    fn subordinate(&self) -> u8 {
        self.byte(reg::SUBORDINATE_BUS)
    }

    /// BAR register slots the header type defines. Slots without a backing
    /// [`BarSlot`] are hardwired to zero.
    fn bar_slot_of(&self, offset: u16) -> Option<usize> {
        let count = if self.is_bridge { 2 } else { 6 };
        if offset >= reg::BAR0 && offset < reg::BAR0 + 4 * count {
            Some(((offset - reg::BAR0) / 4) as usize)
        } else {
            None
        }
    }

    /// Read one raw dword, applying BAR and ROM latch semantics.
    fn read_dword(&self, offset: u16) -> u32 {
        if offset as usize / 4 >= self.regs.len() {
            return 0;
        }
        let raw = self.regs[(offset / 4) as usize];
        if let Some(slot) = self.bar_slot_of(offset) {
            return match self.bars[slot] {
                None => 0,
                Some(BarSlot::Mem32 { size, prefetchable }) => {
                    raw & !(size as u32 - 1) | if prefetchable { 0x8 } else { 0x0 }
                }
                Some(BarSlot::Mem64Lo { size, prefetchable }) => {
                    let mask = !(size - 1);
                    raw & mask as u32 | 0x4 | if prefetchable { 0x8 } else { 0x0 }
                }
                Some(BarSlot::Mem64Hi { mask_hi }) => raw & mask_hi,
                Some(BarSlot::Io { size }) => raw & (!(size as u32 - 1) & 0xffff) | 0x1,
            };
        }
        if !self.is_bridge && offset == reg::ROM_BAR_TYPE0 {
            if let Some(size) = self.rom_size {
                return raw & !(size as u32 - 1) & 0xffff_f800 | raw & 0x1;
            }
        }
        raw
    }

    fn write_dword(&mut self, offset: u16, value: u32, byte_mask: u32) {
        if offset as usize / 4 >= self.regs.len() {
            return;
        }
        let raw = &mut self.regs[(offset / 4) as usize];
        *raw = *raw & !byte_mask | value & byte_mask;
    }

    /// Currently assigned, enabled expansion-ROM range, if any.
    fn rom_range(&self) -> Option<(u64, u64)> {
        let size = self.rom_size?;
        let raw = self.regs[(reg::ROM_BAR_TYPE0 / 4) as usize];
        if raw & 0x1 == 0 {
            return None;
        }
        let base = (raw & !(size as u32 - 1) & 0xffff_f800) as u64;
        Some((base, size))
    }
}

/// The emulated fabric: devices on the root bus plus everything routed
/// behind them.
#[derive(Debug)]
pub struct MockFabric {
    root: Vec<MockDevice>,
    writes: usize,
    stalled: Duration,
}

fn find_routed<'a>(
    devices: &'a mut [MockDevice],
    devices_bus: u8,
    addr: ConfigAddress,
) -> Option<&'a mut MockDevice> {
    for device in devices {
        if devices_bus == addr.bus
            && device.slot == addr.device
            && device.function == addr.function
        {
            return Some(device);
        }
        if device.is_bridge {
            let sec = device.secondary();
            let sub = device.subordinate();
            if sec > devices_bus && sec <= addr.bus && addr.bus <= sub {
                if let Some(found) = find_routed(&mut device.children, sec, addr) {
                    return Some(found);
                }
            }
        }
    }
    None
}

impl MockFabric {
    /// A fabric with nothing attached; every read is all-ones.
    pub fn empty() -> Self {
        Self {
            root: Vec::new(),
            writes: 0,
            stalled: Duration::ZERO,
        }
    }

    pub fn root_port(&self) -> ConfigAddress {
        ROOT_PORT
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn total_stall(&self) -> Duration {
        self.stalled
    }

    /// Routed register read that panics on access errors; test sugar.
    pub fn reg8(&mut self, addr: ConfigAddress, offset: u16) -> u8 {
        ConfigAccess::read8(self, addr, offset).unwrap()
    }

    fn resolve(&mut self, addr: ConfigAddress) -> Option<&mut MockDevice> {
        find_routed(&mut self.root, ROOT_BUS, addr)
    }

    fn leaf_bridge_mut(&mut self) -> &mut MockDevice {
        fn descend(device: &mut MockDevice) -> &mut MockDevice {
            if device.children.iter().any(|c| c.is_bridge) {
                descend(device.children.iter_mut().find(|c| c.is_bridge).unwrap())
            } else {
                device
            }
        }
        descend(
            self.root
                .iter_mut()
                .find(|d| d.is_bridge)
                .expect("fabric has no bridge"),
        )
    }

    /// Detach the terminal device, breaking the chain mid-way.
    pub fn remove_endpoint_device(&mut self) {
        self.leaf_bridge_mut().children.clear();
    }

    /// Populate a second device slot on the bus behind the root port.
    pub fn add_sibling_on_first_switch_bus(&mut self) {
        let root_port = self
            .root
            .iter_mut()
            .find(|d| d.is_bridge)
            .expect("fabric has no root port");
        root_port
            .children
            .push(MockDevice::new(1, 0, 0x8086, 0x0001, 0x020000, 0x00));
    }

    /// Force a function's PM power-state field.
    pub fn set_power_state(&mut self, addr: ConfigAddress, state: u8) {
        let device = self.resolve(addr).expect("no such function");
        let raw = &mut device.regs[(PM_CAP / 4 + 1) as usize];
        *raw = *raw & !(reg::PM_STATE_MASK as u32) | state as u32 & reg::PM_STATE_MASK as u32;
    }

    /// Set or clear Data Link Layer Active on every bridge.
    pub fn set_link_trained(&mut self, trained: bool) {
        fn visit(devices: &mut [MockDevice], trained: bool) {
            for device in devices {
                if device.is_bridge {
                    // Link status lives in the upper half of the dword at
                    // PCIe capability + 0x10.
                    let raw = &mut device.regs[((PCIE_CAP + reg::PCIE_LINK_CONTROL) / 4) as usize];
                    let bit = (reg::PCIE_DLL_ACTIVE as u32) << 16;
                    *raw = if trained { *raw | bit } else { *raw & !bit };
                }
                visit(&mut device.children, trained);
            }
        }
        visit(&mut self.root, trained);
    }
}

impl ConfigAccess for MockFabric {
    fn read(&mut self, addr: ConfigAddress, offset: u16, width: Width) -> Result<u32> {
        check_access(offset, width)?;
        let Some(device) = self.resolve(addr) else {
            return Ok(match width {
                Width::U8 => 0xff,
                Width::U16 => 0xffff,
                Width::U32 => 0xffff_ffff,
            });
        };
        let dword = device.read_dword(offset & !0x3);
        Ok(match width {
            Width::U8 => dword >> (offset % 4 * 8) & 0xff,
            Width::U16 => dword >> (offset % 4 * 8) & 0xffff,
            Width::U32 => dword,
        })
    }

    fn write(&mut self, addr: ConfigAddress, offset: u16, width: Width, value: u32) -> Result<()> {
        check_access(offset, width)?;
        self.writes += 1;
        let Some(device) = self.resolve(addr) else {
            return Ok(());
        };
        let shift = offset % 4 * 8;
        let (value, byte_mask) = match width {
            Width::U8 => ((value & 0xff) << shift, 0xffu32 << shift),
            Width::U16 => ((value & 0xffff) << shift, 0xffffu32 << shift),
            Width::U32 => (value, u32::MAX),
        };
        device.write_dword(offset & !0x3, value, byte_mask);
        Ok(())
    }
}

impl BootOps for MockFabric {
    fn stall(&mut self, duration: Duration) {
        self.stalled += duration;
    }

    fn read_phys_u8(&mut self, phys: u64) -> u8 {
        fn visit(devices: &[MockDevice], phys: u64) -> Option<u8> {
            for device in devices {
                if let Some((base, size)) = device.rom_range() {
                    if phys >= base && phys < base + size {
                        return Some(match phys - base {
                            0 => 0x55,
                            1 => 0xaa,
                            _ => 0x00,
                        });
                    }
                }
                if let Some(byte) = visit(&device.children, phys) {
                    return Some(byte);
                }
            }
            None
        }
        visit(&self.root, phys).unwrap_or(0xff)
    }
}

/// The target hardware in miniature: root port, `switches` switch bridges,
/// and a multi-function GPU (display function with 64-bit apertures, I/O
/// BAR, 16 MiB register BAR and 512 KiB ROM, plus an HDMI audio function).
pub fn gpu_chain(switches: usize) -> MockFabric {
    let mut gpu = MockDevice::new(
        0,
        0,
        0x1002,
        0x747e,
        0x030000,
        reg::HEADER_MULTIFUNCTION,
    );
    gpu.bars = [
        Some(BarSlot::Mem64Lo {
            size: 0x1000_0000,
            prefetchable: true,
        }),
        Some(BarSlot::Mem64Hi { mask_hi: u32::MAX }),
        Some(BarSlot::Mem64Lo {
            size: 0x20_0000,
            prefetchable: true,
        }),
        Some(BarSlot::Mem64Hi { mask_hi: u32::MAX }),
        Some(BarSlot::Io { size: 0x100 }),
        Some(BarSlot::Mem32 {
            size: 0x100_0000,
            prefetchable: false,
        }),
    ];
    gpu.rom_size = Some(0x8_0000);

    let mut audio = MockDevice::new(0, 1, 0x1002, 0xab30, 0x040300, 0x00);
    audio.bars[0] = Some(BarSlot::Mem32 {
        size: 0x4000,
        prefetchable: false,
    });

    let mut leaf_children = vec![gpu, audio];
    for i in (0..switches).rev() {
        let mut switch = MockDevice::bridge(0, 0, 0x1002);
        if i == 0 {
            // The upstream switch carries its own register BAR.
            switch.bars[0] = Some(BarSlot::Mem32 {
                size: 0x10_0000,
                prefetchable: false,
            });
        }
        switch.children = leaf_children;
        leaf_children = vec![switch];
    }

    let mut root_port = MockDevice::bridge(ROOT_PORT.device, ROOT_PORT.function, 0x1022);
    root_port.children = leaf_children;

    MockFabric {
        root: vec![root_port],
        writes: 0,
        stalled: Duration::ZERO,
    }
}

/// Address windows matching the target platform's free ranges.
pub fn test_windows() -> AllocationWindows {
    AllocationWindows {
        mmio32: AddressWindow {
            base: 0xe000_0000,
            size: 0x0400_0000,
        },
        mmio64: AddressWindow {
            base: 0x10_3000_0000,
            size: 0x1_0000_0000,
        },
        io: AddressWindow {
            base: 0x2000,
            size: 0x1000,
        },
    }
}

pub fn test_config(fabric: &MockFabric) -> EngineConfig {
    EngineConfig {
        root_port: fabric.root_port(),
        base_bus: BASE_BUS,
        target: TargetDevice {
            vendor_id: 0x1002,
            device_id: None,
        },
        windows: test_windows(),
    }
}

/// Discover the chain at the standard base bus, panicking unless found.
pub fn discover_chain(fabric: &mut MockFabric) -> Chain {
    let root = fabric.root_port();
    let target = TargetDevice {
        vendor_id: 0x1002,
        device_id: None,
    };
    match topology::discover(fabric, root, BASE_BUS, &target).unwrap() {
        ChainDiscovery::Found(chain) => chain,
        other => panic!("expected chain, got {other:?}"),
    }
}
