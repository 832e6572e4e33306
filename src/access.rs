//! Raw PCI configuration-space access.
//!
//! [`ConfigAccess`] is the only way the engine touches hardware registers;
//! everything above it is policy. Implementations: [`crate::ecam::EcamAccess`]
//! for memory-mapped extended configuration space and
//! [`crate::portio::PortIoAccess`] for the legacy 0xCF8/0xCFC mechanism.

use core::fmt;
use core::time::Duration;

use bitflags::bitflags;

use crate::error::{BringUpError, Result};

/// Size of one function's extended configuration-space region.
pub const CONFIG_SPACE_SIZE: u16 = 4096;

/// Standard configuration-header and capability register offsets.
///
/// This layout is an external wire format mandated by the PCI/PCIe
/// specifications, not a design choice.
pub mod reg {
    pub const VENDOR_ID: u16 = 0x00;
    pub const DEVICE_ID: u16 = 0x02;
    pub const COMMAND: u16 = 0x04;
    pub const STATUS: u16 = 0x06;
    pub const SUBCLASS: u16 = 0x0a;
    pub const BASE_CLASS: u16 = 0x0b;
    pub const HEADER_TYPE: u16 = 0x0e;
    pub const BAR0: u16 = 0x10;
    pub const PRIMARY_BUS: u16 = 0x18;
    pub const SECONDARY_BUS: u16 = 0x19;
    pub const SUBORDINATE_BUS: u16 = 0x1a;
    pub const IO_BASE: u16 = 0x1c;
    pub const IO_LIMIT: u16 = 0x1d;
    pub const MEMORY_BASE: u16 = 0x20;
    pub const MEMORY_LIMIT: u16 = 0x22;
    pub const PREF_MEMORY_BASE: u16 = 0x24;
    pub const PREF_MEMORY_LIMIT: u16 = 0x26;
    pub const PREF_BASE_UPPER: u16 = 0x28;
    pub const PREF_LIMIT_UPPER: u16 = 0x2c;
    pub const IO_BASE_UPPER: u16 = 0x30;
    pub const IO_LIMIT_UPPER: u16 = 0x32;
    pub const CAP_POINTER: u16 = 0x34;
    /// Expansion-ROM BAR in a type-0 header.
    pub const ROM_BAR_TYPE0: u16 = 0x30;

    /// Capability list valid (status register).
    pub const STATUS_CAP_LIST: u16 = 1 << 4;

    pub const HEADER_TYPE_BRIDGE: u8 = 0x01;
    pub const HEADER_MULTIFUNCTION: u8 = 0x80;

    pub const CLASS_DISPLAY: u8 = 0x03;
    pub const CLASS_BRIDGE: u8 = 0x06;
    pub const SUBCLASS_PCI_BRIDGE: u8 = 0x04;

    pub const CAP_ID_POWER_MGMT: u8 = 0x01;
    pub const CAP_ID_PCI_EXPRESS: u8 = 0x10;

    /// PM control/status register, relative to the PM capability.
    pub const PM_CTRL_STATUS: u16 = 0x04;
    /// Power-state field in the PM control/status register.
    pub const PM_STATE_MASK: u16 = 0x0003;

    /// Device control register, relative to the PCIe capability.
    pub const PCIE_DEVICE_CONTROL: u16 = 0x08;
    /// Extended Tag field enable (device control).
    pub const PCIE_EXTENDED_TAG: u16 = 1 << 8;
    /// Link control register, relative to the PCIe capability.
    pub const PCIE_LINK_CONTROL: u16 = 0x10;
    /// ASPM control field (link control).
    pub const PCIE_ASPM_MASK: u16 = 0x0003;
    /// Link status register, relative to the PCIe capability.
    pub const PCIE_LINK_STATUS: u16 = 0x12;
    /// Data Link Layer Active (link status).
    pub const PCIE_DLL_ACTIVE: u16 = 1 << 13;
}

bitflags! {
    /// PCI command register bits the engine cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
    }
}

/// Identifies one PCI function. Immutable once discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl ConfigAddress {
    /// Build an address. `device` is truncated to 5 bits and `function` to
    /// 3 bits, matching their width in configuration transactions.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device: device & 0x1f,
            function: function & 0x07,
        }
    }

    pub const fn with_function(self, function: u8) -> Self {
        Self::new(self.bus, self.device, function)
    }
}

impl fmt::Display for ConfigAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Access width for a configuration-space transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    U8,
    U16,
    U32,
}

impl Width {
    pub const fn bytes(self) -> u16 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Validate offset and alignment for one access. Shared by all
/// implementations so they agree on what `InvalidAccess` means.
pub fn check_access(offset: u16, width: Width) -> Result<()> {
    // Widened sum; offsets near u16::MAX must not wrap past the bound.
    if offset % width.bytes() != 0
        || offset as u32 + width.bytes() as u32 > CONFIG_SPACE_SIZE as u32
    {
        return Err(BringUpError::InvalidAccess { offset });
    }
    Ok(())
}

/// Raw register I/O on PCI configuration space. No policy; a failing access
/// is fatal for the current pass since configuration space is always mapped
/// and readable by construction of the boot environment.
pub trait ConfigAccess {
    fn read(&mut self, addr: ConfigAddress, offset: u16, width: Width) -> Result<u32>;
    fn write(&mut self, addr: ConfigAddress, offset: u16, width: Width, value: u32) -> Result<()>;

    fn read8(&mut self, addr: ConfigAddress, offset: u16) -> Result<u8> {
        Ok(self.read(addr, offset, Width::U8)? as u8)
    }

    fn read16(&mut self, addr: ConfigAddress, offset: u16) -> Result<u16> {
        Ok(self.read(addr, offset, Width::U16)? as u16)
    }

    fn read32(&mut self, addr: ConfigAddress, offset: u16) -> Result<u32> {
        self.read(addr, offset, Width::U32)
    }

    fn write8(&mut self, addr: ConfigAddress, offset: u16, value: u8) -> Result<()> {
        self.write(addr, offset, Width::U8, value as u32)
    }

    fn write16(&mut self, addr: ConfigAddress, offset: u16, value: u16) -> Result<()> {
        self.write(addr, offset, Width::U16, value as u32)
    }

    fn write32(&mut self, addr: ConfigAddress, offset: u16, value: u32) -> Result<()> {
        self.write(addr, offset, Width::U32, value)
    }
}

/// Services the boot environment provides alongside register access: a
/// bounded busy-wait and a physical memory read for the ROM signature probe.
pub trait BootOps {
    fn stall(&mut self, duration: Duration);
    fn read_phys_u8(&mut self, phys: u64) -> u8;
}

/// Walk the capability list looking for `cap_id`. Returns the capability's
/// config-space offset, or `None` if the function does not carry it.
pub fn find_capability<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
    cap_id: u8,
) -> Result<Option<u16>> {
    let status = access.read16(addr, reg::STATUS)?;
    if status & reg::STATUS_CAP_LIST == 0 {
        return Ok(None);
    }
    let mut ptr = access.read8(addr, reg::CAP_POINTER)? & 0xfc;
    // 48 four-byte capabilities is the most that fits in the standard
    // header's capability area; anything longer is a malformed loop.
    for _ in 0..48 {
        if ptr == 0 {
            break;
        }
        let id = access.read8(addr, ptr as u16)?;
        if id == cap_id {
            return Ok(Some(ptr as u16));
        }
        ptr = access.read8(addr, ptr as u16 + 1)? & 0xfc;
    }
    Ok(None)
}
