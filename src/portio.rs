//! Legacy port-I/O configuration-space accessor (mechanism #1).
//!
//! Fallback for platforms that do not publish an MCFG. Only the first 256
//! bytes of each function are reachable this way; extended offsets fail with
//! `InvalidAccess` so callers notice instead of silently reading garbage.

use crate::access::{ConfigAccess, ConfigAddress, Width, check_access};
use crate::error::{BringUpError, Result};

const PCI_ADDR: u16 = 0xcf8;
const PCI_DATA: u16 = 0xcfc;

#[inline(always)]
fn out32(port: u16, val: u32) {
    unsafe {
        core::arch::asm!("out dx, eax", in("dx") port, in("eax") val, options(nomem, nostack));
    }
}

#[inline(always)]
fn in32(port: u16) -> u32 {
    let val: u32;
    unsafe {
        core::arch::asm!("in eax, dx", out("eax") val, in("dx") port, options(nomem, nostack));
    }
    val
}

#[inline(always)]
fn pci_addr(addr: ConfigAddress, offset: u16) -> u32 {
    0x8000_0000
        | (addr.bus as u32) << 16
        | (addr.device as u32) << 11
        | (addr.function as u32) << 8
        | (offset as u32) & 0xfc
}

/// Accessor over the 0xCF8/0xCFC register pair.
#[derive(Debug, Default)]
pub struct PortIoAccess;

impl PortIoAccess {
    pub const fn new() -> Self {
        Self
    }

    fn select(&self, addr: ConfigAddress, offset: u16) -> Result<()> {
        if offset >= 0x100 {
            return Err(BringUpError::InvalidAccess { offset });
        }
        out32(PCI_ADDR, pci_addr(addr, offset));
        Ok(())
    }
}

impl ConfigAccess for PortIoAccess {
    fn read(&mut self, addr: ConfigAddress, offset: u16, width: Width) -> Result<u32> {
        check_access(offset, width)?;
        self.select(addr, offset)?;
        let dword = in32(PCI_DATA);
        let value = match width {
            Width::U8 => dword >> ((offset & 3) * 8) & 0xff,
            Width::U16 => dword >> ((offset & 2) * 8) & 0xffff,
            Width::U32 => dword,
        };
        Ok(value)
    }

    fn write(&mut self, addr: ConfigAddress, offset: u16, width: Width, value: u32) -> Result<()> {
        check_access(offset, width)?;
        self.select(addr, offset)?;
        let merged = match width {
            Width::U8 => {
                let old = in32(PCI_DATA);
                let shift = (offset & 3) * 8;
                old & !(0xff << shift) | (value & 0xff) << shift
            }
            Width::U16 => {
                let old = in32(PCI_DATA);
                let shift = (offset & 2) * 8;
                old & !(0xffff << shift) | (value & 0xffff) << shift
            }
            Width::U32 => value,
        };
        out32(PCI_DATA, merged);
        Ok(())
    }
}

#[cfg(target_os = "uefi")]
impl crate::access::BootOps for PortIoAccess {
    fn stall(&mut self, duration: core::time::Duration) {
        uefi::boot::stall(duration);
    }

    fn read_phys_u8(&mut self, phys: u64) -> u8 {
        unsafe { (phys as *const u8).read_volatile() }
    }
}
