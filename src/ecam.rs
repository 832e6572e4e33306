//! Memory-mapped extended configuration-space accessor.

use crate::access::{ConfigAccess, ConfigAddress, Width, check_access};
use crate::error::{BringUpError, Result};
use crate::mcfg::EcamRegion;

/// Accessor over one ECAM window. Each function owns a 4 KiB register page
/// at `base + ((bus - start_bus) << 20 | device << 15 | function << 12)`.
#[derive(Debug)]
pub struct EcamAccess {
    base: *mut u8,
    start_bus: u8,
    end_bus: u8,
}

impl EcamAccess {
    /// # Safety
    /// `region` must describe an ECAM window that is identity-mapped and
    /// stays mapped for the lifetime of the accessor.
    pub unsafe fn new(region: EcamRegion) -> Self {
        Self {
            base: region.base as *mut u8,
            start_bus: region.start_bus,
            end_bus: region.end_bus,
        }
    }

    fn page(&self, addr: ConfigAddress, offset: u16) -> Result<*mut u8> {
        if addr.bus < self.start_bus || addr.bus > self.end_bus {
            return Err(BringUpError::InvalidAccess { offset });
        }
        let page = ((addr.bus - self.start_bus) as usize) << 20
            | (addr.device as usize) << 15
            | (addr.function as usize) << 12;
        Ok(unsafe { self.base.add(page + offset as usize) })
    }
}

impl ConfigAccess for EcamAccess {
    fn read(&mut self, addr: ConfigAddress, offset: u16, width: Width) -> Result<u32> {
        check_access(offset, width)?;
        let ptr = self.page(addr, offset)?;
        let value = unsafe {
            match width {
                Width::U8 => ptr.read_volatile() as u32,
                Width::U16 => ptr.cast::<u16>().read_volatile() as u32,
                Width::U32 => ptr.cast::<u32>().read_volatile(),
            }
        };
        Ok(value)
    }

    fn write(&mut self, addr: ConfigAddress, offset: u16, width: Width, value: u32) -> Result<()> {
        check_access(offset, width)?;
        let ptr = self.page(addr, offset)?;
        unsafe {
            match width {
                Width::U8 => ptr.write_volatile(value as u8),
                Width::U16 => ptr.cast::<u16>().write_volatile(value as u16),
                Width::U32 => ptr.cast::<u32>().write_volatile(value),
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "uefi")]
impl crate::access::BootOps for EcamAccess {
    fn stall(&mut self, duration: core::time::Duration) {
        uefi::boot::stall(duration);
    }

    fn read_phys_u8(&mut self, phys: u64) -> u8 {
        // Pre-boot physical memory is identity mapped.
        unsafe { (phys as *const u8).read_volatile() }
    }
}
