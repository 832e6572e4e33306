#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(target_os = "uefi")]
mod boot {
    #[cfg(debug_assertions)]
    use core::time::Duration;

    use log::{info, warn};
    use uefi::prelude::*;
    use uefi::table::cfg::ConfigTableEntry;
    #[cfg(debug_assertions)]
    use uefi::println;

    use egpu_bringup::access::{BootOps, ConfigAccess, ConfigAddress};
    #[cfg(debug_assertions)]
    use egpu_bringup::access::{find_capability, reg};
    use egpu_bringup::bar::{AddressWindow, AllocationWindows};
    use egpu_bringup::ecam::EcamAccess;
    use egpu_bringup::engine::{self, EngineConfig};
    use egpu_bringup::mcfg;
    use egpu_bringup::portio::PortIoAccess;
    use egpu_bringup::topology::TargetDevice;

    /// Host root port the Oculink adapter hangs off.
    const ROOT_PORT: ConfigAddress = ConfigAddress::new(0x00, 0x02, 0x01);
    /// Lowest bus number the firmware leaves unlocked.
    const BASE_BUS: u8 = 0x08;
    const PCI_SEGMENT: u16 = 0;

    fn config() -> EngineConfig {
        EngineConfig {
            root_port: ROOT_PORT,
            base_bus: BASE_BUS,
            // Any AMD function terminates the chain; the exact GPU model
            // varies with the enclosure.
            target: TargetDevice {
                vendor_id: 0x1002,
                device_id: None,
            },
            windows: AllocationWindows {
                mmio32: AddressWindow {
                    base: 0xe020_0000,
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
            },
        }
    }

    /// RSDP published through the UEFI configuration table, preferring the
    /// ACPI 2.0 entry.
    fn find_rsdp() -> Option<*const u8> {
        uefi::system::with_config_table(|entries| {
            let entry = entries
                .iter()
                .find(|e| e.guid == ConfigTableEntry::ACPI2_GUID)
                .or_else(|| entries.iter().find(|e| e.guid == ConfigTableEntry::ACPI_GUID))?;
            Some(entry.address.cast::<u8>())
        })
    }

    fn run<A: ConfigAccess + BootOps>(access: &mut A) {
        let result = engine::bring_up(access, &config());
        if let Some(failure) = &result.failure {
            warn!("eGPU not usable this boot: {failure}");
        }

        #[cfg(debug_assertions)]
        {
            debug_scan_all_buses(access);
            access.stall(Duration::from_secs(7));
        }
    }

    /// Dump every visible function with its ASPM state, for comparing
    /// against the OS view later.
    #[cfg(debug_assertions)]
    fn debug_scan_all_buses<A: ConfigAccess>(access: &mut A) {
        println!("=== PCI Bus Scan ===");
        for bus in 0..=0xffu8 {
            for device in 0..32u8 {
                for function in 0..8u8 {
                    let addr = ConfigAddress::new(bus, device, function);
                    let Ok(vendor) = access.read16(addr, reg::VENDOR_ID) else {
                        continue;
                    };
                    if vendor != 0xffff && vendor != 0x0000 {
                        let device_id = access.read16(addr, reg::DEVICE_ID).unwrap_or(0);
                        let aspm = match find_capability(access, addr, reg::CAP_ID_PCI_EXPRESS) {
                            Ok(Some(cap)) => {
                                let control = access
                                    .read16(addr, cap + reg::PCIE_LINK_CONTROL)
                                    .unwrap_or(0);
                                match control & reg::PCIE_ASPM_MASK {
                                    0 => "ASPM:off",
                                    1 => "ASPM:L0s",
                                    2 => "ASPM:L1",
                                    _ => "ASPM:L0s+L1",
                                }
                            }
                            _ => "ASPM:N/A",
                        };
                        println!("{addr} {vendor:04X}:{device_id:04X} {aspm}");
                    }
                    if function == 0 {
                        let header = access
                            .read8(addr, reg::HEADER_TYPE)
                            .unwrap_or(0);
                        if header & reg::HEADER_MULTIFUNCTION == 0 {
                            break;
                        }
                    }
                }
            }
        }
        println!("=== End Scan ===");
    }

    #[entry]
    fn main() -> Status {
        uefi::helpers::init().unwrap();

        let region = find_rsdp()
            .and_then(|rsdp| unsafe { mcfg::find_ecam(rsdp, PCI_SEGMENT, BASE_BUS) });
        match region {
            Some(region) => {
                info!("ECAM at {:#x}, buses {:#04x}-{:#04x}", region.base, region.start_bus, region.end_bus);
                let mut access = unsafe { EcamAccess::new(region) };
                run(&mut access);
            }
            None => {
                info!("no usable MCFG, falling back to port I/O");
                let mut access = PortIoAccess::new();
                run(&mut access);
            }
        }

        // The loader always continues the boot; a missing eGPU is not fatal.
        Status::SUCCESS
    }
}

#[cfg(not(target_os = "uefi"))]
fn main() {}
