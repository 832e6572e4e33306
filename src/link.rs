//! Link, power, and command-register bring-up.
//!
//! The secondary steps needed before bus-mastering works: Extended Tag,
//! a D0 power transition, command-register enables, and ASPM off on the
//! root port. Every step is idempotent and independently skippable; whether
//! it applied a change or found the condition already satisfied is surfaced
//! for diagnostics only, never for control flow.

use alloc::vec::Vec;
use core::time::Duration;

use log::debug;

use crate::access::{BootOps, Command, ConfigAccess, ConfigAddress, find_capability, reg};
use crate::error::Result;
use crate::topology::Chain;

/// Settling time after a power-state transition that was actually performed.
const D0_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ExtendedTag,
    PowerStateD0,
    CommandEnable,
    AspmDisable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    AlreadySatisfied,
}

/// One step's diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub address: ConfigAddress,
    pub step: Step,
    pub outcome: StepOutcome,
}

/// Enable the PCI Express Extended Tag field. Functions without a PCIe
/// capability are skipped entirely.
pub fn enable_extended_tag<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
) -> Result<Option<StepOutcome>> {
    let Some(cap) = find_capability(access, addr, reg::CAP_ID_PCI_EXPRESS)? else {
        return Ok(None);
    };
    let control = access.read16(addr, cap + reg::PCIE_DEVICE_CONTROL)?;
    if control & reg::PCIE_EXTENDED_TAG != 0 {
        return Ok(Some(StepOutcome::AlreadySatisfied));
    }
    access.write16(
        addr,
        cap + reg::PCIE_DEVICE_CONTROL,
        control | reg::PCIE_EXTENDED_TAG,
    )?;
    Ok(Some(StepOutcome::Applied))
}

/// Bring the function to D0. Only an actual transition pays the settle
/// delay; a function already in D0 is left untouched.
pub fn ensure_d0<A: ConfigAccess + BootOps + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
) -> Result<Option<StepOutcome>> {
    let Some(cap) = find_capability(access, addr, reg::CAP_ID_POWER_MGMT)? else {
        return Ok(None);
    };
    let csr = access.read16(addr, cap + reg::PM_CTRL_STATUS)?;
    if csr & reg::PM_STATE_MASK == 0 {
        return Ok(Some(StepOutcome::AlreadySatisfied));
    }
    access.write16(addr, cap + reg::PM_CTRL_STATUS, csr & !reg::PM_STATE_MASK)?;
    access.stall(D0_SETTLE);
    Ok(Some(StepOutcome::Applied))
}

/// Set the requested command-register enables (memory, I/O, bus master).
pub fn enable_command<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
    wanted: Command,
) -> Result<StepOutcome> {
    let command = access.read16(addr, reg::COMMAND)?;
    if command & wanted.bits() == wanted.bits() {
        return Ok(StepOutcome::AlreadySatisfied);
    }
    access.write16(addr, reg::COMMAND, command | wanted.bits())?;
    Ok(StepOutcome::Applied)
}

/// Clear the ASPM control field so the link does not drop into a low-power
/// state mid-bring-up. Applied to the root port only.
pub fn disable_aspm<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
) -> Result<Option<StepOutcome>> {
    let Some(cap) = find_capability(access, addr, reg::CAP_ID_PCI_EXPRESS)? else {
        return Ok(None);
    };
    let control = access.read16(addr, cap + reg::PCIE_LINK_CONTROL)?;
    if control & reg::PCIE_ASPM_MASK == 0 {
        return Ok(Some(StepOutcome::AlreadySatisfied));
    }
    access.write16(
        addr,
        cap + reg::PCIE_LINK_CONTROL,
        control & !reg::PCIE_ASPM_MASK,
    )?;
    Ok(Some(StepOutcome::Applied))
}

/// Read the Data Link Layer Active bit from a bridge's link status.
/// `None` when the function carries no PCIe capability.
pub fn data_link_layer_active<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
) -> Result<Option<bool>> {
    let Some(cap) = find_capability(access, addr, reg::CAP_ID_PCI_EXPRESS)? else {
        return Ok(None);
    };
    let status = access.read16(addr, cap + reg::PCIE_LINK_STATUS)?;
    Ok(Some(status & reg::PCIE_DLL_ACTIVE != 0))
}

/// Run the full step sequence over every function on the chain, bridges
/// root-to-leaf first, then the endpoints.
pub fn bring_up_chain<A: ConfigAccess + BootOps + ?Sized>(
    access: &mut A,
    chain: &Chain,
) -> Result<Vec<StepReport>> {
    let mut reports = Vec::new();
    let mut push = |reports: &mut Vec<StepReport>,
                    address: ConfigAddress,
                    step: Step,
                    outcome: Option<StepOutcome>| {
        if let Some(outcome) = outcome {
            debug!("{address}: {step:?} -> {outcome:?}");
            reports.push(StepReport {
                address,
                step,
                outcome,
            });
        }
    };

    let addresses = chain
        .bridges()
        .map(|b| b.address)
        .chain(chain.endpoints.iter().map(|e| e.address));
    for address in addresses.collect::<Vec<_>>() {
        let outcome = enable_extended_tag(access, address)?;
        push(&mut reports, address, Step::ExtendedTag, outcome);
        let outcome = ensure_d0(access, address)?;
        push(&mut reports, address, Step::PowerStateD0, outcome);
        let outcome = enable_command(
            access,
            address,
            Command::MEMORY_SPACE | Command::IO_SPACE | Command::BUS_MASTER,
        )?;
        push(&mut reports, address, Step::CommandEnable, Some(outcome));
    }

    let root = chain.root_port.address;
    let outcome = disable_aspm(access, root)?;
    push(&mut reports, root, Step::AspmDisable, outcome);

    Ok(reports)
}

/// Count of steps that performed a change, for idempotence checks and logs.
pub fn applied_count(reports: &[StepReport]) -> usize {
    reports
        .iter()
        .filter(|r| r.outcome == StepOutcome::Applied)
        .count()
}
