//! Bring-up orchestration.
//!
//! Sequences discovery, bus numbering, BAR programming, and link bring-up
//! into a single pass: `Init → TopologyDiscovered → BusesAssigned →
//! BarsProgrammed → LinkChecked`. Each transition is attempted once; a
//! failed step is never retried, since config-space state does not change
//! without an external trigger and a retry loop only risks leaving bridges
//! partially numbered.

use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::access::{BootOps, ConfigAccess, ConfigAddress};
use crate::bar::{self, AllocationWindows};
use crate::busnr;
use crate::error::{BringUpError, Result};
use crate::link::{self, StepReport};
use crate::topology::{self, ChainDiscovery, TargetDevice};

/// Expansion-ROM images lead with this signature.
const ROM_SIGNATURE: [u8; 2] = [0x55, 0xaa];

/// Fixed configuration for the target hardware; nothing in here is
/// discovered at runtime.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Root port of the chain (host end of the Oculink adapter).
    pub root_port: ConfigAddress,
    /// Lowest bus number not locked by firmware; numbering starts here.
    pub base_bus: u8,
    pub target: TargetDevice,
    pub windows: AllocationWindows,
}

/// Orchestrator state machine. Transitions are logged; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    TopologyDiscovered,
    BusesAssigned,
    BarsProgrammed,
    LinkChecked,
}

fn advance(phase: &mut Phase, next: Phase) {
    debug!("phase {phase:?} -> {next:?}");
    *phase = next;
}

/// Structured outcome of one bring-up pass. All flags are recorded
/// regardless of pass/fail: a GPU that is bus/BAR-ready but not yet
/// link-trained is a condition the boot environment reports, not a success.
#[derive(Debug, Clone, Default)]
pub struct BringUpResult {
    pub buses_assigned: bool,
    pub bars_programmed: bool,
    pub data_link_layer_up: bool,
    pub rom_signature_valid: bool,
    pub failure: Option<BringUpError>,
    /// Per-step apply/skip diagnostics from the link bring-up stage.
    pub steps: Vec<StepReport>,
}

impl BringUpResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run one bring-up pass. The single entry point exposed to the boot
/// environment.
pub fn bring_up<A: ConfigAccess + BootOps + ?Sized>(
    access: &mut A,
    config: &EngineConfig,
) -> BringUpResult {
    let mut result = BringUpResult::default();
    if let Err(failure) = run(access, config, &mut result) {
        warn!("bring-up failed: {failure}");
        result.failure = Some(failure);
    }
    match &result.failure {
        None => info!(
            "bring-up complete: dll={} rom={}",
            result.data_link_layer_up, result.rom_signature_valid
        ),
        Some(BringUpError::LinkNotTrained) => info!(
            "buses and BARs programmed, data link layer still down (rom={})",
            result.rom_signature_valid
        ),
        Some(failure) => info!("bring-up aborted: {failure}"),
    }
    result
}

fn run<A: ConfigAccess + BootOps + ?Sized>(
    access: &mut A,
    config: &EngineConfig,
    result: &mut BringUpResult,
) -> Result<()> {
    let mut phase = Phase::Init;

    let mut chain = match topology::discover(
        access,
        config.root_port,
        config.base_bus,
        &config.target,
    )? {
        ChainDiscovery::Found(chain) => chain,
        ChainDiscovery::Absent => {
            info!("no device chain at {}", config.root_port);
            return Err(BringUpError::TopologyNotFound);
        }
        ChainDiscovery::Branched { at } => {
            warn!("unsupported branching topology at {at}");
            return Err(BringUpError::TopologyNotFound);
        }
    };
    advance(&mut phase, Phase::TopologyDiscovered);

    busnr::program(access, &mut chain, config.base_bus)?;
    result.buses_assigned = true;
    advance(&mut phase, Phase::BusesAssigned);

    bar::probe_chain(access, &mut chain)?;
    bar::assign(&mut chain, &config.windows)?;
    bar::program(access, &chain)?;
    result.bars_programmed = true;
    advance(&mut phase, Phase::BarsProgrammed);

    result.steps = link::bring_up_chain(access, &chain)?;
    advance(&mut phase, Phase::LinkChecked);

    // Postconditions, both recorded whatever their value.
    result.data_link_layer_up =
        link::data_link_layer_active(access, chain.leaf_bridge().address)?.unwrap_or(false);
    result.rom_signature_valid = rom_signature_valid(access, &chain);

    if !result.data_link_layer_up {
        // Known-unsolved condition: the exact sequence to train the link
        // without firmware help is still open. Buses and BARs stay usable
        // for an OS-level fixer, so this is a distinct partial success.
        return Err(BringUpError::LinkNotTrained);
    }
    Ok(())
}

fn rom_signature_valid<A: ConfigAccess + BootOps + ?Sized>(
    access: &mut A,
    chain: &topology::Chain,
) -> bool {
    let Some(base) = chain
        .endpoints
        .first()
        .and_then(|e| e.rom_bar.as_ref())
        .and_then(|rom| rom.assigned)
    else {
        return false;
    };
    let signature = [access.read_phys_u8(base), access.read_phys_u8(base + 1)];
    signature == ROM_SIGNATURE
}
