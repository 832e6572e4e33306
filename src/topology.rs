//! Chain discovery.
//!
//! The target topology is one known shape: host root port → zero or more
//! PCIe switch bridges → GPU function (optionally with companion functions
//! such as HDMI audio on the same device). Discovery is modelled as a tagged
//! outcome over that single chain rather than a general tree walk; branching
//! fan-out is reported, not followed.
//!
//! Platform firmware numbers buses only two hops deep, so functions further
//! down are unreachable until a bus number exists. The walker therefore
//! descends with scratch numbering (secondary = base + depth, subordinate =
//! 0xff) which the bus-number allocator later finalises. Scratch state is
//! cleared on every failure path so no bridge is left partially numbered.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::access::{ConfigAccess, ConfigAddress, reg};
use crate::bar::{AddressRange, BarDescriptor};
use crate::error::{BringUpError, Result};

/// Upper bound on chain depth; the physical chain is three bridges, anything
/// deeper than this is a wiring loop or garbage registers.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// The function discovery stops at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDevice {
    pub vendor_id: u16,
    /// `None` matches any device of the configured vendor.
    pub device_id: Option<u16>,
}

impl TargetDevice {
    fn matches(&self, vendor_id: u16, device_id: u16, base_class: u8) -> bool {
        if base_class == reg::CLASS_DISPLAY {
            return true;
        }
        vendor_id == self.vendor_id && self.device_id.is_none_or(|d| d == device_id)
    }
}

/// One PCIe switch/bridge function on the chain.
#[derive(Debug, Clone)]
pub struct BridgeNode {
    pub address: ConfigAddress,
    pub primary_bus: u8,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    /// The bridge's own BARs (the upstream switch carries one).
    pub bars: Vec<BarDescriptor>,
    pub mem_window: Option<AddressRange>,
    pub pref_window: Option<AddressRange>,
    pub io_window: Option<AddressRange>,
}

impl BridgeNode {
    fn new(address: ConfigAddress) -> Self {
        Self {
            address,
            primary_bus: address.bus,
            secondary_bus: 0,
            subordinate_bus: 0,
            bars: Vec::new(),
            mem_window: None,
            pref_window: None,
            io_window: None,
        }
    }
}

/// A terminal function on the chain (the GPU, or a companion function on the
/// same device).
#[derive(Debug, Clone)]
pub struct EndpointNode {
    pub address: ConfigAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub base_class: u8,
    pub sub_class: u8,
    pub bars: Vec<BarDescriptor>,
    pub rom_bar: Option<BarDescriptor>,
}

impl EndpointNode {
    fn read_from<A: ConfigAccess + ?Sized>(access: &mut A, address: ConfigAddress) -> Result<Self> {
        Ok(Self {
            address,
            vendor_id: access.read16(address, reg::VENDOR_ID)?,
            device_id: access.read16(address, reg::DEVICE_ID)?,
            base_class: access.read8(address, reg::BASE_CLASS)?,
            sub_class: access.read8(address, reg::SUBCLASS)?,
            bars: Vec::new(),
            rom_bar: None,
        })
    }
}

/// The discovered chain. Built fresh on every pass; nothing read from the
/// firmware's prior assignments is trusted for accounting.
#[derive(Debug, Clone)]
pub struct Chain {
    pub root_port: BridgeNode,
    pub switches: Vec<BridgeNode>,
    pub endpoints: Vec<EndpointNode>,
}

impl Chain {
    /// Number of switch bridges behind the root port.
    pub fn depth(&self) -> usize {
        self.switches.len()
    }

    /// Root-to-leaf iteration over all bridges including the root port.
    pub fn bridges(&self) -> impl Iterator<Item = &BridgeNode> {
        core::iter::once(&self.root_port).chain(self.switches.iter())
    }

    pub fn bridges_mut(&mut self) -> impl Iterator<Item = &mut BridgeNode> {
        core::iter::once(&mut self.root_port).chain(self.switches.iter_mut())
    }

    /// The bridge directly upstream of the endpoint.
    pub fn leaf_bridge(&self) -> &BridgeNode {
        self.switches.last().unwrap_or(&self.root_port)
    }

    pub fn endpoint_bus(&self) -> u8 {
        self.endpoints[0].address.bus
    }
}

/// Outcome of a discovery pass.
#[derive(Debug)]
pub enum ChainDiscovery {
    Found(Chain),
    /// The root port reads as all-ones: nothing attached or unpowered.
    Absent,
    /// An additional device slot is populated on an intermediate bus. The
    /// engine only handles a strictly linear chain.
    Branched { at: ConfigAddress },
}

fn is_bridge_function<A: ConfigAccess + ?Sized>(
    access: &mut A,
    addr: ConfigAddress,
) -> Result<bool> {
    let base_class = access.read8(addr, reg::BASE_CLASS)?;
    let sub_class = access.read8(addr, reg::SUBCLASS)?;
    let header = access.read8(addr, reg::HEADER_TYPE)? & !reg::HEADER_MULTIFUNCTION;
    Ok(base_class == reg::CLASS_BRIDGE
        && sub_class == reg::SUBCLASS_PCI_BRIDGE
        && header == reg::HEADER_TYPE_BRIDGE)
}

/// Scratch-program a parent bridge so the next bus becomes reachable.
fn open_scratch_window<A: ConfigAccess + ?Sized>(
    access: &mut A,
    parent: &mut BridgeNode,
    next_bus: u8,
) -> Result<()> {
    access.write8(parent.address, reg::SECONDARY_BUS, next_bus)?;
    access.write8(parent.address, reg::SUBORDINATE_BUS, 0xff)?;
    parent.secondary_bus = next_bus;
    parent.subordinate_bus = 0xff;
    Ok(())
}

/// Undo scratch numbering on every bridge touched so far.
fn clear_scratch<A: ConfigAccess + ?Sized>(
    access: &mut A,
    root_port: &BridgeNode,
    switches: &[BridgeNode],
) -> Result<()> {
    for bridge in switches.iter().rev().chain(core::iter::once(root_port)) {
        access.write8(bridge.address, reg::SECONDARY_BUS, 0)?;
        access.write8(bridge.address, reg::SUBORDINATE_BUS, 0)?;
    }
    Ok(())
}

/// Any populated device slot other than 0 on a chain bus means fan-out.
fn find_sibling<A: ConfigAccess + ?Sized>(
    access: &mut A,
    bus: u8,
) -> Result<Option<ConfigAddress>> {
    for device in 1..32 {
        let addr = ConfigAddress::new(bus, device, 0);
        if access.read16(addr, reg::VENDOR_ID)? != 0xffff {
            return Ok(Some(addr));
        }
    }
    Ok(None)
}

/// The terminal device: function 0 plus, when the multi-function bit is set,
/// any populated companion functions (the GPU's HDMI audio function).
fn collect_endpoints<A: ConfigAccess + ?Sized>(
    access: &mut A,
    first: ConfigAddress,
) -> Result<Vec<EndpointNode>> {
    let mut endpoints = Vec::new();
    endpoints.push(EndpointNode::read_from(access, first)?);
    let header = access.read8(first, reg::HEADER_TYPE)?;
    if header & reg::HEADER_MULTIFUNCTION != 0 {
        for function in 1..8 {
            let addr = first.with_function(function);
            if access.read16(addr, reg::VENDOR_ID)? != 0xffff {
                endpoints.push(EndpointNode::read_from(access, addr)?);
            }
        }
    }
    Ok(endpoints)
}

/// Walk the chain from `root` down to the target function.
///
/// An absent root yields [`ChainDiscovery::Absent`] without performing a
/// single write. A chain that breaks off mid-way, a non-bridge intermediate
/// function, or a depth beyond [`MAX_CHAIN_DEPTH`] fails with
/// [`BringUpError::TopologyNotFound`].
pub fn discover<A: ConfigAccess + ?Sized>(
    access: &mut A,
    root: ConfigAddress,
    base_bus: u8,
    target: &TargetDevice,
) -> Result<ChainDiscovery> {
    let vendor = access.read16(root, reg::VENDOR_ID)?;
    if vendor == 0xffff {
        debug!("root port {root} reads all-ones, chain absent");
        return Ok(ChainDiscovery::Absent);
    }
    if !is_bridge_function(access, root)? {
        warn!("root port {root} is not a PCI-PCI bridge");
        return Err(BringUpError::TopologyNotFound);
    }

    let mut root_port = BridgeNode::new(root);
    let mut switches: Vec<BridgeNode> = Vec::new();

    for depth in 0..MAX_CHAIN_DEPTH {
        let Some(next_bus) = base_bus.checked_add(depth as u8) else {
            clear_scratch(access, &root_port, &switches)?;
            return Err(BringUpError::BusRangeExhausted {
                base: base_bus,
                depth,
            });
        };
        let parent = switches.last_mut().unwrap_or(&mut root_port);
        open_scratch_window(access, parent, next_bus)?;

        let next = ConfigAddress::new(next_bus, 0, 0);
        let vendor = access.read16(next, reg::VENDOR_ID)?;
        if vendor == 0xffff {
            warn!("chain breaks at depth {depth}: bus {next_bus:#04x} reads all-ones");
            clear_scratch(access, &root_port, &switches)?;
            return Err(BringUpError::TopologyNotFound);
        }
        if let Some(at) = find_sibling(access, next_bus)? {
            warn!("unexpected branching at {at}");
            clear_scratch(access, &root_port, &switches)?;
            return Ok(ChainDiscovery::Branched { at });
        }

        // Switches may carry the same vendor as the GPU, so bridge-ness is
        // decided before target matching.
        if is_bridge_function(access, next)? {
            switches.push(BridgeNode::new(next));
            continue;
        }
        let device_id = access.read16(next, reg::DEVICE_ID)?;
        let base_class = access.read8(next, reg::BASE_CLASS)?;
        if target.matches(vendor, device_id, base_class) {
            let endpoints = collect_endpoints(access, next)?;
            debug!(
                "chain found: {} switches, endpoint {:04x}:{:04x} at {} (+{} companions)",
                switches.len(),
                vendor,
                device_id,
                next,
                endpoints.len() - 1,
            );
            return Ok(ChainDiscovery::Found(Chain {
                root_port,
                switches,
                endpoints,
            }));
        }

        warn!("unexpected function {next} (class {base_class:02x}), not bridge or target");
        clear_scratch(access, &root_port, &switches)?;
        return Err(BringUpError::TopologyNotFound);
    }

    warn!("chain deeper than {MAX_CHAIN_DEPTH} bridges, giving up");
    clear_scratch(access, &root_port, &switches)?;
    Err(BringUpError::TopologyNotFound)
}
