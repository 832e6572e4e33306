//! Bus-number allocation.
//!
//! Firmware-assigned bus ranges below the configured base are locked and
//! unreachable, so numbering always starts at the base (the lowest range
//! observed to be unlocked, supplied as configuration). Choosing the lowest
//! available contiguous range keeps the chain as close as possible to the
//! firmware-assigned resources, which a future option-ROM POST step wants.

use alloc::vec::Vec;

use log::debug;

use crate::access::{ConfigAccess, ConfigAddress, reg};
use crate::error::{BringUpError, Result};
use crate::topology::Chain;

/// Final bus numbers for one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusAssignment {
    pub address: ConfigAddress,
    pub primary: u8,
    pub secondary: u8,
    pub subordinate: u8,
}

/// Compute the numbering for a chain of N switches behind the root port,
/// starting at `base`: the root port decodes `[base, base+N]`, switch `i`
/// (on bus `base + i`) forwards to `base + i + 1`, and the endpoint lives on
/// `base + N`. Every bridge's subordinate is the leaf bus, since the whole
/// subtree of every bridge on a linear chain ends at the endpoint.
///
/// Pure function of the chain depth and base; programming is separate.
pub fn plan(chain: &Chain, base: u8) -> Result<Vec<BusAssignment>> {
    let depth = chain.depth();
    let leaf = (base as usize)
        .checked_add(depth)
        .filter(|leaf| *leaf <= 0xff)
        .ok_or(BringUpError::BusRangeExhausted { base, depth })? as u8;

    let mut assignments = Vec::with_capacity(depth + 1);
    assignments.push(BusAssignment {
        address: chain.root_port.address,
        primary: chain.root_port.address.bus,
        secondary: base,
        subordinate: leaf,
    });
    for (i, switch) in chain.switches.iter().enumerate() {
        let own_bus = base + i as u8;
        assignments.push(BusAssignment {
            address: switch.address,
            primary: own_bus,
            secondary: own_bus + 1,
            subordinate: leaf,
        });
    }
    Ok(assignments)
}

/// Write the planned numbering root-to-leaf, so each write only affects an
/// already-traversed path segment, and record it on the chain nodes.
pub fn program<A: ConfigAccess + ?Sized>(
    access: &mut A,
    chain: &mut Chain,
    base: u8,
) -> Result<()> {
    let assignments = plan(chain, base)?;
    for (bridge, assignment) in chain.bridges_mut().zip(&assignments) {
        debug_assert_eq!(bridge.address, assignment.address);
        access.write8(bridge.address, reg::PRIMARY_BUS, assignment.primary)?;
        access.write8(bridge.address, reg::SECONDARY_BUS, assignment.secondary)?;
        access.write8(bridge.address, reg::SUBORDINATE_BUS, assignment.subordinate)?;
        bridge.primary_bus = assignment.primary;
        bridge.secondary_bus = assignment.secondary;
        bridge.subordinate_bus = assignment.subordinate;
        debug!(
            "{}: buses {:#04x}/{:#04x}/{:#04x}",
            bridge.address, assignment.primary, assignment.secondary, assignment.subordinate
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{discover_chain, gpu_chain};

    #[test]
    fn adjacent_bridges_share_bus_numbers() {
        let mut fabric = gpu_chain(3);
        let chain = discover_chain(&mut fabric);
        let plan = plan(&chain, 0x08).unwrap();

        assert_eq!(plan.len(), 4);
        for pair in plan.windows(2) {
            assert_eq!(pair[0].secondary, pair[1].primary);
            assert_eq!(pair[1].secondary, pair[1].primary + 1);
        }
        // 3-switch chain at base 0x08: 08/09, 09/0a, 0a/0b, endpoint 0x0b.
        assert_eq!(plan[1].primary, 0x08);
        assert_eq!(plan[1].secondary, 0x09);
        assert_eq!(plan[2].primary, 0x09);
        assert_eq!(plan[2].secondary, 0x0a);
        assert_eq!(plan[3].primary, 0x0a);
        assert_eq!(plan[3].secondary, 0x0b);
        for a in &plan {
            assert_eq!(a.subordinate, 0x0b);
        }
    }

    #[test]
    fn programming_clamps_scratch_subordinates() {
        let mut fabric = gpu_chain(2);
        let mut chain = discover_chain(&mut fabric);
        // Discovery leaves subordinate at the scratch value.
        assert_eq!(chain.root_port.subordinate_bus, 0xff);
        program(&mut fabric, &mut chain, 0x08).unwrap();
        assert_eq!(chain.root_port.secondary_bus, 0x08);
        assert_eq!(chain.root_port.subordinate_bus, 0x0a);
        let root = chain.root_port.address;
        assert_eq!(fabric.reg8(root, reg::SUBORDINATE_BUS), 0x0a);
    }

    #[test]
    fn base_too_high_exhausts_bus_range() {
        let mut fabric = gpu_chain(2);
        let chain = discover_chain(&mut fabric);
        assert_eq!(
            plan(&chain, 0xfe),
            Err(BringUpError::BusRangeExhausted {
                base: 0xfe,
                depth: 2
            })
        );
    }

    #[test]
    fn children_fall_inside_parent_range() {
        let mut fabric = gpu_chain(3);
        let chain = discover_chain(&mut fabric);
        let plan = plan(&chain, 0x08).unwrap();
        for pair in plan.windows(2) {
            assert!(pair[0].secondary <= pair[1].primary);
            assert!(pair[1].subordinate <= pair[0].subordinate);
        }
        let leaf = plan.last().unwrap();
        assert!(leaf.secondary <= leaf.subordinate);
    }
}
