//! Error taxonomy for a bring-up pass.

use core::fmt;

/// Result alias used throughout the engine.
pub type Result<T> = core::result::Result<T, BringUpError>;

/// Everything that can go wrong during one bring-up pass.
///
/// None of these are retried internally: configuration-space state does not
/// change without an external trigger (power transition, physical reseat)
/// that a retry loop cannot produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpError {
    /// Malformed register access (bad offset or misaligned width). This is a
    /// programming defect and aborts the pass immediately.
    InvalidAccess { offset: u16 },
    /// The expected bridge chain is not present or broke off mid-way. The
    /// boot environment proceeds without eGPU support.
    TopologyNotFound,
    /// The configured base bus plus the chain depth does not fit below 256.
    BusRangeExhausted { base: u8, depth: usize },
    /// A BAR or bridge window did not fit in its configured address window.
    AddressSpaceExhausted,
    /// Two assigned BAR ranges overlap, or an assignment is misaligned.
    /// Should be unreachable; treated as a defect.
    BarOverlap,
    /// Buses and BARs were programmed but the Data Link Layer did not come
    /// up. A distinct partial-success outcome: an OS-level fixer can still
    /// use the programmed resources even though pre-boot POST cannot.
    LinkNotTrained,
}

impl fmt::Display for BringUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAccess { offset } => {
                write!(f, "invalid config-space access at offset {offset:#x}")
            }
            Self::TopologyNotFound => write!(f, "expected bridge chain not found"),
            Self::BusRangeExhausted { base, depth } => write!(
                f,
                "bus range exhausted: base {base:#04x} + {depth} bridges exceeds 0xff"
            ),
            Self::AddressSpaceExhausted => write!(f, "address window exhausted"),
            Self::BarOverlap => write!(f, "overlapping BAR assignment"),
            Self::LinkNotTrained => write!(f, "data link layer did not come up"),
        }
    }
}
