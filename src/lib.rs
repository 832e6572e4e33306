//! Pre-boot bring-up engine for an Oculink-attached eGPU.
//!
//! Platform firmware enumerates the PCIe hierarchy only two hops deep, which
//! leaves the switch chain between the host root port and the GPU without bus
//! numbers, BARs, or an enabled link. This crate walks the chain, numbers the
//! buses, sizes and assigns every BAR, programs the bridge windows, and runs
//! the command/power/link enables, all through raw configuration space before
//! the OS takes over.
//!
//! [`engine::bring_up`] is the single entry point; [`access::ConfigAccess`]
//! abstracts the register mechanism (ECAM or legacy port I/O).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod access;
pub mod bar;
pub mod busnr;
pub mod ecam;
pub mod engine;
pub mod error;
pub mod link;
pub mod mcfg;
#[cfg(target_arch = "x86_64")]
pub mod portio;
pub mod topology;

#[cfg(test)]
mod testutil;

pub use engine::{BringUpResult, EngineConfig, bring_up};
pub use error::{BringUpError, Result};
