//! USB Type-C / USB-PD dual-role protocol engine.
//!
//! The crate decomposes into five cooperating layers:
//!
//! - [`timer`] — the per-port deadline service all state machines share,
//! - [`tc`] — the Type-C connection state machine (CC pulls, attach,
//!   Try.SRC, low-power mode),
//! - [`pe`] — the USB-PD policy engine (contracts, resets, swaps, VDMs,
//!   Data Reset, EPR),
//! - [`alt_mode`] — DisplayPort, Thunderbolt-compat and USB4 entry
//!   modules, and
//! - [`dpm`] — the device policy manager, which arbitrates shared source
//!   current across ports and fans mode-entry requests into VDMs.
//!
//! Hardware access goes through the traits in `usbpd-drp-traits`; all
//! engine state is re-derived from the wire on every attach.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

// This module must come first, so that the others see its macros.
mod fmt;

pub mod alt_mode;
pub mod counters;
pub mod dpm;
pub mod engine;
pub mod message;
pub mod pe;
pub mod port;
pub mod tc;
pub mod timer;
pub mod times;

#[cfg(test)]
pub(crate) mod dummy;

#[macro_use]
extern crate uom;

pub use usbpd_drp_traits::{PdRev, Sop};

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRole {
    /// Supplies vBus.
    Source,
    /// Draws from vBus.
    Sink,
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRole {
    /// Upstream facing port.
    Ufp,
    /// Downstream facing port.
    Dfp,
}

impl DataRole {
    /// The opposite role.
    pub fn flipped(self) -> Self {
        match self {
            DataRole::Ufp => DataRole::Dfp,
            DataRole::Dfp => DataRole::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}

/// Connector orientation, latched on attach.
///
/// The `Dts` variants mark a Debug-Test-System partner, which presents
/// terminations on both CC lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Polarity {
    /// CC1 carries the PD channel.
    Cc1,
    /// CC2 carries the PD channel.
    Cc2,
    /// CC1 active, partner is a debug accessory.
    Cc1Dts,
    /// CC2 active, partner is a debug accessory.
    Cc2Dts,
}

impl Polarity {
    /// Whether the connector is flipped (CC2 active).
    pub fn is_flipped(self) -> bool {
        matches!(self, Polarity::Cc2 | Polarity::Cc2Dts)
    }

    /// Whether the partner is a Debug-Test-System.
    pub fn is_dts(self) -> bool {
        matches!(self, Polarity::Cc1Dts | Polarity::Cc2Dts)
    }

    /// Strip the DTS marker, keeping the orientation.
    pub fn without_dts(self) -> Self {
        match self {
            Polarity::Cc1 | Polarity::Cc1Dts => Polarity::Cc1,
            Polarity::Cc2 | Polarity::Cc2Dts => Polarity::Cc2,
        }
    }
}

/// Classification of the port partner from CC terminations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcState {
    /// No partner present.
    None,
    /// A sink (UFP) is attached.
    UfpAttached,
    /// A source (DFP) is attached.
    DfpAttached,
    /// Debug accessory seen from the sink side.
    UfpDebugAcc,
    /// Debug accessory seen from the source side.
    DfpDebugAcc,
    /// Audio accessory (Ra/Ra).
    UfpAudioAcc,
    /// Not yet sampled.
    #[default]
    Unset,
}
