//! BIST data objects.
use proc_bitfield::bitfield;

/// BIST modes the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BistMode {
    /// Carrier mode: transmit a continuous BMC pattern.
    CarrierMode2,
    /// Test-data mode: swallow all traffic until reset.
    TestData,
    /// Shared-capacity test mode entry.
    SharedModeEnter,
    /// Shared-capacity test mode exit.
    SharedModeExit,
    /// Any other (unsupported) mode.
    Other(u8),
}

impl From<u8> for BistMode {
    fn from(value: u8) -> Self {
        match value {
            0b0101 => BistMode::CarrierMode2,
            0b1000 => BistMode::TestData,
            0b1001 => BistMode::SharedModeEnter,
            0b1010 => BistMode::SharedModeExit,
            other => BistMode::Other(other),
        }
    }
}

impl From<BistMode> for u8 {
    fn from(value: BistMode) -> Self {
        match value {
            BistMode::CarrierMode2 => 0b0101,
            BistMode::TestData => 0b1000,
            BistMode::SharedModeEnter => 0b1001,
            BistMode::SharedModeExit => 0b1010,
            BistMode::Other(other) => other,
        }
    }
}

bitfield! {
    /// The BIST data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BistDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The requested BIST mode.
        pub mode: u8 [get BistMode, set BistMode] @ 28..=31,
    }
}

#[cfg(test)]
mod tests {
    use super::{BistDataObject, BistMode};

    #[test]
    fn shared_mode_codes() {
        let enter = BistDataObject(0).with_mode(BistMode::SharedModeEnter);
        assert_eq!(enter.mode(), BistMode::SharedModeEnter);
        assert_eq!(enter.0 >> 28, 0b1001);
    }
}
