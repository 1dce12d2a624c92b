//! Battery_Capabilities (extended) and Battery_Status (data) codecs.
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

/// Capacity value meaning "unknown" in 0.1 Wh fields.
pub const CAPACITY_UNKNOWN: u16 = 0xFFFF;

/// The nine-byte Battery_Capabilities extended message body.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryCapabilities {
    /// Vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
    /// Design capacity in 0.1 Wh units, or [`CAPACITY_UNKNOWN`].
    pub design_capacity: u16,
    /// Last full charge capacity in 0.1 Wh units, or [`CAPACITY_UNKNOWN`].
    pub full_charge_capacity: u16,
    /// Set when the referenced battery slot does not exist.
    pub invalid_battery_reference: bool,
}

impl BatteryCapabilities {
    /// Serialize the body, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(&mut buf[0..2], self.vid);
        LittleEndian::write_u16(&mut buf[2..4], self.pid);
        LittleEndian::write_u16(&mut buf[4..6], self.design_capacity);
        LittleEndian::write_u16(&mut buf[6..8], self.full_charge_capacity);
        buf[8] = u8::from(self.invalid_battery_reference);
        9
    }
}

/// Battery charging status codes in the Battery_Status data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatteryChargingStatus {
    /// Battery is charging.
    Charging,
    /// Battery is discharging.
    Discharging,
    /// Battery is idle.
    Idle,
    /// Reserved code.
    Reserved,
}

impl From<u8> for BatteryChargingStatus {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => BatteryChargingStatus::Charging,
            0b01 => BatteryChargingStatus::Discharging,
            0b10 => BatteryChargingStatus::Idle,
            _ => BatteryChargingStatus::Reserved,
        }
    }
}

impl From<BatteryChargingStatus> for u8 {
    fn from(value: BatteryChargingStatus) -> Self {
        match value {
            BatteryChargingStatus::Charging => 0b00,
            BatteryChargingStatus::Discharging => 0b01,
            BatteryChargingStatus::Idle => 0b10,
            BatteryChargingStatus::Reserved => 0b11,
        }
    }
}

bitfield! {
    /// The Battery_Status data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BatteryStatusDo(pub u32): Debug, FromStorage, IntoStorage {
        /// State of charge in 0.1 Wh units, or 0xFFFF when unknown.
        pub capacity: u16 @ 16..=31,
        /// Battery charging status.
        pub charging_status: u8 [get BatteryChargingStatus, set BatteryChargingStatus] @ 10..=11,
        /// Battery present.
        pub present: bool @ 9,
        /// The referenced battery slot does not exist.
        pub invalid_reference: bool @ 8,
    }
}

impl BatteryStatusDo {
    /// Build a status object for a present battery.
    pub fn new_present(capacity_tenth_wh: u16, charging_status: BatteryChargingStatus) -> Self {
        BatteryStatusDo(0)
            .with_present(true)
            .with_capacity(capacity_tenth_wh)
            .with_charging_status(charging_status)
    }

    /// Build a status object for a missing or invalid battery slot.
    pub fn new_invalid() -> Self {
        BatteryStatusDo(0).with_invalid_reference(true).with_capacity(CAPACITY_UNKNOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::{BatteryCapabilities, BatteryChargingStatus, BatteryStatusDo, CAPACITY_UNKNOWN};

    #[test]
    fn capabilities_layout() {
        let caps = BatteryCapabilities {
            vid: 0x1234,
            pid: 0x5678,
            design_capacity: 570,
            full_charge_capacity: 520,
            invalid_battery_reference: false,
        };

        let mut buf = [0u8; 9];
        assert_eq!(caps.to_bytes(&mut buf), 9);
        assert_eq!(&buf[0..2], &[0x34, 0x12]);
        assert_eq!(&buf[4..6], &[0x3A, 0x02]);
        assert_eq!(buf[8], 0);
    }

    #[test]
    fn status_object() {
        let status = BatteryStatusDo::new_present(520, BatteryChargingStatus::Discharging);
        assert!(status.present());
        assert_eq!(status.capacity(), 520);
        assert_eq!(status.charging_status(), BatteryChargingStatus::Discharging);

        let invalid = BatteryStatusDo::new_invalid();
        assert!(invalid.invalid_reference());
        assert_eq!(invalid.capacity(), CAPACITY_UNKNOWN);
    }
}
