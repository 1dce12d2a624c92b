//! The Alert data object, including the extended-alert events used for
//! the USB-PD power button.
use proc_bitfield::bitfield;

bitfield! {
    /// The Alert data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Ado(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery status change.
        pub battery_status_change: bool @ 31,
        /// Over-current protection event.
        pub ocp: bool @ 30,
        /// Over-temperature protection event.
        pub otp: bool @ 29,
        /// Operating condition change.
        pub operating_condition_change: bool @ 28,
        /// Source input change.
        pub source_input_change: bool @ 27,
        /// Over-voltage protection event.
        pub ovp: bool @ 26,
        /// Extended alert event (r3.1); the type is in `extended_alert_type`.
        pub extended_alert: bool @ 24,
        /// Fixed batteries with a status change.
        pub fixed_batteries: u8 @ 20..=23,
        /// Hot-swappable batteries with a status change.
        pub hot_swappable_batteries: u8 @ 16..=19,
        /// Extended alert event type.
        pub extended_alert_type: u8 @ 0..=3,
    }
}

/// Extended-alert event types carried in an ADO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExtendedAlertType {
    /// DP status update during modal operation.
    DpStatusUpdate,
    /// USB-PD power button press.
    PowerButtonPress,
    /// USB-PD power button release.
    PowerButtonRelease,
    /// Controller-initiated wake.
    ControllerWake,
    /// Power state change (r3.1).
    PowerStateChange,
    /// Reserved code.
    Reserved,
}

impl From<u8> for ExtendedAlertType {
    fn from(value: u8) -> Self {
        match value {
            0b0001 => ExtendedAlertType::DpStatusUpdate,
            0b0010 => ExtendedAlertType::PowerButtonPress,
            0b0011 => ExtendedAlertType::PowerButtonRelease,
            0b0100 => ExtendedAlertType::ControllerWake,
            0b0101 => ExtendedAlertType::PowerStateChange,
            _ => ExtendedAlertType::Reserved,
        }
    }
}

impl From<ExtendedAlertType> for u8 {
    fn from(value: ExtendedAlertType) -> Self {
        match value {
            ExtendedAlertType::DpStatusUpdate => 0b0001,
            ExtendedAlertType::PowerButtonPress => 0b0010,
            ExtendedAlertType::PowerButtonRelease => 0b0011,
            ExtendedAlertType::ControllerWake => 0b0100,
            ExtendedAlertType::PowerStateChange => 0b0101,
            ExtendedAlertType::Reserved => 0b1111,
        }
    }
}

impl Ado {
    /// The extended-alert event, if this ADO carries one.
    pub fn extended_alert_event(&self) -> Option<ExtendedAlertType> {
        self.extended_alert().then(|| self.extended_alert_type().into())
    }

    /// Build an ADO announcing a chipset power state change.
    pub fn new_power_state_change() -> Self {
        Ado(0)
            .with_extended_alert(true)
            .with_extended_alert_type(ExtendedAlertType::PowerStateChange.into())
    }
}

#[cfg(test)]
mod tests {
    use super::{Ado, ExtendedAlertType};

    #[test]
    fn extended_alert_dispatch() {
        let press = Ado(0)
            .with_extended_alert(true)
            .with_extended_alert_type(ExtendedAlertType::PowerButtonPress.into());
        assert_eq!(press.extended_alert_event(), Some(ExtendedAlertType::PowerButtonPress));

        let ocp = Ado(0).with_ocp(true);
        assert_eq!(ocp.extended_alert_event(), None);
    }
}
