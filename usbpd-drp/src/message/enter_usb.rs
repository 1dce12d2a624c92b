//! The Enter_USB data object, per USB-PD r3.1 Table 6-47.
use proc_bitfield::bitfield;

use crate::message::vdm::UsbSpeed;

/// USB modes requestable through Enter_USB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbMode {
    /// USB 2.0.
    Usb2,
    /// USB 3.2.
    Usb3,
    /// USB4.
    Usb4,
    /// Reserved code.
    Reserved,
}

impl From<u8> for UsbMode {
    fn from(value: u8) -> Self {
        match value {
            0b000 => UsbMode::Usb2,
            0b001 => UsbMode::Usb3,
            0b010 => UsbMode::Usb4,
            _ => UsbMode::Reserved,
        }
    }
}

impl From<UsbMode> for u8 {
    fn from(value: UsbMode) -> Self {
        match value {
            UsbMode::Usb2 => 0b000,
            UsbMode::Usb3 => 0b001,
            UsbMode::Usb4 => 0b010,
            UsbMode::Reserved => 0b111,
        }
    }
}

/// Cable types carried in the Enter_USB DO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableType {
    /// Passive cable.
    Passive,
    /// Active cable, re-timed.
    ActiveRetimer,
    /// Active cable, re-driven.
    ActiveRedriver,
    /// Optically isolated.
    Optical,
}

impl From<u8> for CableType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => CableType::Passive,
            0b01 => CableType::ActiveRetimer,
            0b10 => CableType::ActiveRedriver,
            _ => CableType::Optical,
        }
    }
}

impl From<CableType> for u8 {
    fn from(value: CableType) -> Self {
        match value {
            CableType::Passive => 0b00,
            CableType::ActiveRetimer => 0b01,
            CableType::ActiveRedriver => 0b10,
            CableType::Optical => 0b11,
        }
    }
}

bitfield! {
    /// The Enter_USB data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct EnterUsbDo(pub u32): Debug, FromStorage, IntoStorage {
        /// Requested USB mode.
        pub usb_mode: u8 [get UsbMode, set UsbMode] @ 28..=30,
        /// USB4 dual-role-data capable.
        pub usb4_drd_cap: bool @ 26,
        /// USB3 dual-role-data capable.
        pub usb3_drd_cap: bool @ 25,
        /// Cable speed, encoded like the cable VDO speed field.
        pub cable_speed: u8 @ 21..=23,
        /// Cable type.
        pub cable_type: u8 [get CableType, set CableType] @ 19..=20,
        /// Cable current capability (0b01 = 3 A, 0b10 = 5 A).
        pub cable_current: u8 @ 17..=18,
        /// PCIe tunneling supported.
        pub pcie_supported: bool @ 16,
        /// DisplayPort tunneling supported.
        pub dp_supported: bool @ 15,
        /// Thunderbolt-compat supported.
        pub tbt_supported: bool @ 14,
        /// Host present on this port.
        pub host_present: bool @ 13,
    }
}

impl EnterUsbDo {
    /// Build a USB4 entry object for a given cable.
    pub fn new_usb4(cable_speed: UsbSpeed, cable_type: CableType) -> Self {
        EnterUsbDo(0)
            .with_usb_mode(UsbMode::Usb4)
            .with_cable_speed(match cable_speed {
                UsbSpeed::Usb20 => 0b000,
                UsbSpeed::Usb32Gen1 => 0b001,
                UsbSpeed::Usb32Gen2 => 0b010,
                UsbSpeed::Usb40Gen3 => 0b011,
                UsbSpeed::Usb40Gen4 => 0b100,
            })
            .with_cable_type(cable_type)
            .with_usb4_drd_cap(true)
            .with_usb3_drd_cap(true)
            .with_host_present(true)
    }
}

#[cfg(test)]
mod tests {
    use super::{CableType, EnterUsbDo, UsbMode};
    use crate::message::vdm::UsbSpeed;

    #[test]
    fn usb4_entry_object() {
        let eudo = EnterUsbDo::new_usb4(UsbSpeed::Usb40Gen3, CableType::ActiveRetimer);

        assert_eq!(eudo.usb_mode(), UsbMode::Usb4);
        assert_eq!(eudo.cable_speed(), 0b011);
        assert_eq!(eudo.cable_type(), CableType::ActiveRetimer);
        assert!(eudo.host_present());
    }
}
