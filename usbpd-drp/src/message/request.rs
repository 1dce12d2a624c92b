//! Request data objects, sent by a sink to select a source capability.
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;

use crate::message::_20millivolts_mod::_20millivolts;
use crate::message::_50milliamperes_mod::_50milliamperes;
use crate::message::pdo::{self, Augmented, Capabilities};
use crate::message::units::{ElectricCurrent, ElectricPotential};

bitfield! {
    /// Raw view of an RDO, for object-position dispatch.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct RawDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14.
        pub object_position: u8 @ 28..=31,
        /// Operating current in 10 mA units (fixed/variable RDOs).
        pub raw_operating_current: u16 @ 10..=19,
    }
}

bitfield! {
    /// RDO against a fixed or variable supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14.
        pub object_position: u8 @ 28..=31,
        /// GiveBack supported.
        pub giveback_flag: bool @ 27,
        /// Set when the source cannot satisfy the sink's requirement.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend.
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported.
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 22,
        /// Operating current in 10 mA units.
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10 mA units.
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableSupply {
    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    /// The requested maximum operating current.
    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield!(
    /// RDO against a programmable power supply APDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Pps(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14.
        pub object_position: u8 @ 28..=31,
        /// Set when the source cannot satisfy the sink's requirement.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend.
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported.
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20 mV units.
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50 mA units.
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Pps {
    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

/// A power request towards a source.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSource {
    /// Request against a fixed or variable supply PDO.
    FixedVariableSupply(FixedVariableSupply),
    /// Request against a PPS APDO.
    Pps(Pps),
    /// Request against an unrecognized PDO kind.
    Unknown(RawDataObject),
}

impl PowerSource {
    /// The 1-indexed object position of the selected PDO.
    pub fn object_position(&self) -> u8 {
        match self {
            PowerSource::FixedVariableSupply(p) => p.object_position(),
            PowerSource::Pps(p) => p.object_position(),
            PowerSource::Unknown(p) => p.object_position(),
        }
    }

    /// The raw wire word.
    pub fn raw(&self) -> u32 {
        match self {
            PowerSource::FixedVariableSupply(p) => p.0,
            PowerSource::Pps(p) => p.0,
            PowerSource::Unknown(p) => p.0,
        }
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        match self {
            PowerSource::FixedVariableSupply(p) => p.operating_current(),
            PowerSource::Pps(p) => p.operating_current(),
            PowerSource::Unknown(p) => ElectricCurrent::new::<centiampere>(p.raw_operating_current().into()),
        }
    }
}

/// Parse a received RDO against the capabilities it selects from.
pub fn parse_raw_rdo(raw: u32, capabilities: &Capabilities) -> PowerSource {
    let rdo = RawDataObject(raw);

    match capabilities.kind_at_position(rdo.object_position()) {
        Some(pdo::Kind::FixedSupply | pdo::Kind::VariableSupply) => {
            PowerSource::FixedVariableSupply(FixedVariableSupply(raw))
        }
        Some(pdo::Kind::Pps) => PowerSource::Pps(Pps(raw)),
        _ => PowerSource::Unknown(rdo),
    }
}

/// Errors that can occur when building a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// A requested (specific) voltage does not exist in the PDOs.
    VoltageMismatch,
}

/// Requestable voltage levels.
#[derive(Debug)]
pub enum VoltageRequest {
    /// The safe 5 V supply.
    Safe5V,
    /// The highest voltage that the source can supply.
    Highest,
    /// A specific voltage.
    Specific(ElectricPotential),
}

/// Requestable currents.
#[derive(Debug)]
pub enum CurrentRequest {
    /// The highest current that the source can supply.
    Highest,
    /// A specific current.
    Specific(ElectricCurrent),
}

impl PowerSource {
    /// Find the highest fixed voltage in the source capabilities.
    fn find_highest_fixed_voltage(capabilities: &Capabilities) -> Option<(usize, &pdo::FixedSupply)> {
        let mut selected_pdo = None;

        for (index, cap) in capabilities.pdos().iter().enumerate() {
            if let pdo::PowerDataObject::FixedSupply(fixed_supply) = cap {
                selected_pdo = match selected_pdo {
                    None => Some((index, fixed_supply)),
                    Some(x) => {
                        if fixed_supply.voltage() > x.1.voltage() {
                            Some((index, fixed_supply))
                        } else {
                            selected_pdo
                        }
                    }
                };
            }
        }

        selected_pdo
    }

    /// Find a specific fixed voltage in the source capabilities.
    fn find_specific_fixed_voltage(
        capabilities: &Capabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &pdo::FixedSupply)> {
        for (index, cap) in capabilities.pdos().iter().enumerate() {
            if let pdo::PowerDataObject::FixedSupply(fixed_supply) = cap {
                if fixed_supply.voltage() == voltage {
                    return Some((index, fixed_supply));
                }
            }
        }

        None
    }

    /// Build a request for a fixed supply.
    ///
    /// Finds a suitable PDO by evaluating the provided current and voltage
    /// requests against the source capabilities.
    pub fn new_fixed(
        current_request: CurrentRequest,
        voltage_request: VoltageRequest,
        capabilities: &Capabilities,
    ) -> Result<Self, Error> {
        let selected = match voltage_request {
            VoltageRequest::Safe5V => capabilities.vsafe_5v().map(|supply| (0, supply)),
            VoltageRequest::Highest => Self::find_highest_fixed_voltage(capabilities),
            VoltageRequest::Specific(x) => Self::find_specific_fixed_voltage(capabilities, x),
        };

        let Some((index, supply)) = selected else {
            return Err(Error::VoltageMismatch);
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(x) if x > supply.max_current() => (supply.max_current(), true),
            CurrentRequest::Specific(x) => (x, false),
        };

        let mut raw_current = current.get::<centiampere>() as u16;

        if raw_current > 0x3ff {
            error!("Clamping invalid current: {} mA", 10 * raw_current);
            raw_current = 0x3ff;
        }

        let object_position = index + 1;
        assert!(object_position > 0b0000 && object_position <= 0b1110);

        Ok(Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_raw_operating_current(raw_current)
                .with_raw_max_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Build a request against a programmable power supply.
    pub fn new_pps(
        current_request: CurrentRequest,
        voltage: ElectricPotential,
        capabilities: &Capabilities,
    ) -> Result<Self, Error> {
        let mut selected = None;

        for (index, cap) in capabilities.pdos().iter().enumerate() {
            if let pdo::PowerDataObject::Augmented(Augmented::Spr(spr)) = cap {
                if spr.min_voltage() <= voltage && spr.max_voltage() >= voltage {
                    selected = Some((index, spr));
                    break;
                }
            }
        }

        let Some((index, supply)) = selected else {
            return Err(Error::VoltageMismatch);
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(x) if x > supply.max_current() => (supply.max_current(), true),
            CurrentRequest::Specific(x) => (x, false),
        };

        let raw_current = current.get::<_50milliamperes>() as u16;
        let raw_voltage = voltage.get::<_20millivolts>() as u16;

        let object_position = index + 1;
        assert!(object_position > 0b0000 && object_position <= 0b1110);

        Ok(Self::Pps(
            Pps(0)
                .with_raw_output_voltage(raw_voltage)
                .with_raw_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::millivolt;

    use super::{CurrentRequest, PowerSource, VoltageRequest, parse_raw_rdo};
    use crate::message::pdo::{Capabilities, FixedSupply};
    use crate::message::units::ElectricCurrent;

    fn caps_5v3a_20v225() -> Capabilities {
        Capabilities::from_objects(&[
            FixedSupply::default().with_raw_voltage(100).with_raw_max_current(300).0,
            FixedSupply::default().with_raw_voltage(400).with_raw_max_current(225).0,
        ])
    }

    #[test]
    fn builds_5v_request_at_full_current() {
        let caps = caps_5v3a_20v225();
        let request = PowerSource::new_fixed(CurrentRequest::Highest, VoltageRequest::Safe5V, &caps).unwrap();

        assert_eq!(request.object_position(), 1);
        assert_eq!(request.operating_current().get::<milliampere>(), 3000);
    }

    #[test]
    fn flags_capability_mismatch() {
        let caps = caps_5v3a_20v225();
        let request = PowerSource::new_fixed(
            CurrentRequest::Specific(ElectricCurrent::new::<milliampere>(5000)),
            VoltageRequest::Highest,
            &caps,
        )
        .unwrap();

        let PowerSource::FixedVariableSupply(rdo) = request else {
            panic!("expected fixed supply request");
        };
        assert!(rdo.capability_mismatch());
        assert_eq!(rdo.object_position(), 2);
        // Clamped to what the source offers.
        assert_eq!(rdo.operating_current().get::<milliampere>(), 2250);
    }

    #[test]
    fn round_trips_through_raw_word() {
        let caps = caps_5v3a_20v225();
        let request = PowerSource::new_fixed(CurrentRequest::Highest, VoltageRequest::Safe5V, &caps).unwrap();

        let parsed = parse_raw_rdo(request.raw(), &caps);
        assert_eq!(parsed.object_position(), 1);
        assert_eq!(parsed.operating_current().get::<milliampere>(), 3000);
    }

    #[test]
    fn finds_specific_voltage() {
        let caps = caps_5v3a_20v225();
        let request = PowerSource::new_fixed(
            CurrentRequest::Highest,
            VoltageRequest::Specific(crate::message::units::ElectricPotential::new::<millivolt>(20_000)),
            &caps,
        )
        .unwrap();

        assert_eq!(request.object_position(), 2);
    }
}
