//! Power data objects, as carried by capability messages in both
//! directions.
use heapless::Vec;
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;
use uom::si::electric_potential::decivolt;
use uom::si::power::watt;

use crate::message::_50milliamperes_mod::_50milliamperes;
use crate::message::_50millivolts_mod::_50millivolts;
use crate::message::_250milliwatts_mod::_250milliwatts;
use crate::message::units::{ElectricCurrent, ElectricPotential, Power};

/// Maximum number of PDOs in an SPR capabilities message.
pub const MAX_PDOS: usize = 7;

/// Maximum number of PDOs in an EPR capabilities message (7 SPR + 4 EPR).
pub const MAX_EPR_PDOS: usize = 11;

/// Kinds of supplies a PDO can describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kind {
    /// Fixed voltage supply.
    FixedSupply,
    /// Battery supply.
    Battery,
    /// Variable voltage supply.
    VariableSupply,
    /// Programmable power supply.
    Pps,
    /// EPR adjustable voltage supply.
    Avs,
}

/// One typed power data object.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerDataObject {
    /// Fixed voltage supply.
    FixedSupply(FixedSupply),
    /// Battery supply.
    Battery(Battery),
    /// Variable voltage supply.
    VariableSupply(VariableSupply),
    /// Augmented supply (PPS or EPR AVS).
    Augmented(Augmented),
    /// Unknown kind of power data object.
    Unknown(RawPowerDataObject),
}

impl PowerDataObject {
    /// The raw wire word.
    pub fn raw(self) -> u32 {
        match self {
            PowerDataObject::FixedSupply(p) => p.0,
            PowerDataObject::Battery(p) => p.0,
            PowerDataObject::VariableSupply(p) => p.0,
            PowerDataObject::Augmented(Augmented::Spr(p)) => p.0,
            PowerDataObject::Augmented(Augmented::Epr(p)) => p.0,
            PowerDataObject::Augmented(Augmented::Unknown(p)) => p,
            PowerDataObject::Unknown(p) => p.0,
        }
    }

    /// The supply kind, if known.
    pub fn kind(self) -> Option<Kind> {
        match self {
            PowerDataObject::FixedSupply(_) => Some(Kind::FixedSupply),
            PowerDataObject::Battery(_) => Some(Kind::Battery),
            PowerDataObject::VariableSupply(_) => Some(Kind::VariableSupply),
            PowerDataObject::Augmented(Augmented::Spr(_)) => Some(Kind::Pps),
            PowerDataObject::Augmented(Augmented::Epr(_)) => Some(Kind::Avs),
            _ => None,
        }
    }

    /// Whether this PDO is a zero-filled padding entry.
    pub fn is_zero_padding(self) -> bool {
        self.raw() == 0
    }

    /// The maximum power this PDO can deliver, for policy decisions.
    pub fn max_power(self) -> Power {
        match self {
            PowerDataObject::FixedSupply(p) => p.voltage() * p.max_current(),
            PowerDataObject::Battery(p) => p.max_power(),
            PowerDataObject::VariableSupply(p) => p.max_voltage() * p.max_current(),
            PowerDataObject::Augmented(Augmented::Spr(p)) => p.max_voltage() * p.max_current(),
            PowerDataObject::Augmented(Augmented::Epr(p)) => p.pd_power(),
            _ => Power::new::<watt>(0),
        }
    }
}

/// Parse a raw wire word into a typed power data object.
pub fn parse_raw_pdo(raw: u32) -> PowerDataObject {
    let pdo = RawPowerDataObject(raw);
    match pdo.kind() {
        0b00 => PowerDataObject::FixedSupply(FixedSupply(raw)),
        0b01 => PowerDataObject::Battery(Battery(raw)),
        0b10 => PowerDataObject::VariableSupply(VariableSupply(raw)),
        0b11 => PowerDataObject::Augmented(match AugmentedRaw(raw).supply() {
            0b00 => Augmented::Spr(SprProgrammablePowerSupply(raw)),
            0b01 => Augmented::Epr(EprAdjustableVoltageSupply(raw)),
            x => {
                warn!("Unknown augmented PDO supply {}", x);
                Augmented::Unknown(raw)
            }
        }),
        _ => {
            warn!("Unknown PDO kind");
            PowerDataObject::Unknown(pdo)
        }
    }
}

bitfield! {
    /// A raw power data object, fallback for unknown supply types.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RawPowerDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The kind of power data object.
        pub kind: u8 @ 30..=31,
    }
}

bitfield! {
    /// A fixed voltage supply PDO.
    ///
    /// In the vSafe5V position (object 1), the upper bits carry the
    /// port's static capabilities. In a Sink_Capabilities message, bits
    /// 23..=24 instead encode the fast-role-swap current requirement.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply.
        pub kind: u8 @ 30..=31,
        /// Dual-role power.
        pub dual_role_power: bool @ 29,
        /// USB suspend supported.
        pub usb_suspend_supported: bool @ 28,
        /// Unconstrained power.
        pub unconstrained_power: bool @ 27,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data.
        pub dual_role_data: bool @ 25,
        /// Unchunked extended messages supported.
        pub unchunked_extended_messages_supported: bool @ 24,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 23,
        /// Sink_Capabilities only: required fast-role-swap current.
        pub fast_role_swap_current: u8 @ 23..=24,
        /// Peak current capability.
        pub peak_current: u8 @ 20..=21,
        /// Voltage in 50 mV units.
        pub raw_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units.
        pub raw_max_current: u16 @ 0..=9,
    }
}

#[allow(clippy::derivable_impls)]
impl Default for FixedSupply {
    fn default() -> Self {
        Self(0)
    }
}

impl FixedSupply {
    /// The supply voltage.
    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_voltage().into())
    }

    /// The maximum deliverable current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

/// Fast-role-swap current requirement codes in a sink's vSafe5V PDO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrsCurrent {
    /// Fast role swap not supported.
    NotSupported,
    /// Default USB power.
    UsbDefault,
    /// 1.5 A at 5 V.
    Current1A5,
    /// 3.0 A at 5 V.
    Current3A0,
}

impl From<u8> for FrsCurrent {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => FrsCurrent::NotSupported,
            0b01 => FrsCurrent::UsbDefault,
            0b10 => FrsCurrent::Current1A5,
            _ => FrsCurrent::Current3A0,
        }
    }
}

bitfield! {
    /// A battery supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery.
        pub kind: u8 @ 30..=31,
        /// Maximum voltage in 50 mV units.
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum voltage in 50 mV units.
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum allowable power in 250 mW units.
        pub raw_max_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    /// The maximum deliverable power.
    pub fn max_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_power().into())
    }
}

bitfield! {
    /// A variable (non-battery) supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Variable supply.
        pub kind: u8 @ 30..=31,
        /// Maximum voltage in 50 mV units.
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum voltage in 50 mV units.
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units.
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl VariableSupply {
    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    /// The maximum deliverable current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

/// Augmented power data objects.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Augmented {
    /// SPR programmable power supply.
    Spr(SprProgrammablePowerSupply),
    /// EPR adjustable voltage supply.
    Epr(EprAdjustableVoltageSupply),
    /// Unknown augmented supply.
    Unknown(u32),
}

bitfield! {
    /// Raw view of an augmented PDO, for supply-type dispatch.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct AugmentedRaw(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object.
        pub kind: u8 @ 30..=31,
        /// Augmented supply type.
        pub supply: u8 @ 28..=29,
        /// Type-specific capability bits.
        pub power_capabilities: u32 @ 0..=27,
    }
}

bitfield! {
    /// SPR programmable power supply APDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SprProgrammablePowerSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object.
        pub kind: u8 @ 30..=31,
        /// SPR programmable power supply.
        pub supply: u8 @ 28..=29,
        /// Power-limited flag.
        pub pps_power_limited: bool @ 27,
        /// Maximum voltage in 100 mV units.
        pub raw_max_voltage: u8 @ 17..=24,
        /// Minimum voltage in 100 mV units.
        pub raw_min_voltage: u8 @ 8..=15,
        /// Maximum current in 50 mA units.
        pub raw_max_current: u8 @ 0..=6,
    }
}

impl Default for SprProgrammablePowerSupply {
    fn default() -> Self {
        Self(0).with_kind(0b11).with_supply(0b00)
    }
}

impl SprProgrammablePowerSupply {
    /// The maximum programmable voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_max_voltage().into())
    }

    /// The minimum programmable voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_min_voltage().into())
    }

    /// The maximum deliverable current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_max_current().into())
    }
}

bitfield! {
    /// EPR adjustable voltage supply APDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct EprAdjustableVoltageSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object.
        pub kind: u8 @ 30..=31,
        /// EPR adjustable voltage supply.
        pub supply: u8 @ 28..=29,
        /// Peak current capability.
        pub peak_current: u8 @ 26..=27,
        /// Maximum voltage in 100 mV units.
        pub raw_max_voltage: u16 @ 17..=25,
        /// Minimum voltage in 100 mV units.
        pub raw_min_voltage: u8 @ 8..=15,
        /// Maximum power in 1 W units.
        pub raw_pd_power: u8 @ 0..=7,
    }
}

impl EprAdjustableVoltageSupply {
    /// The maximum adjustable voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_max_voltage().into())
    }

    /// The minimum adjustable voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_min_voltage().into())
    }

    /// The PD power rating.
    pub fn pd_power(&self) -> Power {
        Power::new::<watt>(self.raw_pd_power().into())
    }
}

/// An ordered set of PDOs, as received or advertised.
///
/// Sized for EPR sets; SPR messages fill at most the first seven slots.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities(pub Vec<PowerDataObject, MAX_EPR_PDOS>);

impl Capabilities {
    /// Parse a capabilities payload from raw wire words.
    pub fn from_objects(objects: &[u32]) -> Self {
        Self(objects.iter().take(MAX_EPR_PDOS).map(|raw| parse_raw_pdo(*raw)).collect())
    }

    /// Serialize into raw wire words.
    pub fn to_objects(&self) -> Vec<u32, MAX_EPR_PDOS> {
        self.0.iter().map(|pdo| pdo.raw()).collect()
    }

    /// Whether an EPR PDO sits in an SPR position (1..=7), which is a
    /// protocol violation the sink answers with a Hard Reset.
    pub fn has_epr_pdo_in_spr_positions(&self) -> bool {
        self.0.iter().take(MAX_PDOS).any(|pdo| match pdo {
            // EPR fixed supplies are the ones above 20 V.
            PowerDataObject::FixedSupply(supply) => supply.raw_voltage() > 400,
            PowerDataObject::Augmented(Augmented::Epr(_)) => true,
            _ => false,
        })
    }

    /// The vSafe5V fixed supply, which every valid set starts with.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        self.0.first().and_then(|supply| {
            if let PowerDataObject::FixedSupply(supply) = supply {
                Some(supply)
            } else {
                None
            }
        })
    }

    /// Whether the partner advertises dual-role power.
    pub fn dual_role_power(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_power).unwrap_or_default()
    }

    /// Whether the partner advertises unconstrained power.
    pub fn unconstrained_power(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::unconstrained_power)
            .unwrap_or_default()
    }

    /// Whether the partner advertises dual-role data.
    pub fn dual_role_data(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_data).unwrap_or_default()
    }

    /// Whether the partner is EPR mode capable.
    pub fn epr_mode_capable(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::epr_mode_capable).unwrap_or_default()
    }

    /// The PDO at a 1-indexed object position.
    pub fn at_position(&self, position: u8) -> Option<&PowerDataObject> {
        self.0.get((position as usize).checked_sub(1)?)
    }

    /// The kind of PDO at a 1-indexed object position.
    pub fn kind_at_position(&self, position: u8) -> Option<Kind> {
        self.at_position(position).and_then(|pdo| pdo.kind())
    }

    /// All PDOs, in object-position order.
    pub fn pdos(&self) -> &[PowerDataObject] {
        &self.0
    }

    /// The greatest power any single PDO offers.
    pub fn max_power(&self) -> Power {
        self.0
            .iter()
            .map(|pdo| pdo.max_power())
            .max()
            .unwrap_or(Power::new::<watt>(0))
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::millivolt;
    use uom::si::power::watt;

    use super::{Capabilities, FixedSupply, FrsCurrent, PowerDataObject};

    #[test]
    fn parses_fixed_5v3a() {
        // 5 V (100 * 50 mV) at 3 A (300 * 10 mA), unconstrained.
        let raw = FixedSupply::default()
            .with_raw_voltage(100)
            .with_raw_max_current(300)
            .with_unconstrained_power(true)
            .0;

        let caps = Capabilities::from_objects(&[raw]);
        let vsafe5v = caps.vsafe_5v().unwrap();

        assert_eq!(vsafe5v.voltage().get::<millivolt>(), 5000);
        assert_eq!(vsafe5v.max_current().get::<milliampere>(), 3000);
        assert!(caps.unconstrained_power());
    }

    #[test]
    fn max_power_reflects_best_pdo() {
        let caps = Capabilities::from_objects(&[
            FixedSupply::default().with_raw_voltage(100).with_raw_max_current(300).0,
            FixedSupply::default().with_raw_voltage(400).with_raw_max_current(225).0,
        ]);

        assert_eq!(caps.max_power().get::<watt>(), 45);
    }

    #[test]
    fn sink_frs_current_field() {
        let pdo = FixedSupply::default().with_fast_role_swap_current(0b10);
        assert_eq!(FrsCurrent::from(pdo.fast_role_swap_current()), FrsCurrent::Current1A5);

        if let PowerDataObject::FixedSupply(parsed) = super::parse_raw_pdo(pdo.0) {
            assert_eq!(FrsCurrent::from(parsed.fast_role_swap_current()), FrsCurrent::Current1A5);
        } else {
            panic!("expected fixed supply");
        }
    }
}
