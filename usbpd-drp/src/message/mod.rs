//! Wire codecs for every message the engine sends or receives.
//!
//! The protocol layer below handles chunking, retries and GoodCRC; this
//! module only concerns itself with the meaning of headers and data
//! objects.

pub mod alert;
pub mod battery;
pub mod bist;
pub mod enter_usb;
pub mod epr;
pub mod header;
pub mod pdo;
pub mod request;
pub mod status;
pub mod vdm;

use header::{DataMessageType, ExtendedHeader, ExtendedMessageType, Header, MessageType};
use heapless::Vec;
use usbpd_drp_traits::Sop;

/// This module defines the unit system used by the codecs: `u32` values
/// of millivolts, milliamperes and microwatts.
pub mod units {
    ISQ!(
        uom::si,
        u32,
        (millimeter, kilogram, second, milliampere, kelvin, mole, candela)
    );
}

pub(crate) mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "_50mA", "_50milliamps", "_50milliamps";
    }
}

pub(crate) mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "_50mV", "_50millivolts", "_50millivolts";
    }
}

pub(crate) mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "_20mV", "_20millivolts", "_20millivolts";
    }
}

pub(crate) mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "_250mW", "_250milliwatts", "_250milliwatts";
    }
}

/// Longest extended message payload the engine accepts after reassembly.
pub const MAX_EXTENDED_MSG_LEN: usize = 260;

/// A received message, as delivered by the protocol layer.
///
/// Data objects arrive reassembled: the protocol layer has already
/// collected chunks of extended messages into `ext_data`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxMessage {
    /// The packet class this message arrived on.
    pub sop: Sop,
    /// The message header.
    pub header: Header,
    /// Data objects, for data messages.
    pub objects: Vec<u32, 7>,
    /// Extended header and payload, for extended messages.
    pub ext: Option<(ExtendedHeader, Vec<u8, MAX_EXTENDED_MSG_LEN>)>,
}

impl RxMessage {
    /// Parse a message from the wire representation handed up by the
    /// protocol layer.
    pub fn from_bytes(sop: Sop, data: &[u8]) -> Result<Self, ParseError> {
        use byteorder::{ByteOrder, LittleEndian};

        let header = Header::from_bytes(data)?;
        let payload = &data[2..];

        if header.extended() {
            let ext_header = ExtendedHeader::from_bytes(payload)?;
            let size = usize::from(ext_header.data_size()).min(MAX_EXTENDED_MSG_LEN);
            let body = &payload[2..];

            if body.len() < size {
                return Err(ParseError::InvalidLength {
                    expected: size,
                    found: body.len(),
                });
            }

            let mut ext_data = Vec::new();
            // Bounded by the `min` above.
            ext_data.extend_from_slice(&body[..size]).unwrap();

            return Ok(Self {
                sop,
                header,
                objects: Vec::new(),
                ext: Some((ext_header, ext_data)),
            });
        }

        let num_objects = header.num_objects();
        if payload.len() < num_objects * 4 {
            return Err(ParseError::InvalidLength {
                expected: num_objects * 4,
                found: payload.len(),
            });
        }

        let objects = payload
            .chunks_exact(4)
            .take(num_objects)
            .map(LittleEndian::read_u32)
            .collect();

        Ok(Self {
            sop,
            header,
            objects,
            ext: None,
        })
    }

    /// The typed message class.
    pub fn message_type(&self) -> MessageType {
        self.header.message_type()
    }

    /// The first data object, if any.
    pub fn object(&self, index: usize) -> Option<u32> {
        self.objects.get(index).copied()
    }

    /// Whether this is the given data message with at least one object.
    pub fn is_data(&self, kind: DataMessageType) -> bool {
        self.message_type() == MessageType::Data(kind) && !self.objects.is_empty()
    }

    /// Whether this is the given extended message.
    pub fn is_extended(&self, kind: ExtendedMessageType) -> bool {
        self.message_type() == MessageType::Extended(kind) && self.ext.is_some()
    }

    /// The extended payload, for extended messages.
    pub fn ext_payload(&self) -> &[u8] {
        self.ext.as_ref().map(|(_, data)| data.as_slice()).unwrap_or(&[])
    }
}

/// Errors that can occur during message parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid length (expected `{expected}`, found `{found}`)")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field was invalid.
    #[error("invalid specification revision `{0}`")]
    InvalidSpecificationRevision(u8),
    /// A field carried a reserved or out-of-range value.
    #[error("invalid field value")]
    InvalidFieldValue,
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::millivolt;

    use super::units;
    use super::_20millivolts_mod::_20millivolts;

    #[test]
    fn unit_system() {
        let current = units::ElectricCurrent::new::<milliampere>(123);
        let potential = units::ElectricPotential::new::<millivolt>(4560);

        assert_eq!(current.get::<milliampere>(), 123);
        assert_eq!(potential.get::<millivolt>(), 4560);
        assert_eq!(potential.get::<_20millivolts>(), 228);
    }

    mod rx {
        use usbpd_drp_traits::Sop;

        use crate::message::RxMessage;
        use crate::message::header::{ControlMessageType, DataMessageType, MessageType};

        #[test]
        fn parses_control_message() {
            // Accept, message id 2, rev 3.x, from a source/DFP.
            let raw: [u8; 2] = [0xA3, 0x05];
            let message = RxMessage::from_bytes(Sop::Sop, &raw).unwrap();

            assert_eq!(
                message.message_type(),
                MessageType::Control(ControlMessageType::Accept)
            );
            assert_eq!(message.header.message_id(), 2);
        }

        #[test]
        fn parses_data_objects() {
            // Source_Capabilities with one PDO: 5 V at 3 A, unconstrained.
            let raw: [u8; 6] = [0xA1, 0x11, 0x2C, 0x91, 0x01, 0x08];
            let message = RxMessage::from_bytes(Sop::Sop, &raw).unwrap();

            assert_eq!(
                message.message_type(),
                MessageType::Data(DataMessageType::SourceCapabilities)
            );
            assert_eq!(message.objects.len(), 1);
            assert_eq!(message.object(0), Some(0x0801_912C));
        }

        #[test]
        fn rejects_short_payload() {
            // Claims one object, carries none.
            let raw: [u8; 2] = [0xA1, 0x11];
            assert!(RxMessage::from_bytes(Sop::Sop, &raw).is_err());
        }
    }
}
