//! The EPR_Mode data object and the extended-control message codes used
//! by EPR keep-alive.
use proc_bitfield::bitfield;

bitfield! {
    /// The EPR_Mode data object.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct EprModeDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The requested or reported action.
        pub action_raw: u8 @ 24..=31,
        /// Action-specific data (PDP on Enter, failure cause on EnterFailed).
        pub data: u8 @ 16..=23,
    }
}

impl EprModeDataObject {
    /// Build an EPR_Mode object for an action.
    pub fn new(action: Action, data: u8) -> Self {
        Self(0).with_action_raw(action.into()).with_data(data)
    }

    /// The typed action; `None` for reserved codes.
    pub fn action(&self) -> Option<Action> {
        Action::from_raw(self.action_raw())
    }
}

/// EPR_Mode actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Sink requests entry; data carries the operational PDP in watts.
    Enter,
    /// Source acknowledges the entry attempt.
    EnterAcknowledged,
    /// Source reports successful entry.
    EnterSucceeded,
    /// Source reports failed entry; data carries the cause.
    EnterFailed,
    /// Either side exits EPR mode.
    Exit,
}

impl Action {
    /// Parse the action field; `None` for reserved codes.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Action::Enter),
            0x02 => Some(Action::EnterAcknowledged),
            0x03 => Some(Action::EnterSucceeded),
            0x04 => Some(Action::EnterFailed),
            0x05 => Some(Action::Exit),
            _ => None,
        }
    }
}

impl From<Action> for u8 {
    fn from(value: Action) -> Self {
        match value {
            Action::Enter => 0x01,
            Action::EnterAcknowledged => 0x02,
            Action::EnterSucceeded => 0x03,
            Action::EnterFailed => 0x04,
            Action::Exit => 0x05,
        }
    }
}

/// Extended-control message types (body of an ExtendedControl message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExtendedControlType {
    /// Request EPR source capabilities.
    EprGetSourceCap,
    /// Request EPR sink capabilities.
    EprGetSinkCap,
    /// Keep the EPR contract alive.
    EprKeepAlive,
    /// Acknowledge a keep-alive.
    EprKeepAliveAck,
    /// Reserved code.
    Reserved,
}

impl From<u8> for ExtendedControlType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ExtendedControlType::EprGetSourceCap,
            0x02 => ExtendedControlType::EprGetSinkCap,
            0x03 => ExtendedControlType::EprKeepAlive,
            0x04 => ExtendedControlType::EprKeepAliveAck,
            _ => ExtendedControlType::Reserved,
        }
    }
}

impl From<ExtendedControlType> for u8 {
    fn from(value: ExtendedControlType) -> Self {
        match value {
            ExtendedControlType::EprGetSourceCap => 0x01,
            ExtendedControlType::EprGetSinkCap => 0x02,
            ExtendedControlType::EprKeepAlive => 0x03,
            ExtendedControlType::EprKeepAliveAck => 0x04,
            ExtendedControlType::Reserved => 0xFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, EprModeDataObject};

    #[test]
    fn enter_carries_pdp() {
        let enter = EprModeDataObject::new(Action::Enter, 140);
        assert_eq!(enter.action(), Some(Action::Enter));
        assert_eq!(enter.data(), 140);

        let reserved = EprModeDataObject(0x7F00_0000);
        assert_eq!(reserved.action(), None);
    }
}
