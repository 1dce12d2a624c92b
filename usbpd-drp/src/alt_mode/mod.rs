//! Alternate-mode entry modules.
//!
//! Each module owns a small FSM that emits one VDM at a time; the device
//! policy manager runs whichever module applies, forwards the VDM to the
//! policy engine, and routes the ACK/NAK back in.

pub mod dp;
pub mod tbt;
pub mod usb4;

use heapless::Vec;
use usbpd_drp_traits::Sop;

/// What a module wants to send next.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmSetup {
    /// Send this VDM on this SOP.
    Ready(Sop, Vec<u32, 7>),
    /// The USB mux has not confirmed a pending change; retry next cycle.
    MuxWait,
    /// The partner does not support this module's mode.
    Unsupported,
    /// The exchange cannot be built (inconsistent discovery data).
    Error,
}

/// Find the 1-indexed object position of an SVID's first discovered mode.
pub(crate) fn mode_position(discovery: &crate::port::Discovery, svid: u16) -> Option<u8> {
    discovery.modes_for(svid).and_then(|entry| {
        if entry.modes.is_empty() {
            None
        } else {
            Some(1)
        }
    })
}
