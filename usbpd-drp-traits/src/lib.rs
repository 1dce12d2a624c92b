//! Contracts between the USB-PD DRP engine and its collaborators.
//!
//! The engine treats three things as black boxes: the protocol layer
//! (chunking, retries, GoodCRC, message IDs), the board electricals
//! (CC pulls, vBus, VCONN, the SuperSpeed mux, the charger) and the
//! application processor (chipset power states, host events). Each gets
//! a trait here, so that ports to new hardware only touch this crate.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use core::future::Future;

/// PD packet classes, distinguished by their start-of-packet ordered sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sop {
    /// To the port partner.
    Sop,
    /// To the cable plug near this port.
    SopPrime,
    /// To the cable plug at the far end.
    SopPrimePrime,
    /// Debug accessory, near plug.
    SopDebugPrime,
    /// Debug accessory, far plug.
    SopDebugPrimePrime,
}

impl Sop {
    /// Index into per-SOP storage (revision, discovery records).
    pub const COUNT: usize = 5;

    /// Stable index for array storage.
    pub fn index(self) -> usize {
        match self {
            Sop::Sop => 0,
            Sop::SopPrime => 1,
            Sop::SopPrimePrime => 2,
            Sop::SopDebugPrime => 3,
            Sop::SopDebugPrimePrime => 4,
        }
    }
}

/// Negotiated PD specification revision, tracked per SOP class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(non_camel_case_types)]
pub enum PdRev {
    /// Revision 2.0.
    #[default]
    R2_0,
    /// Revision 3.0.
    R3_0,
    /// Revision 3.1.
    R3_1,
}

/// Errors the protocol layer can report synchronously on a send request.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PrlError {
    /// The protocol layer has not been started for this port.
    #[error("protocol layer not running")]
    NotRunning,
    /// A transmission is already in flight.
    #[error("protocol layer busy")]
    Busy,
    /// The payload does not fit the transmit buffer.
    #[error("payload too large")]
    PayloadTooLarge,
}

/// Asynchronous error classes the protocol layer reports into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PrlErrorKind {
    /// Chunk-receive wait timed out; the protocol layer retries on its own.
    RchChunkWaitTimeout,
    /// A chunked transmission failed mid-sequence.
    TchTransmit,
    /// Inbound was not GoodCRC-able or failed format validation.
    Protocol,
}

/// The protocol layer black box.
///
/// All send operations are non-blocking: they enqueue the message and
/// return. Completion arrives asynchronously through the engine's
/// `message_sent` / `report_error` entry points, discards through
/// `message_discarded`. Message type codes are the raw 5-bit header
/// fields; the engine owns the typed view.
pub trait ProtocolLayer {
    /// Enqueue a control message (header only).
    fn send_ctrl(&mut self, port: usize, sop: Sop, msg_type: u8) -> Result<(), PrlError>;

    /// Enqueue a data message with up to seven data objects.
    fn send_data(&mut self, port: usize, sop: Sop, msg_type: u8, objects: &[u32]) -> Result<(), PrlError>;

    /// Enqueue an extended message; the protocol layer chunks as needed.
    fn send_ext(&mut self, port: usize, sop: Sop, msg_type: u8, data: &[u8]) -> Result<(), PrlError>;

    /// Reset message-ID counters and retry state without touching the wire.
    fn reset_soft(&mut self, port: usize);

    /// Drive Hard Reset ordered sets onto the wire.
    ///
    /// Completion is reported through the engine's `hard_reset_sent`.
    fn execute_hard_reset(&mut self, port: usize);

    /// Inform the protocol layer that Hard Reset processing has finished.
    fn hard_reset_complete(&mut self, port: usize);

    /// The negotiated revision for a SOP class.
    fn get_rev(&self, port: usize, sop: Sop) -> PdRev;

    /// Update the negotiated revision for a SOP class.
    fn set_rev(&mut self, port: usize, sop: Sop, rev: PdRev);

    /// Whether the layer is started and exchanging messages.
    fn is_running(&self, port: usize) -> bool;

    /// Whether a transmission is currently in flight.
    fn is_busy(&self, port: usize) -> bool;

    /// Update the roles stamped into outgoing headers.
    fn set_roles(&mut self, port: usize, power_role_source: bool, data_role_dfp: bool) {
        let _ = (port, power_role_source, data_role_dfp);
    }

    /// Enable or disable the inbound header role check.
    ///
    /// Disabled around role swaps, to tolerate a partner that flips its
    /// headers faster than we commit ours.
    fn set_rx_role_check(&mut self, port: usize, enabled: bool) {
        let _ = (port, enabled);
    }

    /// Start the layer after attach, at the given initial revision.
    fn start(&mut self, port: usize, rev: PdRev);

    /// Stop the layer on detach or suspend.
    fn stop(&mut self, port: usize);
}

/// CC terminations a port can present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPull {
    /// No termination (ErrorRecovery, Disabled).
    Open,
    /// Sink termination.
    Rd,
    /// Source termination at the currently selected current limit.
    Rp,
}

/// Advertised Rp current limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpValue {
    /// Default USB power (500/900 mA).
    UsbDefault,
    /// 1.5 A.
    Rp1A5,
    /// 3.0 A.
    Rp3A0,
}

/// Voltage class seen on a single CC line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcLevel {
    /// Nothing attached on this line.
    Open,
    /// Powered-cable / accessory termination.
    Ra,
    /// Sink termination.
    Rd,
    /// Source presenting default Rp.
    RpUsb,
    /// Source presenting 1.5 A Rp.
    Rp1A5,
    /// Source presenting 3.0 A Rp.
    Rp3A0,
}

impl CcLevel {
    /// Whether the line shows any source termination.
    pub fn is_rp(self) -> bool {
        matches!(self, CcLevel::RpUsb | CcLevel::Rp1A5 | CcLevel::Rp3A0)
    }

    /// Whether the line shows a sink termination.
    pub fn is_rd(self) -> bool {
        matches!(self, CcLevel::Rd)
    }
}

/// vBus thresholds the engine queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VbusLevel {
    /// Below vSafe0V.
    Safe0V,
    /// At a valid supply voltage.
    Present,
    /// Below the sink-disconnect threshold.
    Removed,
}

/// SuperSpeed mux configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MuxMode {
    /// Disconnected.
    None,
    /// USB2/USB3 pass-through.
    Usb,
    /// Safe state during mode transitions.
    Safe,
    /// DisplayPort alternate mode (with or without USB3).
    DisplayPort,
    /// Thunderbolt-compat alternate mode.
    Thunderbolt,
    /// USB4.
    Usb4,
}

/// Board-level electrical control, per port.
///
/// Fallible operations mirror the original firmware contracts: turning on
/// a supply can fail with OCP latched off, and the caller unwinds.
pub trait Board {
    /// Apply a CC termination. The Rp value is only meaningful for `Rp`.
    fn set_cc(&mut self, port: usize, pull: CcPull, rp: RpValue);

    /// Sample both CC lines, in connector order (CC1, CC2).
    fn sample_cc(&mut self, port: usize) -> (CcLevel, CcLevel);

    /// Latch the connector orientation; `flipped` means CC2 is active.
    fn set_polarity(&mut self, port: usize, flipped: bool);

    /// Query a vBus threshold.
    fn vbus_at_level(&mut self, port: usize, level: VbusLevel) -> bool;

    /// Enable the source supply at vSafe5V.
    fn power_supply_ready(&mut self, port: usize) -> Result<(), PowerSupplyError>;

    /// Disable the source supply and discharge.
    fn power_supply_reset(&mut self, port: usize);

    /// Move the source supply to the voltage of the given PDO index.
    fn transition_voltage(&mut self, port: usize, pdo_index: usize);

    /// Source or drop VCONN.
    fn set_vconn(&mut self, port: usize, enabled: bool) -> Result<(), PowerSupplyError>;

    /// Configure the SuperSpeed mux.
    fn mux_set(&mut self, port: usize, mode: MuxMode, polarity_flipped: bool);

    /// Whether the last mux change has settled.
    fn mux_set_completed(&mut self, port: usize) -> bool;

    /// Enable the TCPC auto-discharge-on-disconnect feature.
    fn auto_discharge_disconnect(&mut self, port: usize, enabled: bool);

    /// Arm or disarm fast-role-swap detection in the PHY.
    fn frs_detection_enable(&mut self, port: usize, enabled: bool);

    /// Report the negotiated input ceiling to the platform charger.
    fn set_input_current_limit(&mut self, port: usize, ma: u32, mv: u32);

    /// Hand CC-pull alternation to the TCPC hardware, or take it back.
    fn drp_auto_toggle(&mut self, port: usize, enabled: bool) {
        let _ = (port, enabled);
    }

    /// Drop the TCPC into its low-power state.
    ///
    /// Any wake condition must surface through the next `sample_cc`.
    fn enter_low_power_mode(&mut self, port: usize) {
        let _ = port;
    }

    /// Board policy: whether this port may enter TBT/USB4 modes.
    fn is_tbt_usb4_port(&self, port: usize) -> bool {
        true
    }

    /// Whether the port connector is Debug-Test-System capable.
    fn is_dts_capable(&self, port: usize) -> bool {
        false
    }
}

/// Source supply failure, e.g. an over-current latch.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("power supply fault")]
pub struct PowerSupplyError;

/// Coarse chipset power states the DPM dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChipsetState {
    /// S0, running.
    On,
    /// S0ix/S3.
    Suspend,
    /// S4/S5.
    SoftOff,
    /// G3.
    HardOff,
}

impl ChipsetState {
    /// Any of the off states.
    pub fn is_off(self) -> bool {
        matches!(self, ChipsetState::SoftOff | ChipsetState::HardOff)
    }
}

/// Host-visible port status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusEvent {
    /// A Hard Reset was sent or received.
    HardReset,
    /// The port partner detached.
    Disconnected,
    /// Discovery on SOP finished (pass or fail).
    SopDiscDone,
    /// Discovery on SOP' finished (pass or fail).
    SopPrimeDiscDone,
}

/// Application-processor collaborator: power states, buttons, host events.
pub trait Chipset {
    /// Current chipset power state (or the state being transitioned to).
    fn state(&self) -> ChipsetState;

    /// Power the chipset on from an off state.
    fn power_on(&mut self);

    /// Simulate a short power-button press (wake / power UI).
    fn simulate_power_button_press(&mut self);

    /// Force an orderly shutdown.
    fn force_shutdown(&mut self);

    /// Post a status event toward the host.
    fn notify_event(&mut self, port: usize, event: StatusEvent);
}

/// Async timer for the port task loop.
pub trait Timer {
    /// Expire after the specified number of microseconds.
    fn after_micros(microseconds: u64) -> impl Future<Output = ()>;

    /// Expire after the specified number of milliseconds.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()> {
        Self::after_micros(milliseconds * 1000)
    }
}

/// Monotonic time source for the deadline service.
pub trait Clock {
    /// Microseconds since an arbitrary, never-decreasing epoch.
    fn now_us(&self) -> u64;
}
