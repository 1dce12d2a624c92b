//! DisplayPort alternate mode (VESA SVID 0xFF01).
//!
//! Entry sequence: Enter Mode, then DP Status Update, then DP Configure.
//! The mux passes through safe state between USB and DP pin assignments.
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, MuxMode, ProtocolLayer, Sop};

use super::{VdmSetup, mode_position};
use crate::engine::Ctx;
use crate::message::vdm::{
    DP_SID, DisplayPortConfigVdo, DisplayPortModeVdo, DisplayPortStatusVdo, SvdmVersion, VdmCommand, VdmHeader,
};
use crate::port::PeFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum DpState {
    Inactive,
    EnterRequested,
    Entered,
    StatusRequested,
    StatusDone,
    ConfigRequested,
    Active,
    ExitRequested,
}

/// The DisplayPort mode driver for one port.
#[derive(Debug)]
pub struct DisplayPortMode {
    state: DpState,
    /// Set once entry has concluded, successfully or not.
    entry_done: bool,
    /// Last DP status reported by the partner.
    partner_status: DisplayPortStatusVdo,
}

impl DisplayPortMode {
    /// Create the driver, inactive.
    pub fn new() -> Self {
        Self {
            state: DpState::Inactive,
            entry_done: false,
            partner_status: DisplayPortStatusVdo(0),
        }
    }

    /// Reset on detach or mode exit completion.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether the mode is up.
    pub fn is_active(&self) -> bool {
        matches!(self.state, DpState::Active)
    }

    /// Whether entry has finished (either way).
    pub fn entry_is_done(&self) -> bool {
        self.entry_done || self.is_active()
    }

    /// Ask the module to tear the mode down.
    pub fn exit_mode_request(&mut self) {
        if self.is_active() {
            self.state = DpState::ExitRequested;
            self.entry_done = false;
        }
    }

    /// Whether the partner advertises DisplayPort at all.
    pub fn partner_supports<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
        let discovery = &ctx.port.discovery[Sop::Sop.index()];
        discovery.svids.contains(&DP_SID) && discovery.modes_for(DP_SID).is_some()
    }

    /// Produce the next VDM in the entry or exit sequence.
    pub fn setup_next_vdm<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> VdmSetup {
        let version = if ctx.rev(Sop::Sop) == usbpd_drp_traits::PdRev::R2_0 {
            SvdmVersion::V10
        } else {
            SvdmVersion::V20
        };

        match self.state {
            DpState::Inactive => {
                if !Self::partner_supports(ctx) {
                    return VdmSetup::Unsupported;
                }
                let Some(position) = mode_position(&ctx.port.discovery[Sop::Sop.index()], DP_SID) else {
                    return VdmSetup::Unsupported;
                };

                let header = VdmHeader::new_request(DP_SID, version, VdmCommand::EnterMode)
                    .with_object_position(position);
                self.state = DpState::EnterRequested;
                VdmSetup::Ready(Sop::Sop, Vec::from_slice(&[header.0]).unwrap())
            }
            DpState::Entered => {
                let header = VdmHeader::new_request(DP_SID, version, VdmCommand::DisplayPortStatus)
                    .with_object_position(1);
                let status = DisplayPortStatusVdo(0).with_connected(0b01);
                self.state = DpState::StatusRequested;
                VdmSetup::Ready(Sop::Sop, Vec::from_slice(&[header.0, status.0]).unwrap())
            }
            DpState::StatusDone => {
                // The mux must sit in safe state before pins move to DP.
                if !ctx.board.mux_set_completed(ctx.port.id) {
                    return VdmSetup::MuxWait;
                }

                let Some(pin) = self.select_pin_assignment(ctx) else {
                    self.entry_done = true;
                    self.state = DpState::Inactive;
                    return VdmSetup::Error;
                };

                let header = VdmHeader::new_request(DP_SID, version, VdmCommand::DisplayPortConfig)
                    .with_object_position(1);
                let config = DisplayPortConfigVdo(0)
                    .with_configuration(0b01)
                    .with_signaling(0b0001)
                    .with_pin_assignment(pin);
                self.state = DpState::ConfigRequested;
                VdmSetup::Ready(Sop::Sop, Vec::from_slice(&[header.0, config.0]).unwrap())
            }
            DpState::ExitRequested => {
                let header =
                    VdmHeader::new_request(DP_SID, version, VdmCommand::ExitMode).with_object_position(1);
                VdmSetup::Ready(Sop::Sop, Vec::from_slice(&[header.0]).unwrap())
            }
            // A request is already in flight, or the mode is settled.
            _ => VdmSetup::Unsupported,
        }
    }

    /// The partner acknowledged our last request.
    pub fn vdm_acked<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        _sop: Sop,
        objects: &[u32],
    ) {
        let command = VdmHeader(objects.first().copied().unwrap_or(0)).command();

        match (self.state, command) {
            (DpState::EnterRequested, Some(VdmCommand::EnterMode)) => {
                ctx.port.set_flag(PeFlag::MODAL_OPERATION);
                // Move the pins through safe state while we configure.
                let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
                ctx.board.mux_set(ctx.port.id, MuxMode::Safe, flipped);
                self.state = DpState::Entered;
            }
            (DpState::StatusRequested, Some(VdmCommand::DisplayPortStatus)) => {
                self.partner_status = DisplayPortStatusVdo(objects.get(1).copied().unwrap_or(0));
                self.state = DpState::StatusDone;
            }
            (DpState::ConfigRequested, Some(VdmCommand::DisplayPortConfig)) => {
                let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
                ctx.board.mux_set(ctx.port.id, MuxMode::DisplayPort, flipped);
                info!("C{}: DisplayPort mode active", ctx.id());
                self.state = DpState::Active;
            }
            (DpState::ExitRequested, Some(VdmCommand::ExitMode)) => {
                let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
                ctx.board.mux_set(ctx.port.id, MuxMode::Usb, flipped);
                self.reset();
            }
            _ => {
                warn!("C{}: unexpected DP ACK in {:?}", ctx.id(), self.state);
            }
        }
    }

    /// The partner refused our last request.
    pub fn vdm_naked<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>, _command: Option<VdmCommand>) {
        debug!("C{}: DP request NAKed in {:?}", ctx.id(), self.state);
        if self.state == DpState::ExitRequested {
            self.reset();
        } else {
            self.state = DpState::Inactive;
        }
        self.entry_done = true;
    }

    /// An Attention arrived carrying a DP status update.
    pub fn attention<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>, objects: &[u32]) {
        if let Some(raw) = objects.get(1) {
            self.partner_status = DisplayPortStatusVdo(*raw);
            if self.partner_status.exit_dp_mode_request() {
                self.exit_mode_request();
            }
            let _ = ctx;
        }
    }

    /// Pick the pin assignment from the partner's mode VDO; prefer the
    /// four-lane assignments (C before D).
    fn select_pin_assignment<P: ProtocolLayer, B: Board, C: Chipset>(&self, ctx: &Ctx<P, B, C>) -> Option<u8> {
        let discovery = &ctx.port.discovery[Sop::Sop.index()];
        let mode = DisplayPortModeVdo(discovery.modes_for(DP_SID)?.modes.first().copied()?);

        if !mode.ufp_d_capable() {
            return None;
        }

        let assignments = mode.ufp_d_pin_assignments();
        // Bit 2: assignment C, bit 3: assignment D.
        if assignments & 0b0100 != 0 {
            Some(0b0100)
        } else if assignments & 0b1000 != 0 {
            Some(0b1000)
        } else {
            None
        }
    }
}

impl Default for DisplayPortMode {
    fn default() -> Self {
        Self::new()
    }
}
