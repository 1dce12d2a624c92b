//! Thunderbolt-compat alternate mode (Intel SVID 0x8087).
//!
//! Active cables enter the mode on the cable plugs before the partner;
//! USB4 entry borrows the cable half of this sequence for older active
//! cables.
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, MuxMode, ProtocolLayer, Sop};

use super::VdmSetup;
use crate::engine::Ctx;
use crate::message::vdm::{INTEL_VID, ProductTypeCable, SvdmVersion, TbtModeVdo, VdmCommand, VdmHeader};
use crate::port::PeFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum TbtState {
    Inactive,
    EnterCableRequested,
    CableSopPrimeDone,
    EnterCablePrimePrimeRequested,
    CableEntered,
    EnterSopRequested,
    Active,
    ExitSopRequested,
    ExitCableRequested,
}

/// The Thunderbolt-compat mode driver for one port.
#[derive(Debug)]
pub struct ThunderboltMode {
    state: TbtState,
    entry_done: bool,
    /// Entry stops after the cable plugs (USB4 pre-entry).
    cable_only: bool,
}

impl ThunderboltMode {
    /// Create the driver, inactive.
    pub fn new() -> Self {
        Self {
            state: TbtState::Inactive,
            entry_done: false,
            cable_only: false,
        }
    }

    /// Reset on detach or mode exit completion.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether the mode is up (cable-only entry counts once done).
    pub fn is_active(&self) -> bool {
        matches!(self.state, TbtState::Active | TbtState::CableEntered)
    }

    /// Whether entry has finished (either way).
    pub fn entry_is_done(&self) -> bool {
        self.entry_done || matches!(self.state, TbtState::Active)
    }

    /// Restrict entry to the cable plugs, for USB4 pre-entry.
    pub fn set_cable_only(&mut self) {
        self.cable_only = true;
    }

    /// Ask the module to tear the mode down.
    pub fn exit_mode_request(&mut self) {
        if self.is_active() {
            self.state = if self.state == TbtState::CableEntered {
                TbtState::ExitCableRequested
            } else {
                TbtState::ExitSopRequested
            };
            self.entry_done = false;
        }
    }

    /// Whether the partner advertises the Intel SVID with TBT mode.
    pub fn partner_supports<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
        ctx.port.discovery[Sop::Sop.index()]
            .modes_for(INTEL_VID)
            .and_then(|entry| entry.modes.first().copied())
            .map(|raw| TbtModeVdo(raw).tbt_mode())
            .unwrap_or(false)
    }

    /// The cable's TBT discover-mode response, if any.
    pub fn cable_mode_vdo<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> Option<TbtModeVdo> {
        ctx.port.discovery[Sop::SopPrime.index()]
            .modes_for(INTEL_VID)
            .and_then(|entry| entry.modes.first().copied())
            .map(TbtModeVdo)
    }

    /// Whether the cable plugs must enter the mode first.
    pub fn cable_entry_required<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
        let identity = &ctx.port.discovery[Sop::SopPrime.index()].identity;
        identity
            .first()
            .map(|raw| crate::message::vdm::IdHeader(*raw).product_type_cable() == ProductTypeCable::Active)
            .unwrap_or(false)
    }

    fn enter_mode_vdm(version: SvdmVersion) -> Vec<u32, 7> {
        let header = VdmHeader::new_request(INTEL_VID, version, VdmCommand::EnterMode).with_object_position(1);
        Vec::from_slice(&[header.0]).unwrap()
    }

    fn exit_mode_vdm(version: SvdmVersion) -> Vec<u32, 7> {
        let header = VdmHeader::new_request(INTEL_VID, version, VdmCommand::ExitMode).with_object_position(1);
        Vec::from_slice(&[header.0]).unwrap()
    }

    /// Whether the near cable plug reported a SOP'' controller.
    fn cable_has_sop_pp<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
        ctx.port.discovery[Sop::SopPrime.index()]
            .identity
            .get(3)
            .map(|raw| crate::message::vdm::ActiveCableVdo1(*raw).sop_pp_controller())
            .unwrap_or(false)
    }

    /// Produce the next VDM in the entry or exit sequence.
    pub fn setup_next_vdm<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> VdmSetup {
        let version = if ctx.rev(Sop::Sop) == usbpd_drp_traits::PdRev::R2_0 {
            SvdmVersion::V10
        } else {
            SvdmVersion::V20
        };

        match self.state {
            TbtState::Inactive => {
                if !self.cable_only && !Self::partner_supports(ctx) {
                    return VdmSetup::Unsupported;
                }

                if Self::cable_entry_required(ctx) {
                    self.state = TbtState::EnterCableRequested;
                    return VdmSetup::Ready(Sop::SopPrime, Self::enter_mode_vdm(version));
                }

                if self.cable_only {
                    // Nothing to do for passive cables.
                    self.state = TbtState::CableEntered;
                    return VdmSetup::Unsupported;
                }

                self.state = TbtState::EnterSopRequested;
                VdmSetup::Ready(Sop::Sop, Self::enter_mode_vdm(version))
            }
            TbtState::CableSopPrimeDone => {
                self.state = TbtState::EnterCablePrimePrimeRequested;
                VdmSetup::Ready(Sop::SopPrimePrime, Self::enter_mode_vdm(version))
            }
            TbtState::CableEntered if !self.cable_only => {
                if !ctx.board.mux_set_completed(ctx.port.id) {
                    return VdmSetup::MuxWait;
                }
                self.state = TbtState::EnterSopRequested;
                VdmSetup::Ready(Sop::Sop, Self::enter_mode_vdm(version))
            }
            TbtState::ExitSopRequested => VdmSetup::Ready(Sop::Sop, Self::exit_mode_vdm(version)),
            TbtState::ExitCableRequested => VdmSetup::Ready(Sop::SopPrime, Self::exit_mode_vdm(version)),
            _ => VdmSetup::Unsupported,
        }
    }

    /// The partner (or cable plug) acknowledged our last request.
    pub fn vdm_acked<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>, sop: Sop, objects: &[u32]) {
        let command = VdmHeader(objects.first().copied().unwrap_or(0)).command();

        match (self.state, command) {
            (TbtState::EnterCableRequested, Some(VdmCommand::EnterMode)) => {
                // The far plug mirrors the near one, if present.
                self.state = if Self::cable_has_sop_pp(ctx) {
                    TbtState::CableSopPrimeDone
                } else {
                    TbtState::CableEntered
                };
            }
            (TbtState::EnterCablePrimePrimeRequested, Some(VdmCommand::EnterMode)) => {
                self.state = TbtState::CableEntered;
            }
            (TbtState::EnterSopRequested, Some(VdmCommand::EnterMode)) => {
                ctx.port.set_flag(PeFlag::MODAL_OPERATION);
                let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
                ctx.board.mux_set(ctx.port.id, MuxMode::Thunderbolt, flipped);
                info!("C{}: Thunderbolt mode active", ctx.id());
                self.state = TbtState::Active;
            }
            (TbtState::ExitSopRequested, Some(VdmCommand::ExitMode)) => {
                if Self::cable_entry_required(ctx) {
                    self.state = TbtState::ExitCableRequested;
                } else {
                    let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
                    ctx.board.mux_set(ctx.port.id, MuxMode::Usb, flipped);
                    self.reset();
                }
            }
            (TbtState::ExitCableRequested, Some(VdmCommand::ExitMode)) => {
                let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
                ctx.board.mux_set(ctx.port.id, MuxMode::Usb, flipped);
                self.reset();
            }
            _ => {
                warn!("C{}: unexpected TBT ACK on {:?} in {:?}", ctx.id(), sop, self.state);
            }
        }
    }

    /// The partner refused our last request.
    pub fn vdm_naked<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>, _command: Option<VdmCommand>) {
        debug!("C{}: TBT request NAKed in {:?}", ctx.id(), self.state);
        if matches!(self.state, TbtState::ExitSopRequested | TbtState::ExitCableRequested) {
            self.reset();
        } else {
            self.state = TbtState::Inactive;
        }
        self.entry_done = true;
    }

}

impl Default for ThunderboltMode {
    fn default() -> Self {
        Self::new()
    }
}
