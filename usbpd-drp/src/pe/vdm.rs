//! Structured VDM exchanges: the shared request super-state, the
//! Discover Identity / SVIDs / Modes ladder, and the inbound responder.
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, PdRev, ProtocolLayer, Sop};

use super::{MsgCheck, PeState, PolicyEngine};
use crate::engine::Ctx;
use crate::message::header::DataMessageType;
use crate::message::vdm::{
    self, SvdmVersion, VdmCommand, VdmCommandType, VdmHeader, parse_svids,
};
use crate::message::RxMessage;
use crate::port::{DiscState, DpmRequest, EventBits, PeFlag};
use crate::timer::TimerId;
use crate::times;
use crate::DataRole;

/// Discover Identity attempts allowed before an explicit contract.
pub(crate) const DISCOVER_IDENTITY_PRECONTRACT_LIMIT: u8 = 2;
/// Unanswered SOP' attempts before downgrading the cable to PD r2.0.
pub(crate) const DISCOVER_IDENTITY_PD3_0_LIMIT: u8 = 4;

/// What a prepared exchange is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum VdmExchangeKind {
    /// Discover Identity.
    DiscoverIdentity,
    /// Discover SVIDs.
    DiscoverSvids,
    /// Discover Modes for one SVID.
    DiscoverModes(u16),
    /// A DPM-prepared exchange (mode entry/exit, DP control, Attention).
    DpmRequest,
}

/// A prepared outbound structured VDM.
#[derive(Debug, Clone)]
pub(crate) struct VdmExchange {
    /// Destination packet class.
    pub sop: Sop,
    /// Header plus VDOs.
    pub data: Vec<u32, 7>,
    /// Purpose, for response routing.
    pub kind: VdmExchangeKind,
    /// Minimum response objects for an ACK to count.
    pub ack_min_objects: usize,
    /// Whether a response is expected at all (Attention has none).
    pub response_expected: bool,
}

/// Classification of a VDM response, handed to the DPM.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum VdmResult {
    /// Response accepted; carries header plus VDOs.
    Ack(Sop, Vec<u32, 7>),
    /// Refused, not supported, or timed out; carries SVID and command.
    Nak(Sop, u16, Option<VdmCommand>),
}

impl PolicyEngine {
    /// The structured VDM version to use on a SOP class.
    fn svdm_version<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>, sop: Sop) -> SvdmVersion {
        if ctx.rev(sop) == PdRev::R2_0 {
            SvdmVersion::V10
        } else {
            SvdmVersion::V20
        }
    }

    /// Prepare a Discover Identity exchange.
    pub(crate) fn prepare_discover_identity<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
    ) {
        let header = VdmHeader::new_request(vdm::PD_SID, Self::svdm_version(ctx, sop), VdmCommand::DiscoverIdentity);
        self.vdm = Some(VdmExchange {
            sop,
            data: Vec::from_slice(&[header.0]).unwrap(),
            kind: VdmExchangeKind::DiscoverIdentity,
            // ID header, cert stat, product, at least one type VDO.
            ack_min_objects: 4,
            response_expected: true,
        });
    }

    /// Prepare a Discover SVIDs exchange.
    pub(crate) fn prepare_discover_svids<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
    ) {
        let header = VdmHeader::new_request(vdm::PD_SID, Self::svdm_version(ctx, sop), VdmCommand::DiscoverSvids);
        self.vdm = Some(VdmExchange {
            sop,
            data: Vec::from_slice(&[header.0]).unwrap(),
            kind: VdmExchangeKind::DiscoverSvids,
            ack_min_objects: 1,
            response_expected: true,
        });
    }

    /// Prepare a Discover Modes exchange for one SVID.
    pub(crate) fn prepare_discover_modes<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
        svid: u16,
    ) {
        let header = VdmHeader::new_request(svid, Self::svdm_version(ctx, sop), VdmCommand::DiscoverModes);
        self.vdm = Some(VdmExchange {
            sop,
            data: Vec::from_slice(&[header.0]).unwrap(),
            kind: VdmExchangeKind::DiscoverModes(svid),
            ack_min_objects: 1,
            response_expected: true,
        });
    }

    /// Install a DPM-built exchange (mode entry/exit, Attention, ...).
    pub(crate) fn prepare_dpm_vdm(&mut self, sop: Sop, data: &[u32], response_expected: bool) -> bool {
        let Ok(data) = Vec::from_slice(data) else {
            return false;
        };
        if data.is_empty() {
            return false;
        }

        self.vdm = Some(VdmExchange {
            sop,
            data,
            kind: VdmExchangeKind::DpmRequest,
            ack_min_objects: 0,
            response_expected,
        });
        true
    }

    /// The DPM consumes exchange outcomes from here.
    pub(crate) fn take_vdm_result(&mut self) -> Option<VdmResult> {
        self.vdm_result.take()
    }

    // --- The VDM_SEND_REQUEST super-state ----------------------------

    /// Where a finished exchange returns to: a source still before its
    /// first contract resumes offering capabilities.
    fn vdm_return_state<P: ProtocolLayer, B: Board, C: Chipset>(&self, ctx: &Ctx<P, B, C>) -> PeState {
        if ctx.port.power_role == crate::PowerRole::Source && !ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
            return PeState::SrcSendCapabilities;
        }
        PeState::ready(ctx.port.power_role)
    }


    pub(super) fn enter_vdm_request<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let Some(exchange) = self.vdm.clone() else {
            return Some(self.vdm_return_state(ctx));
        };

        self.arm_sender_response(ctx);
        self.vdm_timeout_extended = false;
        let data = exchange.data.clone();
        self.send_data(ctx, exchange.sop, DataMessageType::VendorDefined, &data);
        None
    }

    pub(super) fn run_vdm_request<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let Some(exchange) = self.vdm.clone() else {
            return Some(self.vdm_return_state(ctx));
        };

        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted => {
                // Structured VDMs run their own response budget.
                ctx.timers.disable(TimerId::PeSenderResponse);
                if !exchange.response_expected {
                    self.vdm = None;
                    return Some(self.vdm_return_state(ctx));
                }
                ctx.timers
                    .enable(TimerId::PeVdmResponse, ctx.now, times::T_VDM_SENDER_RESPONSE_US);
                return None;
            }
            MsgCheck::Sent => (),
            MsgCheck::Discarded => {
                self.vdm = None;
                return Some(self.vdm_return_state(ctx));
            }
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::VDM);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            return self.handle_vdm_reply(exchange, message, ctx);
        }

        if ctx.timers.is_expired(TimerId::PeVdmResponse, ctx.now) {
            ctx.timers.disable(TimerId::PeVdmResponse);

            // Some partners respond late; extend the budget to three
            // times its nominal value once before giving up.
            if !self.vdm_timeout_extended {
                self.vdm_timeout_extended = true;
                ctx.timers
                    .enable(TimerId::PeVdmResponse, ctx.now, 2 * times::T_VDM_SENDER_RESPONSE_US);
                return None;
            }

            ctx.port.set_flag(PeFlag::VDM_REQUEST_TIMEOUT);
            return Some(self.vdm_request_failed(exchange, ctx));
        }

        None
    }

    fn handle_vdm_reply<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        exchange: VdmExchange,
        message: RxMessage,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        use crate::message::header::{ControlMessageType, MessageType};

        // Not_Supported on the requested SOP counts as a NAK.
        if message.message_type() == MessageType::Control(ControlMessageType::NotSupported) {
            return Some(self.vdm_request_failed(exchange, ctx));
        }

        if !message.is_data(DataMessageType::VendorDefined) {
            // An unrelated inbound interrupts the exchange.
            ctx.port.rx = Some(message);
            ctx.port.set_flag(PeFlag::MSG_RECEIVED);
            self.vdm = None;
            return Some(PeState::ready(ctx.port.power_role));
        }

        let header = VdmHeader(message.object(0).unwrap_or(0));
        ctx.timers.disable(TimerId::PeVdmResponse);

        match header.command_type() {
            VdmCommandType::ResponderAck => {
                if message.objects.len() < exchange.ack_min_objects {
                    return Some(self.vdm_request_failed(exchange, ctx));
                }
                Some(self.vdm_request_acked(exchange, &message.objects, ctx))
            }
            VdmCommandType::ResponderNak => Some(self.vdm_request_failed(exchange, ctx)),
            VdmCommandType::ResponderBusy => {
                // Retry later; discovery picks this up off its timer.
                ctx.timers
                    .enable(TimerId::PeDiscoverIdentity, ctx.now, times::T_VDM_BUSY_US);
                self.vdm = None;
                Some(self.vdm_return_state(ctx))
            }
            VdmCommandType::InitiatorReq => {
                // Crossed with a partner-initiated VDM; let Ready see it.
                ctx.port.rx = Some(message);
                ctx.port.set_flag(PeFlag::MSG_RECEIVED);
                self.vdm = None;
                Some(PeState::ready(ctx.port.power_role))
            }
        }
    }

    fn vdm_request_acked<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        exchange: VdmExchange,
        objects: &[u32],
        ctx: &mut Ctx<P, B, C>,
    ) -> PeState {
        let sop_index = exchange.sop.index();

        match exchange.kind {
            VdmExchangeKind::DiscoverIdentity => {
                let discovery = &mut ctx.port.discovery[sop_index];
                discovery.identity = objects.iter().skip(1).copied().collect();
                discovery.identity_state = DiscState::Complete;

                if exchange.sop == Sop::SopPrime {
                    self.discover_identity_counter.reset();
                }
            }
            VdmExchangeKind::DiscoverSvids => {
                let discovery = &mut ctx.port.discovery[sop_index];
                discovery.svids = parse_svids(&objects[1..]);
                discovery.svids_state = DiscState::Complete;
                if discovery.svids.is_empty() {
                    discovery.modes_state = DiscState::Complete;
                    self.note_discovery_done(exchange.sop, ctx);
                }
            }
            VdmExchangeKind::DiscoverModes(svid) => {
                let discovery = &mut ctx.port.discovery[sop_index];
                let _ = discovery.modes.push(crate::port::SvidModes {
                    svid,
                    modes: objects.iter().skip(1).copied().collect(),
                });

                // Modes discovery finishes once every SVID was asked.
                if discovery.modes.len() >= discovery.svids.len() {
                    discovery.modes_state = DiscState::Complete;
                    self.note_discovery_done(exchange.sop, ctx);
                }
            }
            VdmExchangeKind::DpmRequest => {
                self.vdm_result = Some(VdmResult::Ack(exchange.sop, objects.iter().copied().collect()));
            }
        }

        self.vdm = None;
        self.vdm_return_state(ctx)
    }

    fn vdm_request_failed<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        exchange: VdmExchange,
        ctx: &mut Ctx<P, B, C>,
    ) -> PeState {
        let sop_index = exchange.sop.index();
        let request_header = VdmHeader(exchange.data.first().copied().unwrap_or(0));
        let command = request_header.command();

        match exchange.kind {
            VdmExchangeKind::DiscoverIdentity if exchange.sop == Sop::SopPrime => {
                self.cable_identity_attempt_failed(ctx);
            }
            VdmExchangeKind::DiscoverIdentity => {
                ctx.port.discovery[sop_index].identity_state = DiscState::Fail;
                ctx.port.discovery[sop_index].svids_state = DiscState::Fail;
                ctx.port.discovery[sop_index].modes_state = DiscState::Fail;
                self.note_discovery_done(exchange.sop, ctx);
            }
            VdmExchangeKind::DiscoverSvids => {
                ctx.port.discovery[sop_index].svids_state = DiscState::Fail;
                ctx.port.discovery[sop_index].modes_state = DiscState::Fail;
                self.note_discovery_done(exchange.sop, ctx);
            }
            VdmExchangeKind::DiscoverModes(_) => {
                ctx.port.discovery[sop_index].modes_state = DiscState::Fail;
                self.note_discovery_done(exchange.sop, ctx);
            }
            VdmExchangeKind::DpmRequest => {
                self.vdm_result = Some(VdmResult::Nak(exchange.sop, request_header.standard_or_vid(), command));
            }
        }

        self.vdm = None;
        self.vdm_return_state(ctx)
    }

    /// One more unanswered Discover Identity on SOP'.
    ///
    /// After four attempts the cable is assumed to predate PD r3.0 and
    /// the SOP' revision is downgraded; after six, discovery fails for
    /// good and the host is notified.
    fn cable_identity_attempt_failed<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let exceeded = self.discover_identity_counter.increment().is_err();
        let attempts = self.discover_identity_counter.value();

        if attempts == DISCOVER_IDENTITY_PD3_0_LIMIT && ctx.rev(Sop::SopPrime) != PdRev::R2_0 {
            debug!("C{}: downgrading cable to PD r2.0", ctx.id());
            ctx.prl.set_rev(ctx.port.id, Sop::SopPrime, PdRev::R2_0);
        }

        if exceeded || attempts >= self.discover_identity_counter.max_value() {
            let discovery = &mut ctx.port.discovery[Sop::SopPrime.index()];
            discovery.identity_state = DiscState::Fail;
            discovery.svids_state = DiscState::Fail;
            discovery.modes_state = DiscState::Fail;
            ctx.notify_event(EventBits::SOP_PRIME_DISC_DONE);
        } else {
            // Space the retries; discovery resumes off this timer.
            let spacing = if ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
                times::T_DISCOVER_IDENTITY_US
            } else {
                times::T_DISCOVER_IDENTITY_NO_CONTRACT_US
            };
            ctx.timers.enable(TimerId::PeDiscoverIdentity, ctx.now, spacing);
        }
    }

    /// Post the host event when a SOP class finishes discovery.
    fn note_discovery_done<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, sop: Sop, ctx: &mut Ctx<P, B, C>) {
        match sop {
            Sop::Sop => ctx.notify_event(EventBits::SOP_DISC_DONE),
            Sop::SopPrime => ctx.notify_event(EventBits::SOP_PRIME_DISC_DONE),
            _ => (),
        }
    }

    // --- Inbound structured VDMs -------------------------------------

    /// Respond to a partner-initiated structured VDM.
    pub(super) fn handle_inbound_vdm<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        message: RxMessage,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let Some(raw_header) = message.object(0) else {
            return Some(PeState::SendNotSupported);
        };
        let header = VdmHeader(raw_header);

        if !header.vdm_type() {
            // Unstructured VDMs are not supported.
            return Some(PeState::SendNotSupported);
        }

        if header.command_type() != VdmCommandType::InitiatorReq {
            // A stray response; drop it.
            return None;
        }

        match header.command() {
            Some(VdmCommand::DiscoverIdentity) => {
                let identity = &ctx.config.identity_vdos;
                if identity.is_empty() || header.standard_or_vid() != vdm::PD_SID {
                    self.send_vdm_reply(ctx, message.sop, header.nak(), &[]);
                } else {
                    let identity = identity.clone();
                    self.send_vdm_reply(ctx, message.sop, header.ack(), &identity);
                }
                None
            }
            Some(VdmCommand::Attention) => {
                // Attention has no response; hand the VDOs to the DPM.
                self.vdm_result = Some(VdmResult::Ack(message.sop, message.objects.iter().copied().collect()));
                None
            }
            Some(
                VdmCommand::DiscoverSvids
                | VdmCommand::DiscoverModes
                | VdmCommand::EnterMode
                | VdmCommand::ExitMode
                | VdmCommand::DisplayPortStatus
                | VdmCommand::DisplayPortConfig,
            ) => {
                // This port exposes no modes of its own.
                self.send_vdm_reply(ctx, message.sop, header.nak(), &[]);
                None
            }
            None => {
                if ctx.port.data_role == DataRole::Ufp && ctx.rev(Sop::Sop) != PdRev::R2_0 {
                    Some(PeState::SendNotSupported)
                } else {
                    None
                }
            }
        }
    }

    fn send_vdm_reply<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
        header: VdmHeader,
        vdos: &[u32],
    ) {
        let mut data: Vec<u32, 7> = Vec::new();
        let _ = data.push(header.0);
        for vdo in vdos.iter().take(6) {
            let _ = data.push(*vdo);
        }
        self.send_data(ctx, sop, DataMessageType::VendorDefined, &data);
    }
}
