//! Source-side policy engine states: startup through Ready, capability
//! negotiation, and the source Hard Reset recovery walk.
use usbpd_drp_traits::{Board, Chipset, ProtocolLayer, Sop, VbusLevel};

use super::{CapResponse, MsgCheck, PeState, PolicyEngine};
use crate::engine::Ctx;
use crate::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::message::{pdo, request};
use crate::port::{DpmRequest, PeFlag};
use crate::timer::{TimerId, TimerRange};
use crate::times;
use crate::DataRole;

impl PolicyEngine {
    pub(super) fn enter_src_startup<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        self.caps_counter.reset();
        ctx.port.set_flag(PeFlag::FIRST_MSG);
        ctx.port.invalidate_contract();

        // A fresh connection sends capabilities immediately; after a
        // swap the new sink gets time to get ready.
        let delay = if ctx.port.check_flag(PeFlag::PR_SWAP_IN_PROGRESS | PeFlag::FAST_ROLE_SWAP_PATH) {
            times::T_SWAP_SOURCE_START_US
        } else {
            0
        };
        ctx.port
            .clear_flag(PeFlag::PR_SWAP_IN_PROGRESS | PeFlag::FAST_ROLE_SWAP_PATH);
        ctx.timers.enable(TimerId::PeSwapSourceStart, ctx.now, delay);

        None
    }

    pub(super) fn run_src_startup<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if !ctx.timers.is_expired(TimerId::PeSwapSourceStart, ctx.now) {
            return None;
        }
        ctx.timers.disable(TimerId::PeSwapSourceStart);

        // Cable identity is probed before the first contract, while we
        // own VCONN and the partner cannot collide.
        if ctx.port.check_flag(PeFlag::VCONN_ON)
            && self.identity_precontract_attempts < super::vdm::DISCOVER_IDENTITY_PRECONTRACT_LIMIT
        {
            return Some(PeState::SrcDiscovery);
        }

        Some(PeState::SrcSendCapabilities)
    }

    pub(super) fn run_src_discovery<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // Wait out the retry spacing, then run one Discover Identity
        // exchange on SOP'.
        if !ctx.timers.is_disabled(TimerId::PeDiscoverIdentity)
            && !ctx.timers.is_expired(TimerId::PeDiscoverIdentity, ctx.now)
        {
            return None;
        }
        ctx.timers.disable(TimerId::PeDiscoverIdentity);

        if self.identity_precontract_attempts >= super::vdm::DISCOVER_IDENTITY_PRECONTRACT_LIMIT {
            return Some(PeState::SrcSendCapabilities);
        }

        self.identity_precontract_attempts += 1;
        self.prepare_discover_identity(ctx, Sop::SopPrime);
        Some(PeState::VdmRequest)
    }

    pub(super) fn run_src_send_capabilities<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // A partner that never GoodCRCs anything is not PD-connected.
        if ctx.timers.is_expired(TimerId::PeNoResponse, ctx.now) && !ctx.port.check_flag(PeFlag::PD_CONNECTED) {
            ctx.timers.disable(TimerId::PeNoResponse);
            return Some(PeState::SrcDisabled);
        }

        // Spaced retransmission of an unanswered offer.
        if ctx.timers.is_expired(TimerId::PeSourceCap, ctx.now) {
            ctx.timers.disable(TimerId::PeSourceCap);
            self.arm_sender_response(ctx);
            self.send_source_caps(ctx);
        }

        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted => {
                // The partner is PD capable; stop the no-response clock.
                ctx.timers.disable(TimerId::PeNoResponse);
                self.hard_reset_counter.reset();
            }
            MsgCheck::Sent => (),
            MsgCheck::Discarded | MsgCheck::DpmDiscarded => {
                return Some(PeState::SrcReady);
            }
        }

        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            // No GoodCRC: the partner may not be PD capable at all.
            return self.src_caps_retry(ctx);
        }

        if let Some(message) = self.take_message(ctx) {
            if message.is_data(DataMessageType::Request) {
                self.partner_request = message.object(0);
                return Some(PeState::SrcNegotiateCapability);
            }
            return Some(PeState::SendSoftReset(Sop::Sop));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::SrcHardReset);
        }

        None
    }

    /// Retransmit Source_Capabilities, give up into SrcDisabled.
    fn src_caps_retry<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<PeState> {
        if self.caps_counter.increment().is_err() {
            return Some(PeState::SrcDisabled);
        }

        ctx.timers
            .enable(TimerId::PeSourceCap, ctx.now, times::T_SEND_SOURCE_CAP_US);
        if ctx.timers.is_disabled(TimerId::PeNoResponse) {
            ctx.timers.enable(TimerId::PeNoResponse, ctx.now, times::T_NO_RESPONSE_US);
        }

        // Stay here; the retry fires off the source-cap timer.
        self.arm_sender_response(ctx);
        None
    }

    pub(super) fn enter_src_negotiate_capability<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let Some(raw_rdo) = self.partner_request else {
            return Some(PeState::SendSoftReset(Sop::Sop));
        };

        let rdo = request::RawDataObject(raw_rdo);
        let position = rdo.object_position();

        let Some(advertised) = self.advertised_pdo(ctx, position) else {
            debug!("C{}: request for unadvertised PDO {}", ctx.id(), position);
            return Some(PeState::SrcCapabilityResponse(CapResponse::Reject));
        };

        // The operating current must fit the advertised limit.
        let ok = match advertised {
            pdo::PowerDataObject::FixedSupply(supply) => {
                rdo.raw_operating_current() <= supply.raw_max_current()
            }
            pdo::PowerDataObject::VariableSupply(supply) => {
                rdo.raw_operating_current() <= supply.raw_max_current()
            }
            _ => false,
        };

        if !ok {
            return Some(PeState::SrcCapabilityResponse(CapResponse::Reject));
        }

        // Keep the DPM's shared-current policy informed about the
        // partner's actual draw.
        crate::dpm::evaluate_request_rdo(ctx, raw_rdo);

        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::Accept);
        self.supplying_pdo = position;
        None
    }

    pub(super) fn run_src_negotiate_capability<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // The supply only moves once the Accept is acknowledged.
        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            return Some(PeState::SrcTransitionSupply);
        }
        if ctx.port.take_flag(PeFlag::MSG_DISCARDED) || ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(PeState::SrcHardReset);
        }
        None
    }

    pub(super) fn run_src_transition_supply<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // tSrcTransition between the Accept and touching the supply.
        if !ctx.timers.is_expired(TimerId::PeSrcTransition, ctx.now) {
            if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
                return Some(PeState::SrcHardReset);
            }
            return None;
        }
        ctx.timers.disable(TimerId::PeSrcTransition);

        ctx.board.transition_voltage(ctx.port.id, self.supplying_pdo as usize);
        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::PsRdy);

        let (mv, ma) = self
            .advertised_pdo(ctx, self.supplying_pdo)
            .map(|p| match p {
                pdo::PowerDataObject::FixedSupply(supply) => {
                    (u32::from(supply.raw_voltage()) * 50, u32::from(supply.raw_max_current()) * 10)
                }
                _ => (5000, 0),
            })
            .unwrap_or((5000, 0));
        let ma = self
            .partner_request
            .map(|raw| (raw >> 10) & 0x3FF)
            .map(|units| units * 10)
            .unwrap_or(ma);

        self.latch_contract(ctx, self.supplying_pdo, mv, ma);
        Some(PeState::SrcReady)
    }

    pub(super) fn run_src_capability_response<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            // An existing explicit contract survives a rejection.
            return Some(if ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
                PeState::SrcReady
            } else {
                PeState::SrcHardReset
            });
        }
        None
    }

    pub(super) fn run_src_ready<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if let Some(message) = self.take_message(ctx) {
            // Source-specific inbound handling first.
            return match message.message_type() {
                MessageType::Data(DataMessageType::Request) => {
                    self.partner_request = message.object(0);
                    Some(PeState::SrcNegotiateCapability)
                }
                MessageType::Data(DataMessageType::SinkCapabilities) => {
                    let caps = pdo::Capabilities::from_objects(&message.objects);
                    crate::dpm::evaluate_sink_caps(ctx, &caps);
                    ctx.port.snk_caps = crate::port::CapsRecord::Known(caps);
                    None
                }
                _ => self.ready_dispatch(message, ctx),
            };
        }

        self.ready_service_dpm(ctx)
    }

    pub(super) fn run_src_disabled<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // A DPM capability change (e.g. a 3 A grant) restarts the offer.
        if ctx.port.take_dpm_request(DpmRequest::SRC_CAP_CHANGE) {
            self.caps_counter.reset();
            return Some(PeState::SrcSendCapabilities);
        }
        None
    }

    // --- Hard reset, source side -------------------------------------

    pub(super) fn enter_src_hard_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if self.hard_reset_counter.increment().is_err() {
            // Exhausted: a port that was never PD-connected just turns
            // off PD; an established one goes through ErrorRecovery.
            return Some(if ctx.port.check_flag(PeFlag::PD_CONNECTED) {
                ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
                PeState::SrcDisabled
            } else {
                PeState::SrcDisabled
            });
        }

        ctx.notify_event(crate::port::EventBits::HARD_RESET);
        ctx.prl.execute_hard_reset(ctx.port.id);
        self.pending_hard_reset_done = false;

        ctx.timers
            .enable(TimerId::PePsHardReset, ctx.now, times::T_PS_HARD_RESET_US);
        ctx.timers.enable(TimerId::PeNoResponse, ctx.now, times::T_NO_RESPONSE_US);
        None
    }

    pub(super) fn run_src_hard_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.timers.is_expired(TimerId::PePsHardReset, ctx.now) {
            ctx.timers.disable(TimerId::PePsHardReset);
            return Some(PeState::SrcTransitionToDefault);
        }
        None
    }

    pub(super) fn run_src_hard_reset_received<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.timers.is_expired(TimerId::PePsHardReset, ctx.now) {
            ctx.timers.disable(TimerId::PePsHardReset);
            return Some(PeState::SrcTransitionToDefault);
        }
        None
    }

    pub(super) fn enter_src_transition_to_default<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // Walk the supply down, then back up: vBus off, data reset to
        // DFP, all modes dropped, then vBus on with VCONN re-armed.
        self.ps_reset_state = 0;
        self.exit_all_modes(ctx);
        ctx.port.invalidate_contract();

        ctx.board.power_supply_reset(ctx.port.id);
        if ctx.port.take_flag(PeFlag::VCONN_ON) {
            let _ = ctx.board.set_vconn(ctx.port.id, false);
        }
        ctx.board.mux_set(ctx.port.id, usbpd_drp_traits::MuxMode::None, false);
        ctx.port.data_role = DataRole::Dfp;

        ctx.timers.disable_range(TimerRange::Pe);
        ctx.timers
            .enable(TimerId::PeTimeout, ctx.now, times::T_SRC_RECOVER_MAX_US);
        None
    }

    pub(super) fn run_src_transition_to_default<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.ps_reset_state {
            // Wait for vBus to actually drop.
            0 => {
                if ctx.board.vbus_at_level(ctx.port.id, VbusLevel::Safe0V)
                    || ctx.timers.is_expired(TimerId::PeTimeout, ctx.now)
                {
                    self.ps_reset_state = 1;
                    ctx.timers.disable(TimerId::PeTimeout);

                    if !ctx.port.polarity.map(|p| p.is_dts()).unwrap_or(false) {
                        if ctx.board.set_vconn(ctx.port.id, true).is_ok() {
                            ctx.port.set_flag(PeFlag::VCONN_ON);
                        }
                    }
                    if ctx.board.power_supply_ready(ctx.port.id).is_err() {
                        ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
                        return None;
                    }
                    ctx.timers.enable(TimerId::PeTimeout, ctx.now, times::T_SRC_TURN_ON_US);
                }
                None
            }
            // Wait for the supply to come back.
            1 => {
                if ctx.board.vbus_at_level(ctx.port.id, VbusLevel::Present)
                    || ctx.timers.is_expired(TimerId::PeTimeout, ctx.now)
                {
                    self.ps_reset_state = 2;
                    ctx.timers.disable(TimerId::PeTimeout);
                    ctx.prl.hard_reset_complete(ctx.port.id);
                    return Some(PeState::SrcStartup);
                }
                None
            }
            _ => Some(PeState::SrcStartup),
        }
    }
}
