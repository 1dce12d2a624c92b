//! Sink-side policy engine states: discovery through Ready and the sink
//! Hard Reset recovery.
use uom::si::power::watt;
use usbpd_drp_traits::{Board, Chipset, ProtocolLayer, Sop, VbusLevel};

use super::{MsgCheck, PeState, PolicyEngine};
use crate::engine::Ctx;
use crate::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::message::pdo::Capabilities;
use crate::message::request::{CurrentRequest, PowerSource, VoltageRequest};
use crate::port::{CapsRecord, DpmRequest, PeFlag};
use crate::timer::{TimerId, TimerRange};
use crate::times;
use crate::{DataRole, PowerRole};

/// Partners offering less than this while constrained are asked to swap.
const PR_SWAP_POWER_THRESHOLD_W: u32 = 27;

impl PolicyEngine {
    pub(super) fn enter_snk_startup<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        ctx.port.set_flag(PeFlag::FIRST_MSG);
        ctx.port
            .clear_flag(PeFlag::PR_SWAP_IN_PROGRESS | PeFlag::FAST_ROLE_SWAP_PATH | PeFlag::IN_EPR);
        Some(PeState::SnkDiscovery)
    }

    pub(super) fn run_snk_discovery<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.vbus_present() {
            return Some(PeState::SnkWaitForCapabilities);
        }
        None
    }

    pub(super) fn run_snk_wait_for_capabilities<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if let Some(message) = self.take_message(ctx) {
            if message.is_data(DataMessageType::SourceCapabilities) {
                ctx.timers.disable(TimerId::PeTimeout);
                ctx.port.set_flag(PeFlag::PD_CONNECTED);
                ctx.port.src_caps = CapsRecord::Known(Capabilities::from_objects(&message.objects));
                return Some(PeState::SnkEvaluateCapability);
            }
            // Everything else is premature; stay and keep waiting.
            return None;
        }

        if ctx.timers.is_expired(TimerId::PeTimeout, ctx.now) {
            ctx.timers.disable(TimerId::PeTimeout);
            ctx.port.set_flag(PeFlag::SNK_WAIT_CAP_TIMEOUT);
            return Some(PeState::SnkHardReset);
        }

        None
    }

    pub(super) fn run_snk_evaluate_capability<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        self.hard_reset_counter.reset();
        ctx.port.clear_flag(PeFlag::SNK_WAIT_CAP_TIMEOUT);

        let Some(caps) = ctx.port.src_caps.known().cloned() else {
            return Some(PeState::SnkHardReset);
        };

        // A constrained partner offering little is better off sinking
        // from us; let policy decide via a posted swap request.
        if !caps.unconstrained_power()
            && caps.dual_role_power()
            && caps.max_power().get::<watt>() < PR_SWAP_POWER_THRESHOLD_W
            && ctx.config.drp_toggle
        {
            debug!("C{}: weak constrained source, requesting PR swap", ctx.id());
            ctx.port.post_dpm_request(DpmRequest::PR_SWAP);
        }

        self.snk_request = PowerSource::new_fixed(CurrentRequest::Highest, VoltageRequest::Highest, &caps).ok();

        Some(PeState::SnkSelectCapability)
    }

    pub(super) fn enter_snk_select_capability<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let Some(request) = self.snk_request else {
            return Some(PeState::SnkHardReset);
        };

        self.arm_sender_response(ctx);
        self.send_data(ctx, Sop::Sop, DataMessageType::Request, &[request.raw()]);
        None
    }

    pub(super) fn run_snk_select_capability<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded | MsgCheck::DpmDiscarded => {
                return Some(if ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
                    PeState::SnkReady
                } else {
                    PeState::SnkWaitForCapabilities
                });
            }
        }

        if let Some(message) = self.take_message(ctx) {
            return match message.message_type() {
                MessageType::Control(ControlMessageType::Accept) => Some(PeState::SnkTransitionSink),
                MessageType::Control(ControlMessageType::Wait) | MessageType::Control(ControlMessageType::Reject) => {
                    if ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
                        if message.message_type() == MessageType::Control(ControlMessageType::Wait) {
                            ctx.timers
                                .enable(TimerId::PeSinkRequest, ctx.now, times::T_SINK_REQUEST_US);
                        }
                        Some(PeState::SnkReady)
                    } else {
                        Some(PeState::SnkWaitForCapabilities)
                    }
                }
                _ => Some(PeState::SendSoftReset(Sop::Sop)),
            };
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::SnkHardReset);
        }

        None
    }

    pub(super) fn run_snk_transition_sink<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::PsRdy) {
                ctx.timers.disable(TimerId::PePsTransition);

                let request = self.snk_request.unwrap_or(PowerSource::Unknown(crate::message::request::RawDataObject(0)));
                let mv = self.requested_mv(ctx, &request).unwrap_or(5000);
                let ma = {
                    use uom::si::electric_current::milliampere;
                    request.operating_current().get::<milliampere>()
                };

                self.latch_contract(ctx, request.object_position(), mv, ma);

                // The full negotiated current becomes available now.
                ctx.board.set_input_current_limit(ctx.port.id, ma, mv);
                return Some(PeState::SnkReady);
            }

            // Any other message during the power transition is fatal.
            return Some(PeState::SnkHardReset);
        }

        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(PeState::SnkHardReset);
        }

        if ctx.timers.is_expired(TimerId::PePsTransition, ctx.now) {
            ctx.timers.disable(TimerId::PePsTransition);
            return Some(PeState::SnkHardReset);
        }

        None
    }

    pub(super) fn run_snk_ready<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if let Some(message) = self.take_message(ctx) {
            return match message.message_type() {
                MessageType::Data(DataMessageType::SourceCapabilities) => {
                    ctx.port.src_caps = CapsRecord::Known(Capabilities::from_objects(&message.objects));
                    Some(PeState::SnkEvaluateCapability)
                }
                MessageType::Data(DataMessageType::EprMode) => self.handle_epr_mode_in_ready(message, ctx),
                MessageType::Extended(crate::message::header::ExtendedMessageType::EprSourceCapabilities) => {
                    self.handle_epr_source_caps(message, ctx)
                }
                MessageType::Extended(crate::message::header::ExtendedMessageType::ExtendedControl) => {
                    self.handle_extended_control(message, ctx)
                }
                MessageType::Control(ControlMessageType::GotoMin) => {
                    // We do not advertise GiveBack; GotoMin is a
                    // protocol error per the negotiated RDO.
                    Some(PeState::SendSoftReset(Sop::Sop))
                }
                _ => self.ready_dispatch(message, ctx),
            };
        }

        // A Wait response arms a back-off before re-requesting.
        if ctx.timers.is_expired(TimerId::PeSinkRequest, ctx.now) {
            ctx.timers.disable(TimerId::PeSinkRequest);
            return Some(PeState::SnkSelectCapability);
        }

        // EPR contracts are kept alive actively.
        if ctx.port.check_flag(PeFlag::IN_EPR) && ctx.timers.is_expired(TimerId::PeSinkEprKeepAlive, ctx.now) {
            ctx.timers.disable(TimerId::PeSinkEprKeepAlive);
            return Some(PeState::EprKeepAlive);
        }

        if ctx.port.take_dpm_request(DpmRequest::GET_SRC_CAPS) {
            ctx.port.set_flag(PeFlag::LOCALLY_INITIATED_AMS | PeFlag::DPM_INITIATED);
            return Some(PeState::GetSourceCap);
        }

        self.ready_service_dpm(ctx)
    }

    // --- Hard reset, sink side ---------------------------------------

    pub(super) fn enter_snk_hard_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if self.hard_reset_counter.increment().is_err() {
            // The source is unresponsive. If it never spoke PD, stop
            // trying; otherwise declare recovery bankruptcy.
            if ctx.port.check_flag(PeFlag::PD_CONNECTED) || !ctx.port.check_flag(PeFlag::SNK_WAIT_CAP_TIMEOUT) {
                ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
            }
            return Some(PeState::SnkReady);
        }

        ctx.notify_event(crate::port::EventBits::HARD_RESET);
        ctx.prl.execute_hard_reset(ctx.port.id);
        self.pending_hard_reset_done = false;
        None
    }

    pub(super) fn run_snk_hard_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if self.pending_hard_reset_done {
            self.pending_hard_reset_done = false;
            return Some(PeState::SnkTransitionToDefault);
        }
        let _ = ctx;
        None
    }

    pub(super) fn enter_snk_transition_to_default<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        self.ps_reset_state = 0;
        self.exit_all_modes(ctx);
        ctx.port.invalidate_contract();
        ctx.port.clear_flag(PeFlag::IN_EPR);
        ctx.port.data_role = DataRole::Ufp;

        // Drop VCONN if we were sourcing it.
        if ctx.port.take_flag(PeFlag::VCONN_ON) {
            let _ = ctx.board.set_vconn(ctx.port.id, false);
        }

        // Ride out vBus going away and coming back.
        ctx.board.auto_discharge_disconnect(ctx.port.id, false);
        ctx.timers.disable_range(TimerRange::Pe);
        ctx.timers.enable(TimerId::PeTimeout, ctx.now, times::T_SAFE_0V_US);
        None
    }

    pub(super) fn run_snk_transition_to_default<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.ps_reset_state {
            0 => {
                if ctx.board.vbus_at_level(ctx.port.id, VbusLevel::Safe0V) {
                    self.ps_reset_state = 1;
                    ctx.timers.disable(TimerId::PeTimeout);
                    ctx.timers.enable(
                        TimerId::PeTimeout,
                        ctx.now,
                        times::T_SRC_RECOVER_MAX_US + times::T_SRC_TURN_ON_US,
                    );
                } else if ctx.timers.is_expired(TimerId::PeTimeout, ctx.now) {
                    // The source never dropped vBus; proceed anyway.
                    self.ps_reset_state = 1;
                    ctx.timers.disable(TimerId::PeTimeout);
                    ctx.timers.enable(
                        TimerId::PeTimeout,
                        ctx.now,
                        times::T_SRC_RECOVER_MAX_US + times::T_SRC_TURN_ON_US,
                    );
                }
                None
            }
            1 => {
                if ctx.vbus_present() {
                    ctx.timers.disable(TimerId::PeTimeout);

                    // Back at the default level; restore the ceiling and
                    // re-arm auto-discharge, then tell the charger.
                    ctx.board.set_input_current_limit(ctx.port.id, 500, 5000);
                    ctx.board.auto_discharge_disconnect(ctx.port.id, true);
                    ctx.prl.hard_reset_complete(ctx.port.id);
                    return Some(PeState::SnkStartup);
                }

                if ctx.timers.is_expired(TimerId::PeTimeout, ctx.now) {
                    ctx.timers.disable(TimerId::PeTimeout);
                    return Some(PeState::SnkHardReset);
                }
                None
            }
            _ => Some(PeState::SnkStartup),
        }
    }

    // --- Requester states shared with the source ---------------------

    pub(super) fn run_get_sink_cap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded => return Some(PeState::ready(ctx.port.power_role)),
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::GET_SNK_CAPS);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            match message.message_type() {
                MessageType::Data(DataMessageType::SinkCapabilities) => {
                    let caps = Capabilities::from_objects(&message.objects);
                    crate::dpm::evaluate_sink_caps(ctx, &caps);
                    ctx.port.snk_caps = CapsRecord::Known(caps);
                }
                MessageType::Control(ControlMessageType::NotSupported)
                | MessageType::Control(ControlMessageType::Reject) => {
                    ctx.port.snk_caps = CapsRecord::Fail;
                }
                _ => return Some(PeState::SendSoftReset(Sop::Sop)),
            }
            return Some(PeState::ready(ctx.port.power_role));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            ctx.port.snk_caps = CapsRecord::Fail;
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    pub(super) fn run_get_source_cap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded => return Some(PeState::ready(ctx.port.power_role)),
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::GET_SRC_CAPS);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            match message.message_type() {
                MessageType::Data(DataMessageType::SourceCapabilities) => {
                    ctx.port.src_caps = CapsRecord::Known(Capabilities::from_objects(&message.objects));
                    if ctx.port.power_role == PowerRole::Sink {
                        return Some(PeState::SnkEvaluateCapability);
                    }
                }
                MessageType::Control(ControlMessageType::NotSupported)
                | MessageType::Control(ControlMessageType::Reject) => {
                    ctx.port.src_caps = CapsRecord::Fail;
                }
                _ => return Some(PeState::SendSoftReset(Sop::Sop)),
            }
            return Some(PeState::ready(ctx.port.power_role));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            ctx.port.src_caps = CapsRecord::Fail;
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    pub(super) fn run_get_status<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded | MsgCheck::DpmDiscarded => return Some(PeState::ready(ctx.port.power_role)),
        }

        if let Some(message) = self.take_message(ctx) {
            if message.is_extended(crate::message::header::ExtendedMessageType::Status) {
                debug!("C{}: partner status: {:?}", ctx.id(), message.ext_payload());
            }
            return Some(PeState::ready(ctx.port.power_role));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    pub(super) fn run_send_alert<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::TX_COMPLETE) || ctx.port.take_flag(PeFlag::MSG_DISCARDED) {
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }
}
