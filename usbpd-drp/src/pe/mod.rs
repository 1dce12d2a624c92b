//! USB-PD policy engine.
//!
//! Realizes the normative r3.x source/sink/DRP message-level behavior:
//! capability exchange, contract negotiation, resets, swaps, VDMs, BIST,
//! Data Reset and EPR. The connection layer beneath decides when this
//! engine runs; the device policy manager above posts requests through
//! the port's atomic request bits.

mod data_reset;
mod epr;
mod sink;
mod source;
mod swaps;
mod vdm;

#[cfg(test)]
mod tests;

pub(crate) use data_reset::EnterUsbPlan;
pub(crate) use vdm::{VdmExchange, VdmExchangeKind, VdmResult};

use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, PdRev, PrlError, ProtocolLayer, Sop};

use crate::counters::{Counter, CounterType};
use crate::engine::Ctx;
use crate::message::header::{ControlMessageType, DataMessageType, ExtendedMessageType, MessageType};
use crate::message::{RxMessage, bist, pdo, request, status};
use crate::port::{CapsRecord, Contract, DpmRequest, EventBits, PeFlag};
use crate::timer::TimerId;
use crate::times;
use crate::{DataRole, PowerRole};

/// Result of the shared request-then-reply transmit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgCheck {
    /// Transmit is enqueued; neither GoodCRC nor a discard arrived yet.
    SendPending,
    /// GoodCRC arrived this tick; the sender-response timer is running.
    SendCompleted,
    /// Completion was already observed; still awaiting the reply.
    Sent,
    /// The outbound was pre-empted; return to Ready.
    Discarded,
    /// As `Discarded`, but the DPM request that opened the exchange was
    /// re-posted because it had been cleared speculatively.
    DpmDiscarded,
}

/// Reject or Wait, for the source capability-response state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum CapResponse {
    /// The request cannot be met.
    Reject,
    /// The request could be met later.
    Wait,
}

/// Policy engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum PeState {
    // Source chain.
    SrcStartup,
    SrcDiscovery,
    SrcSendCapabilities,
    SrcNegotiateCapability,
    SrcTransitionSupply,
    SrcReady,
    SrcDisabled,
    SrcCapabilityResponse(CapResponse),
    SrcHardReset,
    SrcHardResetReceived,
    SrcTransitionToDefault,

    // Sink chain.
    SnkStartup,
    SnkDiscovery,
    SnkWaitForCapabilities,
    SnkEvaluateCapability,
    SnkSelectCapability,
    SnkTransitionSink,
    SnkReady,
    SnkHardReset,
    SnkTransitionToDefault,

    // Soft reset, both directions.
    SendSoftReset(Sop),
    SoftResetReceived,

    // Responders.
    SendNotSupported,
    GiveSinkCap,
    GiveSourceCap,
    GiveStatus,
    GiveBatteryCap,
    GiveBatteryStatus,
    GiveRevision,

    // Requesters driven by DPM bits.
    GetSinkCap,
    GetSourceCap,
    GetStatus,
    SendAlert,

    // Power-role swap (the FRS arm shares the sink-to-source chain).
    SendPrSwap,
    EvaluatePrSwap,
    PrsSrcSnkTransitionToOff,
    PrsSrcSnkAssertRd,
    PrsSrcSnkWaitSourceOn,
    FrsSnkSrcStartAms,
    PrsSnkSrcTransitionToOff,
    PrsSnkSrcAssertRp,
    PrsSnkSrcSourceOn,

    // Data-role swap.
    SendDrSwap,

    // VCONN swap.
    SendVconnSwap,
    EvaluateVconnSwap,
    VcsWaitForVconn,
    VcsTurnOnVconn,
    VcsTurnOffVconn,
    VcsSendPsRdy,
    VcsForceVconn,

    // Structured VDM exchange super-state.
    VdmRequest,

    // Data Reset chains.
    DdrSendDataReset,
    DdrWaitForVconnOff,
    DdrPerformDataReset,
    UdrSendAccept,
    UdrTurnOffVconn,
    UdrWaitForDataResetComplete,

    // Enter_USB.
    EnterUsb,

    // EPR (sink side).
    EprModeEntry,
    EprEntryWaitForResponse,
    EprKeepAlive,
    EprModeExit,

    // BIST carrier mode.
    BistTx,
}

impl PeState {
    /// States that consume `PROTOCOL_ERROR` themselves instead of the
    /// generic soft-reset fallback.
    fn consumes_protocol_error(self) -> bool {
        matches!(
            self,
            PeState::SrcSendCapabilities
                | PeState::SrcTransitionSupply
                | PeState::PrsSrcSnkTransitionToOff
                | PeState::PrsSrcSnkAssertRd
                | PeState::PrsSrcSnkWaitSourceOn
                | PeState::PrsSnkSrcTransitionToOff
                | PeState::PrsSnkSrcAssertRp
                | PeState::PrsSnkSrcSourceOn
                | PeState::FrsSnkSrcStartAms
                | PeState::DdrSendDataReset
                | PeState::DdrWaitForVconnOff
                | PeState::DdrPerformDataReset
                | PeState::UdrSendAccept
                | PeState::UdrTurnOffVconn
                | PeState::UdrWaitForDataResetComplete
                | PeState::SendSoftReset(_)
                | PeState::SoftResetReceived
        )
    }

    /// The Ready state for a role.
    fn ready(power_role: PowerRole) -> Self {
        match power_role {
            PowerRole::Source => PeState::SrcReady,
            PowerRole::Sink => PeState::SnkReady,
        }
    }

    /// The Hard Reset state for a role.
    fn hard_reset(power_role: PowerRole) -> Self {
        match power_role {
            PowerRole::Source => PeState::SrcHardReset,
            PowerRole::Sink => PeState::SnkHardReset,
        }
    }
}

/// The policy engine for one port.
#[derive(Debug)]
pub struct PolicyEngine {
    state: Option<PeState>,
    entered: bool,

    pub(crate) caps_counter: Counter,
    pub(crate) hard_reset_counter: Counter,
    pub(crate) discover_identity_counter: Counter,
    pub(crate) pr_swap_wait_counter: Counter,

    /// Sender-response pattern: completion already observed.
    sent: bool,

    /// Pending asynchronous signals from the protocol layer path.
    pending_hard_reset_rx: bool,
    pending_hard_reset_done: bool,
    pending_tch_error: Option<Sop>,

    /// The RDO received while source, kept through the supply transition.
    pub(crate) partner_request: Option<u32>,
    /// The request we sent while sink.
    pub(crate) snk_request: Option<request::PowerSource>,
    /// Currently supplied PDO index while source.
    pub(crate) supplying_pdo: u8,

    /// The VDM exchange prepared by the DPM or discovery.
    pub(crate) vdm: Option<VdmExchange>,
    /// Outcome of the last DPM-driven exchange, until consumed.
    pub(crate) vdm_result: Option<VdmResult>,
    /// One-shot response-budget extension for slow VDM responders.
    vdm_timeout_extended: bool,
    /// Discover Identity attempts before an explicit contract.
    pub(crate) identity_precontract_attempts: u8,

    /// Walks the source Hard Reset supply cycle.
    pub(crate) ps_reset_state: u8,

    /// Sink EPR operational PDP, carried into the entry exchange.
    pub(crate) epr_entry_pdp: u8,

    /// Data Reset bookkeeping.
    pub(crate) data_reset_vconn_cycled: bool,
    /// Outcome of the last Data Reset run, until the DPM consumes it.
    pub(crate) data_reset_outcome: Option<bool>,

    /// A reset tore every alternate mode down; the DPM synchronizes its
    /// mode-module state off this on its next run.
    pub(crate) alt_mode_teardown: bool,

    /// The Enter_USB plan prepared by the DPM.
    pub(crate) enter_usb: Option<data_reset::EnterUsbPlan>,
    /// Outcome of the last Enter_USB run, until the DPM consumes it.
    pub(crate) enter_usb_outcome: Option<bool>,
}

impl PolicyEngine {
    /// Create the engine, stopped.
    pub fn new() -> Self {
        Self {
            state: None,
            entered: false,
            caps_counter: Counter::new(CounterType::Caps),
            hard_reset_counter: Counter::new(CounterType::HardReset),
            discover_identity_counter: Counter::new(CounterType::DiscoverIdentity),
            pr_swap_wait_counter: Counter::new(CounterType::PrSwapWait),
            sent: false,
            pending_hard_reset_rx: false,
            pending_hard_reset_done: false,
            pending_tch_error: None,
            partner_request: None,
            snk_request: None,
            supplying_pdo: 0,
            vdm: None,
            vdm_result: None,
            vdm_timeout_extended: false,
            identity_precontract_attempts: 0,
            ps_reset_state: 0,
            epr_entry_pdp: 0,
            data_reset_vconn_cycled: false,
            data_reset_outcome: None,
            alt_mode_teardown: false,
            enter_usb: None,
            enter_usb_outcome: None,
        }
    }

    /// The current state, if running.
    pub fn state(&self) -> Option<PeState> {
        self.state
    }

    /// Force a state without running entry actions, for tests.
    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: PeState) {
        self.state = Some(state);
        self.entered = true;
    }

    /// Whether the engine is running.
    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// Hard Reset ordered sets were seen on the wire.
    pub(crate) fn hard_reset_received(&mut self) {
        self.pending_hard_reset_rx = true;
    }

    /// Our Hard Reset signaling completed.
    pub(crate) fn hard_reset_sent(&mut self) {
        self.pending_hard_reset_done = true;
    }

    /// A chunked transmission failed; soft-reset that SOP.
    pub(crate) fn note_tch_error(&mut self, sop: Sop) {
        self.pending_tch_error = Some(sop);
    }

    /// Stop and clear, e.g. on detach.
    pub(crate) fn ensure_stopped<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, _ctx: &mut Ctx<P, B, C>) {
        if self.state.is_some() {
            *self = Self::new();
        }
    }

    /// Run one tick.
    pub(crate) fn run<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let Some(state) = self.state else {
            // First tick after the connection layer enabled PD.
            let start = match ctx.port.power_role {
                PowerRole::Source => PeState::SrcStartup,
                PowerRole::Sink => PeState::SnkStartup,
            };
            self.transition(start, ctx);
            return;
        };

        if let Some(next) = self.run_common(state, ctx) {
            self.transition(next, ctx);
            return;
        }

        if !self.entered {
            self.entered = true;
            if let Some(next) = self.enter_state(state, ctx) {
                self.transition(next, ctx);
                return;
            }
        }

        if let Some(next) = self.run_state(state, ctx) {
            self.transition(next, ctx);
        }
    }

    pub(crate) fn transition<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, next: PeState, ctx: &mut Ctx<P, B, C>) {
        debug!("C{}: PE {:?} -> {:?}", ctx.id(), self.state, next);

        self.state = Some(next);
        self.entered = false;

        // Run entry actions immediately, chaining transitions made from
        // entry, bounded by the acyclic entry graph.
        self.entered = true;
        if let Some(chained) = self.enter_state(next, ctx) {
            self.transition(chained, ctx);
        }
    }

    /// Signals that outrank the current state.
    fn run_common<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        state: PeState,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // Hard Reset seen on the wire wins over everything.
        if self.pending_hard_reset_rx {
            self.pending_hard_reset_rx = false;
            ctx.notify_event(EventBits::HARD_RESET);
            return Some(match ctx.port.power_role {
                PowerRole::Source => PeState::SrcHardResetReceived,
                PowerRole::Sink => PeState::SnkTransitionToDefault,
            });
        }

        // FRS signal, only meaningful as a sink.
        if ctx.port.take_flag(PeFlag::FAST_ROLE_SWAP_SIGNALED) {
            if ctx.port.power_role == PowerRole::Sink && ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
                ctx.port.set_flag(PeFlag::FAST_ROLE_SWAP_PATH);
                return Some(PeState::FrsSnkSrcStartAms);
            }
            ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
            return None;
        }

        // DPM-requested Hard Reset.
        if ctx.port.take_dpm_request(DpmRequest::HARD_RESET_SEND) {
            return Some(PeState::hard_reset(ctx.port.power_role));
        }

        // A chunked-transmit failure soft-resets the offending SOP.
        if let Some(sop) = self.pending_tch_error.take() {
            return Some(PeState::SendSoftReset(sop));
        }

        // Inbound Soft_Reset is answered from any state.
        if self.peek_message(ctx, |message| {
            message.message_type() == MessageType::Control(ControlMessageType::SoftReset)
        }) {
            ctx.port.rx = None;
            ctx.port.clear_flag(PeFlag::MSG_RECEIVED);
            return Some(PeState::SoftResetReceived);
        }

        // Generic protocol-error fallback; the named states consume the
        // flag themselves.
        if !state.consumes_protocol_error() && ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(if ctx.port.check_flag(PeFlag::INTERRUPTIBLE_AMS) {
                PeState::ready(ctx.port.power_role)
            } else {
                PeState::SendSoftReset(Sop::Sop)
            });
        }

        None
    }

    // --- Plumbing -----------------------------------------------------

    /// Whether the mailbox holds a message matching `check`.
    fn peek_message<P: ProtocolLayer, B: Board, C: Chipset>(
        &self,
        ctx: &Ctx<P, B, C>,
        check: impl FnOnce(&RxMessage) -> bool,
    ) -> bool {
        ctx.port.check_flag(PeFlag::MSG_RECEIVED) && ctx.port.rx.as_ref().map(check).unwrap_or(false)
    }

    /// Take the pending inbound message, if any.
    pub(crate) fn take_message<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<RxMessage> {
        if !ctx.port.take_flag(PeFlag::MSG_RECEIVED) {
            return None;
        }
        ctx.port.rx.take()
    }

    /// Enqueue a control message.
    pub(crate) fn send_ctrl<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
        msg_type: ControlMessageType,
    ) {
        ctx.port.clear_flag(PeFlag::TX_COMPLETE | PeFlag::MSG_DISCARDED);
        if let Err(prl_error) = ctx.prl.send_ctrl(ctx.port.id, sop, msg_type as u8) {
            self.note_send_failure(ctx, prl_error);
        }
    }

    /// Enqueue a data message.
    pub(crate) fn send_data<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
        msg_type: DataMessageType,
        objects: &[u32],
    ) {
        ctx.port.clear_flag(PeFlag::TX_COMPLETE | PeFlag::MSG_DISCARDED);
        if let Err(prl_error) = ctx.prl.send_data(ctx.port.id, sop, msg_type as u8, objects) {
            self.note_send_failure(ctx, prl_error);
        }
    }

    /// Enqueue an extended message.
    pub(crate) fn send_ext<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
        msg_type: ExtendedMessageType,
        data: &[u8],
    ) {
        ctx.port.clear_flag(PeFlag::TX_COMPLETE | PeFlag::MSG_DISCARDED);
        if let Err(prl_error) = ctx.prl.send_ext(ctx.port.id, sop, msg_type as u8, data) {
            self.note_send_failure(ctx, prl_error);
        }
    }

    fn note_send_failure<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>, error: PrlError) {
        warn!("C{}: protocol layer rejected send: {:?}", ctx.id(), error);
        ctx.port.set_flag(PeFlag::PROTOCOL_ERROR);
    }

    /// The shared request-then-reply transmit check.
    ///
    /// Call each tick after enqueueing a request; drives the
    /// sender-response timer off the GoodCRC.
    pub(crate) fn msg_check<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> MsgCheck {
        if ctx.port.take_flag(PeFlag::MSG_DISCARDED) {
            ctx.port.clear_flag(PeFlag::LOCALLY_INITIATED_AMS);
            if ctx.port.take_flag(PeFlag::DPM_INITIATED) {
                return MsgCheck::DpmDiscarded;
            }
            return MsgCheck::Discarded;
        }

        if self.sent {
            return MsgCheck::Sent;
        }

        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            self.sent = true;
            ctx.port.set_flag(PeFlag::PD_CONNECTED);
            ctx.timers
                .enable(TimerId::PeSenderResponse, ctx.now, times::T_SENDER_RESPONSE_US);
            return MsgCheck::SendCompleted;
        }

        MsgCheck::SendPending
    }

    /// Arm the sender-response pattern on state entry.
    pub(crate) fn arm_sender_response<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        self.sent = false;
        ctx.timers.disable(TimerId::PeSenderResponse);
    }

    /// Common Ready-entry bookkeeping; returns the Ready state.
    pub(crate) fn enter_ready<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        ctx.port.clear_flag(
            PeFlag::LOCALLY_INITIATED_AMS
                | PeFlag::MSG_DISCARDED
                | PeFlag::VDM_REQUEST_TIMEOUT
                | PeFlag::INTERRUPTIBLE_AMS
                | PeFlag::DPM_INITIATED,
        );
        ctx.timers.disable(TimerId::PeSenderResponse);

        if ctx.port.check_flag(PeFlag::FIRST_MSG) && ctx.rev(Sop::Sop) == PdRev::R2_0 {
            // PD r2.0 has no collision avoidance; jitter the first AMS.
            ctx.timers
                .enable(TimerId::PeWaitAndAddJitter, ctx.now, times::T_WAIT_AND_ADD_JITTER_US);
        } else {
            ctx.port.clear_flag(PeFlag::FIRST_MSG);
        }
    }

    /// Whether an AMS may be opened right now (jitter gate).
    fn ams_gate_open<P: ProtocolLayer, B: Board, C: Chipset>(&self, ctx: &mut Ctx<P, B, C>) -> bool {
        if !ctx.port.check_flag(PeFlag::FIRST_MSG) {
            return true;
        }
        if ctx.timers.is_disabled(TimerId::PeWaitAndAddJitter)
            || ctx.timers.is_expired(TimerId::PeWaitAndAddJitter, ctx.now)
        {
            ctx.port.clear_flag(PeFlag::FIRST_MSG);
            ctx.timers.disable(TimerId::PeWaitAndAddJitter);
            return true;
        }
        false
    }

    // --- State dispatch ----------------------------------------------

    fn enter_state<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        state: PeState,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match state {
            PeState::SrcStartup => self.enter_src_startup(ctx),
            PeState::SrcSendCapabilities => {
                self.arm_sender_response(ctx);
                self.send_source_caps(ctx);
                None
            }
            PeState::SrcNegotiateCapability => self.enter_src_negotiate_capability(ctx),
            PeState::SrcTransitionSupply => {
                ctx.timers
                    .enable(TimerId::PeSrcTransition, ctx.now, times::T_SRC_TRANSITION_US);
                None
            }
            PeState::SrcCapabilityResponse(response) => {
                let reply = match response {
                    CapResponse::Reject => ControlMessageType::Reject,
                    CapResponse::Wait => ControlMessageType::Wait,
                };
                self.send_ctrl(ctx, Sop::Sop, reply);
                None
            }
            PeState::SrcReady | PeState::SnkReady => {
                self.enter_ready(ctx);
                None
            }
            PeState::SrcDisabled => {
                info!("C{}: source disabled, partner not PD capable", ctx.id());
                None
            }
            PeState::SrcHardReset => self.enter_src_hard_reset(ctx),
            PeState::SrcHardResetReceived => {
                ctx.timers
                    .enable(TimerId::PePsHardReset, ctx.now, times::T_PS_HARD_RESET_US);
                ctx.timers.enable(TimerId::PeNoResponse, ctx.now, times::T_NO_RESPONSE_US);
                None
            }
            PeState::SrcTransitionToDefault => self.enter_src_transition_to_default(ctx),

            PeState::SnkStartup => self.enter_snk_startup(ctx),
            PeState::SnkWaitForCapabilities => {
                ctx.timers
                    .enable(TimerId::PeTimeout, ctx.now, times::T_SINK_WAIT_CAP_US);
                None
            }
            PeState::SnkSelectCapability => self.enter_snk_select_capability(ctx),
            PeState::SnkTransitionSink => {
                ctx.timers
                    .enable(TimerId::PePsTransition, ctx.now, times::T_PS_TRANSITION_US);
                self.apply_sink_standby(ctx);
                None
            }
            PeState::SnkHardReset => self.enter_snk_hard_reset(ctx),
            PeState::SnkTransitionToDefault => self.enter_snk_transition_to_default(ctx),

            PeState::SendSoftReset(sop) => {
                ctx.prl.reset_soft(ctx.port.id);
                self.arm_sender_response(ctx);
                self.send_ctrl(ctx, sop, ControlMessageType::SoftReset);
                None
            }
            PeState::SoftResetReceived => {
                ctx.prl.reset_soft(ctx.port.id);
                self.send_ctrl(ctx, Sop::Sop, ControlMessageType::Accept);
                None
            }

            PeState::SendNotSupported => {
                // Not_Supported only exists from r3.0; r2.0 uses Reject.
                let reply = if ctx.rev(Sop::Sop) == PdRev::R2_0 {
                    ControlMessageType::Reject
                } else {
                    ControlMessageType::NotSupported
                };
                self.send_ctrl(ctx, Sop::Sop, reply);
                None
            }
            PeState::GiveSinkCap => {
                let pdos = ctx.config.snk_pdos.clone();
                self.send_data(ctx, Sop::Sop, DataMessageType::SinkCapabilities, &pdos);
                None
            }
            PeState::GiveSourceCap => {
                self.send_source_caps(ctx);
                None
            }
            PeState::GiveStatus => self.enter_give_status(ctx),
            PeState::GiveBatteryCap => self.enter_give_battery_cap(ctx),
            PeState::GiveBatteryStatus => self.enter_give_battery_status(ctx),
            PeState::GiveRevision => {
                // Our revision message data object: PD r3.1, version 1.8.
                let rmdo = (3u32 << 28) | (1 << 24) | (1 << 20) | (8 << 16);
                self.send_data(ctx, Sop::Sop, DataMessageType::Revision, &[rmdo]);
                None
            }

            PeState::GetSinkCap | PeState::GetSourceCap | PeState::GetStatus => {
                self.arm_sender_response(ctx);
                let request = match state {
                    PeState::GetSinkCap => ControlMessageType::GetSinkCap,
                    PeState::GetSourceCap => ControlMessageType::GetSourceCap,
                    _ => ControlMessageType::GetStatus,
                };
                self.send_ctrl(ctx, Sop::Sop, request);
                None
            }
            PeState::SendAlert => {
                let Some(ado) = ctx.port.pending_ado.take() else {
                    return Some(PeState::ready(ctx.port.power_role));
                };
                self.send_data(ctx, Sop::Sop, DataMessageType::Alert, &[ado]);
                None
            }

            PeState::SendPrSwap | PeState::SendDrSwap | PeState::SendVconnSwap => {
                self.arm_sender_response(ctx);
                let request = match state {
                    PeState::SendPrSwap => ControlMessageType::PrSwap,
                    PeState::SendDrSwap => ControlMessageType::DrSwap,
                    _ => ControlMessageType::VconnSwap,
                };
                self.send_ctrl(ctx, Sop::Sop, request);
                None
            }
            PeState::EvaluatePrSwap => self.enter_evaluate_pr_swap(ctx),
            PeState::PrsSrcSnkTransitionToOff => self.enter_prs_src_snk_transition_to_off(ctx),
            PeState::PrsSrcSnkAssertRd => self.enter_prs_src_snk_assert_rd(ctx),
            PeState::PrsSrcSnkWaitSourceOn => self.enter_prs_src_snk_wait_source_on(ctx),
            PeState::FrsSnkSrcStartAms => self.enter_frs_start_ams(ctx),
            PeState::PrsSnkSrcTransitionToOff => self.enter_prs_snk_src_transition_to_off(ctx),
            PeState::PrsSnkSrcAssertRp => self.enter_prs_snk_src_assert_rp(ctx),
            PeState::PrsSnkSrcSourceOn => self.enter_prs_snk_src_source_on(ctx),

            PeState::EvaluateVconnSwap => self.enter_evaluate_vconn_swap(ctx),
            PeState::VcsWaitForVconn => {
                ctx.timers
                    .enable(TimerId::PeVconnOn, ctx.now, times::T_VCONN_SOURCE_ON_US);
                None
            }
            PeState::VcsTurnOnVconn => self.enter_vcs_turn_on_vconn(ctx),
            PeState::VcsTurnOffVconn => self.enter_vcs_turn_off_vconn(ctx),
            PeState::VcsSendPsRdy => {
                self.send_ctrl(ctx, Sop::Sop, ControlMessageType::PsRdy);
                None
            }
            PeState::VcsForceVconn => self.enter_vcs_force_vconn(ctx),

            PeState::VdmRequest => self.enter_vdm_request(ctx),

            PeState::DdrSendDataReset => self.enter_ddr_send_data_reset(ctx),
            PeState::DdrWaitForVconnOff => self.enter_ddr_wait_for_vconn_off(ctx),
            PeState::DdrPerformDataReset => self.enter_ddr_perform_data_reset(ctx),
            PeState::UdrSendAccept => {
                self.send_ctrl(ctx, Sop::Sop, ControlMessageType::Accept);
                None
            }
            PeState::UdrTurnOffVconn => self.enter_udr_turn_off_vconn(ctx),
            PeState::UdrWaitForDataResetComplete => None,

            PeState::EnterUsb => self.enter_enter_usb(ctx),

            PeState::EprModeEntry => self.enter_epr_mode_entry(ctx),
            PeState::EprEntryWaitForResponse => {
                ctx.timers
                    .enable(TimerId::PeSinkEprEnter, ctx.now, times::T_SINK_EPR_ENTER_US);
                None
            }
            PeState::EprKeepAlive => self.enter_epr_keep_alive(ctx),
            PeState::EprModeExit => self.enter_epr_mode_exit(ctx),

            PeState::BistTx => {
                ctx.timers
                    .enable(TimerId::PeBistContMode, ctx.now, times::T_BIST_CONT_MODE_US);
                None
            }

            _ => None,
        }
    }

    fn run_state<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        state: PeState,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match state {
            PeState::SrcStartup => self.run_src_startup(ctx),
            PeState::SrcDiscovery => self.run_src_discovery(ctx),
            PeState::SrcSendCapabilities => self.run_src_send_capabilities(ctx),
            PeState::SrcNegotiateCapability => self.run_src_negotiate_capability(ctx),
            PeState::SrcTransitionSupply => self.run_src_transition_supply(ctx),
            PeState::SrcReady => self.run_src_ready(ctx),
            PeState::SrcDisabled => self.run_src_disabled(ctx),
            PeState::SrcCapabilityResponse(_) => self.run_src_capability_response(ctx),
            PeState::SrcHardReset => self.run_src_hard_reset(ctx),
            PeState::SrcHardResetReceived => self.run_src_hard_reset_received(ctx),
            PeState::SrcTransitionToDefault => self.run_src_transition_to_default(ctx),

            PeState::SnkStartup => None,
            PeState::SnkDiscovery => self.run_snk_discovery(ctx),
            PeState::SnkWaitForCapabilities => self.run_snk_wait_for_capabilities(ctx),
            PeState::SnkEvaluateCapability => self.run_snk_evaluate_capability(ctx),
            PeState::SnkSelectCapability => self.run_snk_select_capability(ctx),
            PeState::SnkTransitionSink => self.run_snk_transition_sink(ctx),
            PeState::SnkReady => self.run_snk_ready(ctx),
            PeState::SnkHardReset => self.run_snk_hard_reset(ctx),
            PeState::SnkTransitionToDefault => self.run_snk_transition_to_default(ctx),

            PeState::SendSoftReset(sop) => self.run_send_soft_reset(sop, ctx),
            PeState::SoftResetReceived => self.run_soft_reset_received(ctx),

            PeState::SendNotSupported
            | PeState::GiveSinkCap
            | PeState::GiveSourceCap
            | PeState::GiveStatus
            | PeState::GiveBatteryCap
            | PeState::GiveBatteryStatus
            | PeState::GiveRevision
            | PeState::VcsSendPsRdy => self.run_reply_then_ready(state, ctx),

            PeState::GetSinkCap => self.run_get_sink_cap(ctx),
            PeState::GetSourceCap => self.run_get_source_cap(ctx),
            PeState::GetStatus => self.run_get_status(ctx),
            PeState::SendAlert => self.run_send_alert(ctx),

            PeState::SendPrSwap => self.run_send_pr_swap(ctx),
            PeState::EvaluatePrSwap => self.run_evaluate_pr_swap(ctx),
            PeState::PrsSrcSnkTransitionToOff => self.run_prs_src_snk_transition_to_off(ctx),
            PeState::PrsSrcSnkAssertRd => None,
            PeState::PrsSrcSnkWaitSourceOn => self.run_prs_src_snk_wait_source_on(ctx),
            PeState::FrsSnkSrcStartAms => self.run_frs_start_ams(ctx),
            PeState::PrsSnkSrcTransitionToOff => self.run_prs_snk_src_transition_to_off(ctx),
            PeState::PrsSnkSrcAssertRp => None,
            PeState::PrsSnkSrcSourceOn => self.run_prs_snk_src_source_on(ctx),

            PeState::SendDrSwap => self.run_send_dr_swap(ctx),

            PeState::SendVconnSwap => self.run_send_vconn_swap(ctx),
            PeState::EvaluateVconnSwap => None,
            PeState::VcsWaitForVconn => self.run_vcs_wait_for_vconn(ctx),
            PeState::VcsTurnOnVconn => self.run_vcs_turn_on_vconn(ctx),
            PeState::VcsTurnOffVconn => self.run_vcs_turn_off_vconn(ctx),
            PeState::VcsForceVconn => None,

            PeState::VdmRequest => self.run_vdm_request(ctx),

            PeState::DdrSendDataReset => self.run_ddr_send_data_reset(ctx),
            PeState::DdrWaitForVconnOff => self.run_ddr_wait_for_vconn_off(ctx),
            PeState::DdrPerformDataReset => self.run_ddr_perform_data_reset(ctx),
            PeState::UdrSendAccept => self.run_udr_send_accept(ctx),
            PeState::UdrTurnOffVconn => self.run_udr_turn_off_vconn(ctx),
            PeState::UdrWaitForDataResetComplete => self.run_udr_wait_for_complete(ctx),

            PeState::EnterUsb => self.run_enter_usb(ctx),

            PeState::EprModeEntry => self.run_epr_mode_entry(ctx),
            PeState::EprEntryWaitForResponse => self.run_epr_entry_wait(ctx),
            PeState::EprKeepAlive => self.run_epr_keep_alive(ctx),
            PeState::EprModeExit => self.run_epr_mode_exit(ctx),

            PeState::BistTx => self.run_bist_tx(ctx),
        }
    }

    // --- Reply-then-Ready responders ---------------------------------

    /// Wait out the GoodCRC of a single reply, then return to Ready.
    fn run_reply_then_ready<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        state: PeState,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            if state == PeState::VcsSendPsRdy {
                // A successful VCONN swap restarts cable discovery.
                self.discover_identity_counter.reset();
                ctx.port.discovery[Sop::SopPrime.index()].identity_state = Default::default();
            }
            return Some(PeState::ready(ctx.port.power_role));
        }
        if ctx.port.take_flag(PeFlag::MSG_DISCARDED) {
            return Some(PeState::ready(ctx.port.power_role));
        }
        None
    }

    fn enter_give_status<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<PeState> {
        let sdb = self.build_status(ctx);
        let mut buf = [0u8; 8];
        let len = sdb.to_bytes(&mut buf);
        self.send_ext(ctx, Sop::Sop, ExtendedMessageType::Status, &buf[..len]);
        None
    }

    /// Assemble the status data block from collaborator state.
    fn build_status<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> status::StatusDataBlock {
        use usbpd_drp_traits::ChipsetState;

        // The r3.1 byte is only sent to partners that reported r3.1+
        // through Get_Revision.
        let r31 = matches!(ctx.port.partner_rmdo, Some((major, minor)) if major > 3 || (major == 3 && minor >= 1));

        let power_state_change = r31.then(|| {
            let (state, indicator) = match ctx.chipset.state() {
                ChipsetState::On => (status::PowerState::S0, status::PowerIndicator::On),
                ChipsetState::Suspend => (status::PowerState::S3, status::PowerIndicator::Blinking),
                ChipsetState::SoftOff => (status::PowerState::S5, status::PowerIndicator::Off),
                ChipsetState::HardOff => (status::PowerState::G3, status::PowerIndicator::Off),
            };
            u8::from(state) | u8::from(indicator)
        });

        status::StatusDataBlock {
            temperature_status: status::TemperatureStatus::Normal.into(),
            power_state_change,
            ..Default::default()
        }
    }

    fn enter_give_battery_cap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        use crate::message::battery::{BatteryCapabilities, CAPACITY_UNKNOWN};

        // A single fixed battery; slots beyond it are invalid references.
        let message = self.take_message(ctx);
        let valid_ref = message
            .as_ref()
            .map(|m| m.ext_payload().first().copied().unwrap_or(0) == 0)
            .unwrap_or(false);

        let caps = BatteryCapabilities {
            vid: 0,
            pid: 0,
            design_capacity: CAPACITY_UNKNOWN,
            full_charge_capacity: CAPACITY_UNKNOWN,
            invalid_battery_reference: !valid_ref,
        };

        let mut buf = [0u8; 9];
        let len = caps.to_bytes(&mut buf);
        self.send_ext(ctx, Sop::Sop, ExtendedMessageType::BatteryCapabilities, &buf[..len]);
        None
    }

    fn enter_give_battery_status<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        use crate::message::battery::BatteryStatusDo;

        let message = self.take_message(ctx);
        let valid_ref = message
            .as_ref()
            .map(|m| m.ext_payload().first().copied().unwrap_or(0) == 0)
            .unwrap_or(false);

        let status = if valid_ref {
            BatteryStatusDo::new_present(
                crate::message::battery::CAPACITY_UNKNOWN,
                crate::message::battery::BatteryChargingStatus::Idle,
            )
        } else {
            BatteryStatusDo::new_invalid()
        };

        self.send_data(ctx, Sop::Sop, DataMessageType::BatteryStatus, &[status.0]);
        None
    }

    // --- Ready-state inbound dispatch --------------------------------

    /// Dispatch an inbound message common to both Ready states.
    ///
    /// Returns the next state, or `None` when the message was absorbed.
    fn ready_dispatch<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        message: RxMessage,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match message.message_type() {
            MessageType::Control(ControlMessageType::GetSinkCap) => Some(PeState::GiveSinkCap),
            MessageType::Control(ControlMessageType::GetSourceCap) => {
                if ctx.port.power_role == PowerRole::Source || ctx.config.drp_toggle {
                    Some(PeState::GiveSourceCap)
                } else {
                    Some(PeState::SendNotSupported)
                }
            }
            MessageType::Control(ControlMessageType::GetStatus) => Some(PeState::GiveStatus),
            MessageType::Control(ControlMessageType::GetRevision) => Some(PeState::GiveRevision),
            MessageType::Control(ControlMessageType::DrSwap) => {
                if ctx.port.check_flag(PeFlag::MODAL_OPERATION) {
                    // DR_Swap in modal operation is a Hard Reset per r3.1.
                    Some(PeState::hard_reset(ctx.port.power_role))
                } else {
                    self.send_ctrl(ctx, Sop::Sop, ControlMessageType::Accept);
                    self.complete_dr_swap(ctx);
                    None
                }
            }
            MessageType::Control(ControlMessageType::PrSwap) => Some(PeState::EvaluatePrSwap),
            MessageType::Control(ControlMessageType::VconnSwap) => Some(PeState::EvaluateVconnSwap),
            MessageType::Control(ControlMessageType::DataReset) => Some(PeState::UdrSendAccept),
            MessageType::Control(ControlMessageType::Ping) => None,
            MessageType::Control(ControlMessageType::NotSupported) => None,

            MessageType::Data(DataMessageType::Bist) => self.handle_bist(message, ctx),
            MessageType::Data(DataMessageType::Alert) => {
                if let Some(ado) = message.object(0) {
                    crate::dpm::handle_alert(ctx, crate::message::alert::Ado(ado));
                }
                None
            }
            MessageType::Data(DataMessageType::VendorDefined) => self.handle_inbound_vdm(message, ctx),
            MessageType::Data(DataMessageType::Revision) => {
                if let Some(rmdo) = message.object(0) {
                    ctx.port.partner_rmdo = Some(((rmdo >> 28) as u8 & 0xF, (rmdo >> 24) as u8 & 0xF));
                }
                None
            }

            MessageType::Extended(ExtendedMessageType::GetBatteryCap) => {
                // The responder state reads the battery reference byte.
                ctx.port.rx = Some(message);
                ctx.port.set_flag(PeFlag::MSG_RECEIVED);
                Some(PeState::GiveBatteryCap)
            }
            MessageType::Extended(ExtendedMessageType::GetBatteryStatus) => {
                ctx.port.rx = Some(message);
                ctx.port.set_flag(PeFlag::MSG_RECEIVED);
                Some(PeState::GiveBatteryStatus)
            }

            _ => Some(PeState::SendNotSupported),
        }
    }

    fn handle_bist<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        message: RxMessage,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let bdo = bist::BistDataObject(message.object(0)?);

        // BIST is only honored at vSafe5V.
        if ctx.port.contract.map(|c| c.mv != 5000).unwrap_or(true) {
            return None;
        }

        match bdo.mode() {
            bist::BistMode::CarrierMode2 => Some(PeState::BistTx),
            bist::BistMode::TestData => {
                // Swallow traffic until the next reset.
                None
            }
            bist::BistMode::SharedModeEnter => {
                crate::dpm::bist_shared_mode_enter(ctx);
                None
            }
            bist::BistMode::SharedModeExit => {
                crate::dpm::bist_shared_mode_exit(ctx);
                None
            }
            bist::BistMode::Other(mode) => {
                warn!("C{}: unsupported BIST mode {}", ctx.id(), mode);
                None
            }
        }
    }

    fn run_bist_tx<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<PeState> {
        if ctx.timers.is_expired(TimerId::PeBistContMode, ctx.now) {
            ctx.timers.disable(TimerId::PeBistContMode);
            return Some(PeState::ready(ctx.port.power_role));
        }
        None
    }

    /// Service a pending DPM request while in a Ready state.
    fn ready_service_dpm<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<PeState> {
        // A Wait-deferred PR_Swap comes back through its timer.
        if ctx.timers.is_expired(TimerId::PePrSwapWait, ctx.now) {
            ctx.timers.disable(TimerId::PePrSwapWait);
            ctx.port.post_dpm_request(DpmRequest::PR_SWAP);
        }

        if !self.ams_gate_open(ctx) {
            return None;
        }

        let open_ams = |ctx: &mut Ctx<P, B, C>| {
            ctx.port
                .set_flag(PeFlag::LOCALLY_INITIATED_AMS | PeFlag::DPM_INITIATED);
        };

        if ctx.port.take_dpm_request(DpmRequest::PR_SWAP) {
            // Only one swap is honored at a time; competitors are dropped.
            ctx.port.clear_dpm_request(crate::port::SWAP_REQUESTS);
            open_ams(ctx);
            return Some(PeState::SendPrSwap);
        }
        if ctx.port.take_dpm_request(DpmRequest::DR_SWAP) {
            if ctx.port.check_flag(PeFlag::MODAL_OPERATION) {
                return Some(PeState::hard_reset(ctx.port.power_role));
            }
            open_ams(ctx);
            return Some(PeState::SendDrSwap);
        }
        if ctx.port.take_dpm_request(DpmRequest::VCONN_SWAP) {
            open_ams(ctx);
            return Some(PeState::SendVconnSwap);
        }
        if ctx.port.take_dpm_request(DpmRequest::SRC_CAP_CHANGE) && ctx.port.power_role == PowerRole::Source {
            self.caps_counter.reset();
            return Some(PeState::SrcSendCapabilities);
        }
        if ctx.port.take_dpm_request(DpmRequest::GET_SNK_CAPS) {
            open_ams(ctx);
            return Some(PeState::GetSinkCap);
        }
        if ctx.port.take_dpm_request(DpmRequest::GET_SRC_CAPS) {
            open_ams(ctx);
            return Some(PeState::GetSourceCap);
        }
        if ctx.port.take_dpm_request(DpmRequest::GET_STATUS) {
            open_ams(ctx);
            return Some(PeState::GetStatus);
        }
        if ctx.port.take_dpm_request(DpmRequest::SEND_ALERT) {
            open_ams(ctx);
            return Some(PeState::SendAlert);
        }
        if ctx.port.take_dpm_request(DpmRequest::DATA_RESET) {
            if ctx.port.data_role == DataRole::Dfp {
                open_ams(ctx);
                return Some(PeState::DdrSendDataReset);
            }
            return None;
        }
        if ctx.port.take_dpm_request(DpmRequest::ENTER_USB) {
            open_ams(ctx);
            return Some(PeState::EnterUsb);
        }
        if ctx.port.check_dpm_request(DpmRequest::VDM) && self.vdm.is_some() {
            ctx.port.clear_dpm_request(DpmRequest::VDM);
            open_ams(ctx);
            return Some(PeState::VdmRequest);
        }
        if ctx.port.take_dpm_request(DpmRequest::EPR_MODE_ENTRY)
            && ctx.port.power_role == PowerRole::Sink
            && cfg!(feature = "epr")
        {
            open_ams(ctx);
            return Some(PeState::EprModeEntry);
        }
        if ctx.port.take_dpm_request(DpmRequest::EPR_MODE_EXIT) && ctx.port.check_flag(PeFlag::IN_EPR) {
            open_ams(ctx);
            return Some(PeState::EprModeExit);
        }
        if ctx.port.take_dpm_request(DpmRequest::FRS_DET_ENABLE) {
            ctx.board.frs_detection_enable(ctx.port.id, true);
            return None;
        }
        if ctx.port.take_dpm_request(DpmRequest::FRS_DET_DISABLE) {
            ctx.board.frs_detection_enable(ctx.port.id, false);
            return None;
        }

        None
    }

    // --- Soft reset --------------------------------------------------

    fn run_send_soft_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        sop: Sop,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // Failure anywhere during soft reset escalates to Hard Reset.
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(PeState::hard_reset(ctx.port.power_role));
        }

        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::Discarded | MsgCheck::DpmDiscarded => {
                return Some(PeState::ready(ctx.port.power_role));
            }
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
        }

        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::Accept) {
                return Some(self.post_soft_reset_state(ctx, sop));
            }
            return Some(PeState::hard_reset(ctx.port.power_role));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::hard_reset(ctx.port.power_role));
        }

        None
    }

    fn run_soft_reset_received<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(PeState::hard_reset(ctx.port.power_role));
        }

        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            return Some(self.post_soft_reset_state(ctx, Sop::Sop));
        }

        None
    }

    /// Where a completed soft reset lands, by role.
    fn post_soft_reset_state<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
    ) -> PeState {
        if sop != Sop::Sop {
            // Cable soft reset; resume normal operation.
            return PeState::ready(ctx.port.power_role);
        }

        match ctx.port.power_role {
            PowerRole::Source => {
                self.caps_counter.reset();
                PeState::SrcSendCapabilities
            }
            PowerRole::Sink => PeState::SnkWaitForCapabilities,
        }
    }

    // --- Shared helpers used across the submodules -------------------

    /// Send the currently advertised source PDO set.
    pub(crate) fn send_source_caps<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let pdos = crate::dpm::source_pdos(ctx.shared, ctx.config, ctx.port.id);
        self.send_data(ctx, Sop::Sop, DataMessageType::SourceCapabilities, &pdos);
    }

    /// The currently advertised source PDO at a 1-indexed position.
    pub(crate) fn advertised_pdo<P: ProtocolLayer, B: Board, C: Chipset>(
        &self,
        ctx: &Ctx<P, B, C>,
        position: u8,
    ) -> Option<pdo::PowerDataObject> {
        let pdos = crate::dpm::source_pdos(ctx.shared, ctx.config, ctx.port.id);
        pdos.get((position as usize).checked_sub(1)?)
            .map(|raw| pdo::parse_raw_pdo(*raw))
    }

    /// Flip the data role after an accepted DR_Swap.
    pub(crate) fn complete_dr_swap<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let new_role = ctx.port.data_role.flipped();
        info!("C{}: data role -> {:?}", ctx.id(), new_role);
        ctx.port.data_role = new_role;

        let polarity_flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
        ctx.board.mux_set(ctx.port.id, usbpd_drp_traits::MuxMode::Usb, polarity_flipped);
    }

    /// Establish the explicit contract from an accepted request.
    pub(crate) fn latch_contract<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
        pdo_index: u8,
        mv: u32,
        ma: u32,
    ) {
        ctx.port.set_contract(Contract { pdo_index, mv, ma });
    }

    /// Exit every active alternate mode unconditionally.
    ///
    /// The mode modules live on the DPM side; a teardown marker makes it
    /// drop their state (and any muxed mode) on its next run.
    pub(crate) fn exit_all_modes<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        if ctx.port.take_flag(PeFlag::MODAL_OPERATION) {
            debug!("C{}: exiting all alternate modes", ctx.id());
        }
        self.alt_mode_teardown = true;
    }

    /// The sink standby ceiling while a new supply level settles: 2.5 W
    /// at the larger of the old and new voltage.
    fn apply_sink_standby<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let new_mv = self
            .snk_request
            .and_then(|request| self.requested_mv(ctx, &request))
            .unwrap_or(5000);
        let old_mv = ctx.port.contract.map(|c| c.mv).unwrap_or(5000);
        let mv = new_mv.max(old_mv).max(1);

        let standby_ma = 2_500_000 / mv;
        ctx.board.set_input_current_limit(ctx.port.id, standby_ma, mv);
    }

    /// The voltage a request selects, from the cached source caps.
    pub(crate) fn requested_mv<P: ProtocolLayer, B: Board, C: Chipset>(
        &self,
        ctx: &Ctx<P, B, C>,
        request: &request::PowerSource,
    ) -> Option<u32> {
        use uom::si::electric_potential::millivolt;

        let caps = match &ctx.port.src_caps {
            CapsRecord::Known(caps) => caps,
            _ => return None,
        };

        match caps.at_position(request.object_position())? {
            pdo::PowerDataObject::FixedSupply(supply) => Some(supply.voltage().get::<millivolt>()),
            pdo::PowerDataObject::VariableSupply(supply) => Some(supply.max_voltage().get::<millivolt>()),
            pdo::PowerDataObject::Augmented(pdo::Augmented::Spr(_)) => match request {
                request::PowerSource::Pps(pps) => Some(pps.output_voltage().get::<millivolt>()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Build the raw PDO list advertised to the partner as sink caps.
    pub(crate) fn sink_pdos<P: ProtocolLayer, B: Board, C: Chipset>(&self, ctx: &Ctx<P, B, C>) -> Vec<u32, 7> {
        ctx.config.snk_pdos.clone()
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}
