//! Power-role, data-role and VCONN swaps, including the fast-role-swap
//! arm of the power-role chain.
//!
//! The FRS arm differs from plain PR_Swap only in who drives the
//! post-accept vBus sequencing: FRS hardware has already moved vBus, so
//! the charger is never asked to stop sinking, and any protocol error
//! forces ErrorRecovery instead of a Hard Reset.
use usbpd_drp_traits::{Board, CcPull, Chipset, PdRev, ProtocolLayer, Sop, VbusLevel};

use super::{MsgCheck, PeState, PolicyEngine};
use crate::engine::Ctx;
use crate::message::header::{ControlMessageType, MessageType};
use crate::port::{DpmRequest, PeFlag};
use crate::timer::TimerId;
use crate::times;
use crate::PowerRole;

impl PolicyEngine {
    /// The escape path for a failed power-role transition.
    fn prs_failure<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> PeState {
        if ctx.port.check_flag(PeFlag::FAST_ROLE_SWAP_PATH) {
            ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
            PeState::ready(ctx.port.power_role)
        } else {
            PeState::hard_reset(ctx.port.power_role)
        }
    }

    // --- PR_Swap, requester side -------------------------------------

    pub(super) fn run_send_pr_swap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded => return Some(PeState::ready(ctx.port.power_role)),
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::PR_SWAP);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            return match message.message_type() {
                MessageType::Control(ControlMessageType::Accept) => {
                    self.pr_swap_wait_counter.reset();
                    Some(self.start_pr_swap_transition(ctx))
                }
                MessageType::Control(ControlMessageType::Wait) => {
                    // Back off and retry, bounded by the wait counter.
                    if self.pr_swap_wait_counter.increment().is_ok() {
                        ctx.timers
                            .enable(TimerId::PePrSwapWait, ctx.now, times::T_PR_SWAP_WAIT_US);
                    }
                    Some(PeState::ready(ctx.port.power_role))
                }
                MessageType::Control(ControlMessageType::Reject)
                | MessageType::Control(ControlMessageType::NotSupported) => {
                    Some(PeState::ready(ctx.port.power_role))
                }
                _ => Some(PeState::SendSoftReset(Sop::Sop)),
            };
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    // --- PR_Swap, responder side -------------------------------------

    pub(super) fn enter_evaluate_pr_swap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if !ctx.config.drp_toggle {
            self.send_ctrl(ctx, Sop::Sop, ControlMessageType::Reject);
            return Some(PeState::ready(ctx.port.power_role));
        }

        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::Accept);
        None
    }

    pub(super) fn run_evaluate_pr_swap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // The supply only moves once our Accept made it onto the wire.
        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            return Some(self.start_pr_swap_transition(ctx));
        }
        if ctx.port.take_flag(PeFlag::MSG_DISCARDED) || ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(PeState::ready(ctx.port.power_role));
        }
        None
    }

    /// Both sides agreed; choose the transition arm by present role.
    fn start_pr_swap_transition<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> PeState {
        ctx.port.set_flag(PeFlag::PR_SWAP_IN_PROGRESS);
        ctx.port.invalidate_contract();

        match ctx.port.power_role {
            PowerRole::Source => PeState::PrsSrcSnkTransitionToOff,
            PowerRole::Sink => PeState::PrsSnkSrcTransitionToOff,
        }
    }

    // --- Source-to-sink arm ------------------------------------------

    pub(super) fn enter_prs_src_snk_transition_to_off<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // Only drop the supply once our Accept (or theirs) is on the
        // wire; the GoodCRC was consumed by the caller.
        ctx.board.power_supply_reset(ctx.port.id);
        ctx.timers.enable(TimerId::PeTimeout, ctx.now, times::T_SAFE_0V_US);
        None
    }

    pub(super) fn run_prs_src_snk_transition_to_off<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(self.prs_failure(ctx));
        }

        if ctx.board.vbus_at_level(ctx.port.id, VbusLevel::Safe0V)
            || ctx.timers.is_expired(TimerId::PeTimeout, ctx.now)
        {
            ctx.timers.disable(TimerId::PeTimeout);
            return Some(PeState::PrsSrcSnkAssertRd);
        }

        None
    }

    pub(super) fn enter_prs_src_snk_assert_rd<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        ctx.port.power_role = PowerRole::Sink;
        ctx.board.set_cc(ctx.port.id, CcPull::Rd, ctx.config.default_rp);
        ctx.prl.set_roles(ctx.port.id, false, ctx.port.data_role.into());
        Some(PeState::PrsSrcSnkWaitSourceOn)
    }

    pub(super) fn enter_prs_src_snk_wait_source_on<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::PsRdy);
        ctx.timers
            .enable(TimerId::PePsSource, ctx.now, times::T_PS_SOURCE_ON_US);
        None
    }

    pub(super) fn run_prs_src_snk_wait_source_on<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(self.prs_failure(ctx));
        }

        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::PsRdy) {
                ctx.timers.disable(TimerId::PePsSource);
                // The partner now sources; restart as a fresh sink.
                return Some(PeState::SnkStartup);
            }
            return Some(self.prs_failure(ctx));
        }

        if ctx.timers.is_expired(TimerId::PePsSource, ctx.now) {
            ctx.timers.disable(TimerId::PePsSource);
            ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    // --- Fast role swap entry ----------------------------------------

    pub(super) fn enter_frs_start_ams<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        info!("C{}: fast role swap signaled", ctx.id());
        ctx.port.set_flag(PeFlag::PR_SWAP_IN_PROGRESS);
        ctx.port.invalidate_contract();
        self.arm_sender_response(ctx);
        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::FrSwap);
        None
    }

    pub(super) fn run_frs_start_ams<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(self.prs_failure(ctx));
        }

        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded | MsgCheck::DpmDiscarded => return Some(self.prs_failure(ctx)),
        }

        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::Accept) {
                return Some(PeState::PrsSnkSrcTransitionToOff);
            }
            return Some(self.prs_failure(ctx));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(self.prs_failure(ctx));
        }

        None
    }

    // --- Sink-to-source arm (shared with FRS) ------------------------

    pub(super) fn enter_prs_snk_src_transition_to_off<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // On the FRS path the hardware already moved vBus toward 5 V;
        // asking the charger to stop sinking would fight it.
        if !ctx.port.check_flag(PeFlag::FAST_ROLE_SWAP_PATH) {
            ctx.board.set_input_current_limit(ctx.port.id, 0, 0);
        }

        ctx.timers
            .enable(TimerId::PePsSource, ctx.now, times::T_PS_SOURCE_OFF_US);
        None
    }

    pub(super) fn run_prs_snk_src_transition_to_off<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(self.prs_failure(ctx));
        }

        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::PsRdy) {
                ctx.timers.disable(TimerId::PePsSource);
                return Some(PeState::PrsSnkSrcAssertRp);
            }
            return Some(self.prs_failure(ctx));
        }

        if ctx.timers.is_expired(TimerId::PePsSource, ctx.now) {
            ctx.timers.disable(TimerId::PePsSource);
            return Some(self.prs_failure(ctx));
        }

        None
    }

    pub(super) fn enter_prs_snk_src_assert_rp<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        ctx.port.power_role = PowerRole::Source;
        let rp = ctx.shared.selected_rp(ctx.port.id);
        ctx.board.set_cc(ctx.port.id, CcPull::Rp, rp);
        ctx.prl.set_roles(ctx.port.id, true, ctx.port.data_role.into());
        Some(PeState::PrsSnkSrcSourceOn)
    }

    pub(super) fn enter_prs_snk_src_source_on<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.board.power_supply_ready(ctx.port.id).is_err() {
            return Some(self.prs_failure(ctx));
        }
        ctx.timers.enable(TimerId::PeTimeout, ctx.now, times::T_SRC_TURN_ON_US);
        None
    }

    pub(super) fn run_prs_snk_src_source_on<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(self.prs_failure(ctx));
        }

        if !ctx.timers.is_disabled(TimerId::PeTimeout) {
            if ctx.vbus_present() {
                ctx.timers.disable(TimerId::PeTimeout);
                self.send_ctrl(ctx, Sop::Sop, ControlMessageType::PsRdy);
            } else if ctx.timers.is_expired(TimerId::PeTimeout, ctx.now) {
                ctx.timers.disable(TimerId::PeTimeout);
                return Some(self.prs_failure(ctx));
            }
            return None;
        }

        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            // Swap done; SrcStartup consumes PR_SWAP_IN_PROGRESS for its
            // swap-source-start delay.
            return Some(PeState::SrcStartup);
        }
        if ctx.port.take_flag(PeFlag::MSG_DISCARDED) {
            return Some(self.prs_failure(ctx));
        }

        None
    }

    // --- DR_Swap -----------------------------------------------------

    pub(super) fn run_send_dr_swap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded => return Some(PeState::ready(ctx.port.power_role)),
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::DR_SWAP);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            return match message.message_type() {
                MessageType::Control(ControlMessageType::Accept) => {
                    self.complete_dr_swap(ctx);
                    Some(PeState::ready(ctx.port.power_role))
                }
                MessageType::Control(ControlMessageType::Reject)
                | MessageType::Control(ControlMessageType::Wait)
                | MessageType::Control(ControlMessageType::NotSupported) => {
                    Some(PeState::ready(ctx.port.power_role))
                }
                _ => Some(PeState::SendSoftReset(Sop::Sop)),
            };
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    // --- VCONN_Swap --------------------------------------------------

    pub(super) fn enter_evaluate_vconn_swap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::Accept);

        // The side about to source VCONN moves first.
        Some(if ctx.port.check_flag(PeFlag::VCONN_ON) {
            PeState::VcsWaitForVconn
        } else {
            PeState::VcsTurnOnVconn
        })
    }

    pub(super) fn run_send_vconn_swap<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded => return Some(PeState::ready(ctx.port.power_role)),
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::VCONN_SWAP);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            return match message.message_type() {
                MessageType::Control(ControlMessageType::Accept) => Some(if ctx.port.check_flag(PeFlag::VCONN_ON) {
                    PeState::VcsWaitForVconn
                } else {
                    PeState::VcsTurnOnVconn
                }),
                MessageType::Control(ControlMessageType::NotSupported) => {
                    // A r3.x partner that cannot swap leaves us to force
                    // the VCONN source role if we need cable access.
                    if !ctx.port.check_flag(PeFlag::VCONN_ON) && ctx.rev(Sop::Sop) != PdRev::R2_0 {
                        Some(PeState::VcsForceVconn)
                    } else {
                        Some(PeState::ready(ctx.port.power_role))
                    }
                }
                MessageType::Control(ControlMessageType::Reject) | MessageType::Control(ControlMessageType::Wait) => {
                    Some(PeState::ready(ctx.port.power_role))
                }
                _ => Some(PeState::SendSoftReset(Sop::Sop)),
            };
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    pub(super) fn run_vcs_wait_for_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::PsRdy) {
                ctx.timers.disable(TimerId::PeVconnOn);
                return Some(PeState::VcsTurnOffVconn);
            }
            return Some(PeState::SendSoftReset(Sop::Sop));
        }

        if ctx.timers.is_expired(TimerId::PeVconnOn, ctx.now) {
            ctx.timers.disable(TimerId::PeVconnOn);
            return Some(PeState::hard_reset(ctx.port.power_role));
        }

        None
    }

    pub(super) fn enter_vcs_turn_on_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.board.set_vconn(ctx.port.id, true).is_err() {
            return Some(PeState::hard_reset(ctx.port.power_role));
        }
        ctx.port.set_flag(PeFlag::VCONN_ON);
        ctx.timers
            .enable(TimerId::PeVconnOn, ctx.now, times::VCONN_SWAP_DELAY_US);
        None
    }

    pub(super) fn run_vcs_turn_on_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.timers.is_expired(TimerId::PeVconnOn, ctx.now) {
            ctx.timers.disable(TimerId::PeVconnOn);
            return Some(PeState::VcsSendPsRdy);
        }
        None
    }

    pub(super) fn enter_vcs_turn_off_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        ctx.timers
            .enable(TimerId::PeVconnOn, ctx.now, times::VCONN_SWAP_DELAY_US);
        None
    }

    pub(super) fn run_vcs_turn_off_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if !ctx.timers.is_expired(TimerId::PeVconnOn, ctx.now) {
            return None;
        }
        ctx.timers.disable(TimerId::PeVconnOn);

        let _ = ctx.board.set_vconn(ctx.port.id, false);
        ctx.port.clear_flag(PeFlag::VCONN_ON);

        // Cable discovery restarts under the new VCONN owner.
        self.discover_identity_counter.reset();
        ctx.port.discovery[Sop::SopPrime.index()].identity_state = Default::default();

        Some(PeState::ready(ctx.port.power_role))
    }

    pub(super) fn enter_vcs_force_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.board.set_vconn(ctx.port.id, true).is_ok() {
            ctx.port.set_flag(PeFlag::VCONN_ON);
        }
        Some(PeState::ready(ctx.port.power_role))
    }
}
