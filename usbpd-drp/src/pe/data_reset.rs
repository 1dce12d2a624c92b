//! The r3.1 Data Reset sequence, both the DFP and UFP chains, plus the
//! Enter_USB exchange.
//!
//! A watchdog runs across each whole chain; expiry or an unexpected
//! inbound forces ErrorRecovery rather than a Hard Reset.
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, MuxMode, ProtocolLayer, Sop};

use super::{MsgCheck, PeState, PolicyEngine};
use crate::engine::Ctx;
use crate::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::port::{DpmRequest, PeFlag};
use crate::timer::TimerId;
use crate::times;

/// A prepared Enter_USB exchange: the data object and the SOP sequence
/// still to cover.
#[derive(Debug, Clone)]
pub(crate) struct EnterUsbPlan {
    /// The Enter_USB data object.
    pub eudo: u32,
    /// Remaining targets, in transmit order.
    pub sops: Vec<Sop, 3>,
}

impl PolicyEngine {
    fn data_reset_failed<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> PeState {
        error!("C{}: data reset failed, entering error recovery", ctx.id());
        self.data_reset_outcome = Some(false);
        ctx.timers.disable(TimerId::PeDataResetFail);
        ctx.timers.disable(TimerId::PeVconnDischarge);
        ctx.timers.disable(TimerId::PeVconnReapplied);
        ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
        PeState::ready(ctx.port.power_role)
    }

    // --- DFP chain ---------------------------------------------------

    pub(super) fn enter_ddr_send_data_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        self.arm_sender_response(ctx);
        self.data_reset_vconn_cycled = false;
        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::DataReset);
        None
    }

    pub(super) fn run_ddr_send_data_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(self.data_reset_failed(ctx));
        }

        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded => return Some(PeState::ready(ctx.port.power_role)),
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::DATA_RESET);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            return match message.message_type() {
                MessageType::Control(ControlMessageType::Accept) => {
                    // The watchdog covers the rest of the sequence.
                    ctx.timers
                        .enable(TimerId::PeDataResetFail, ctx.now, times::T_DATA_RESET_FAIL_US);
                    Some(PeState::DdrWaitForVconnOff)
                }
                MessageType::Control(ControlMessageType::Reject)
                | MessageType::Control(ControlMessageType::NotSupported) => {
                    self.data_reset_outcome = Some(false);
                    Some(PeState::ready(ctx.port.power_role))
                }
                _ => Some(self.data_reset_failed(ctx)),
            };
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            self.data_reset_outcome = Some(false);
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }

    pub(super) fn enter_ddr_wait_for_vconn_off<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if !ctx.port.check_flag(PeFlag::VCONN_ON) {
            // The UFP owns VCONN; it signals the drop with PS_RDY.
            ctx.timers
                .enable(TimerId::PeVconnDischarge, ctx.now, times::T_VCONN_DISCHARGE_US);
            return None;
        }
        Some(PeState::DdrPerformDataReset)
    }

    pub(super) fn run_ddr_wait_for_vconn_off<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) || ctx.timers.is_expired(TimerId::PeDataResetFail, ctx.now) {
            return Some(self.data_reset_failed(ctx));
        }

        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::PsRdy) {
                ctx.timers.disable(TimerId::PeVconnDischarge);
                return Some(PeState::DdrPerformDataReset);
            }
            return Some(self.data_reset_failed(ctx));
        }

        if ctx.timers.is_expired(TimerId::PeVconnDischarge, ctx.now) {
            ctx.timers.disable(TimerId::PeVconnDischarge);
            return Some(PeState::DdrPerformDataReset);
        }

        None
    }

    pub(super) fn enter_ddr_perform_data_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // USB2/3 drop off the connector and every mode dies.
        ctx.board.mux_set(ctx.port.id, MuxMode::None, false);
        self.exit_all_modes(ctx);

        // Power-cycle VCONN.
        if ctx.port.take_flag(PeFlag::VCONN_ON) {
            let _ = ctx.board.set_vconn(ctx.port.id, false);
        }
        ctx.timers
            .enable(TimerId::PeVconnReapplied, ctx.now, times::T_VCONN_REAPPLIED_US);
        None
    }

    pub(super) fn run_ddr_perform_data_reset<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) || ctx.timers.is_expired(TimerId::PeDataResetFail, ctx.now) {
            return Some(self.data_reset_failed(ctx));
        }

        if !self.data_reset_vconn_cycled {
            if !ctx.timers.is_expired(TimerId::PeVconnReapplied, ctx.now) {
                return None;
            }
            ctx.timers.disable(TimerId::PeVconnReapplied);
            self.data_reset_vconn_cycled = true;

            if ctx.board.set_vconn(ctx.port.id, true).is_ok() {
                ctx.port.set_flag(PeFlag::VCONN_ON);
            }

            // Back to plain USB under the current data role.
            let polarity_flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
            ctx.board.mux_set(ctx.port.id, MuxMode::Usb, polarity_flipped);

            self.send_ctrl(ctx, Sop::Sop, ControlMessageType::DataResetComplete);
            return None;
        }

        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            ctx.timers.disable(TimerId::PeDataResetFail);
            self.data_reset_outcome = Some(true);
            return Some(PeState::ready(ctx.port.power_role));
        }
        if ctx.port.take_flag(PeFlag::MSG_DISCARDED) {
            return Some(self.data_reset_failed(ctx));
        }

        None
    }

    // --- UFP chain ---------------------------------------------------

    pub(super) fn run_udr_send_accept<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) {
            return Some(self.data_reset_failed(ctx));
        }

        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            ctx.timers
                .enable(TimerId::PeDataResetFail, ctx.now, times::T_DATA_RESET_FAIL_UFP_US);
            return Some(if ctx.port.check_flag(PeFlag::VCONN_ON) {
                PeState::UdrTurnOffVconn
            } else {
                PeState::UdrWaitForDataResetComplete
            });
        }

        None
    }

    pub(super) fn enter_udr_turn_off_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let _ = ctx.board.set_vconn(ctx.port.id, false);
        ctx.port.clear_flag(PeFlag::VCONN_ON);
        self.send_ctrl(ctx, Sop::Sop, ControlMessageType::PsRdy);
        None
    }

    pub(super) fn run_udr_turn_off_vconn<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) || ctx.timers.is_expired(TimerId::PeDataResetFail, ctx.now) {
            return Some(self.data_reset_failed(ctx));
        }

        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            return Some(PeState::UdrWaitForDataResetComplete);
        }

        None
    }

    pub(super) fn run_udr_wait_for_complete<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::PROTOCOL_ERROR) || ctx.timers.is_expired(TimerId::PeDataResetFail, ctx.now) {
            return Some(self.data_reset_failed(ctx));
        }

        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::DataResetComplete) {
                ctx.timers.disable(TimerId::PeDataResetFail);
                self.exit_all_modes(ctx);

                let polarity_flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
                ctx.board.mux_set(ctx.port.id, MuxMode::Usb, polarity_flipped);

                self.data_reset_outcome = Some(true);
                return Some(PeState::ready(ctx.port.power_role));
            }
            return Some(self.data_reset_failed(ctx));
        }

        None
    }

    // --- Enter_USB ---------------------------------------------------

    pub(super) fn enter_enter_usb<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let Some(plan) = self.enter_usb.as_mut() else {
            return Some(PeState::ready(ctx.port.power_role));
        };
        let Some(sop) = plan.sops.first().copied() else {
            self.enter_usb = None;
            return Some(PeState::ready(ctx.port.power_role));
        };
        let eudo = plan.eudo;

        self.arm_sender_response(ctx);
        self.send_data(ctx, sop, DataMessageType::EnterUsb, &[eudo]);
        None
    }

    pub(super) fn run_enter_usb<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded => {
                self.enter_usb = None;
                self.enter_usb_outcome = Some(false);
                return Some(PeState::ready(ctx.port.power_role));
            }
            MsgCheck::DpmDiscarded => {
                ctx.port.post_dpm_request(DpmRequest::ENTER_USB);
                return Some(PeState::ready(ctx.port.power_role));
            }
        }

        if let Some(message) = self.take_message(ctx) {
            if message.message_type() == MessageType::Control(ControlMessageType::Accept) {
                let done = {
                    let plan = self.enter_usb.as_mut().unwrap();
                    plan.sops.remove(0);
                    plan.sops.is_empty()
                };

                if done {
                    self.enter_usb = None;
                    self.enter_usb_outcome = Some(true);
                    return Some(PeState::ready(ctx.port.power_role));
                }
                // Next SOP in the sequence.
                return Some(PeState::EnterUsb);
            }

            self.enter_usb = None;
            self.enter_usb_outcome = Some(false);
            return Some(PeState::SendSoftReset(Sop::Sop));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            self.enter_usb = None;
            self.enter_usb_outcome = Some(false);
            return Some(PeState::ready(ctx.port.power_role));
        }

        None
    }
}
