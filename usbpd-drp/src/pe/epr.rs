//! Extended Power Range entry, keep-alive and exit, on the sink side.
//!
//! Entry is the four-step exchange on SOP: Enter, Enter_Ack from the
//! source, then Enter_Success (or Enter_Failed) while the source probes
//! the cable. Presence is maintained with EPR_KeepAlive afterwards.
use byteorder::{ByteOrder, LittleEndian};
use usbpd_drp_traits::{Board, Chipset, ProtocolLayer, Sop};

use super::{MsgCheck, PeState, PolicyEngine};
use crate::engine::Ctx;
use crate::message::epr::{Action, EprModeDataObject, ExtendedControlType};
use crate::message::header::{DataMessageType, ExtendedMessageType};
use crate::message::pdo::Capabilities;
use crate::message::{RxMessage, request};
use crate::port::{CapsRecord, PeFlag};
use crate::timer::TimerId;
use crate::times;

impl PolicyEngine {
    pub(super) fn enter_epr_mode_entry<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // Entry preconditions were checked by the DPM: an explicit SPR
        // contract, an EPR-capable partner, no VPD in the cable.
        if !ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
            return Some(PeState::ready(ctx.port.power_role));
        }

        self.arm_sender_response(ctx);
        let mdo = EprModeDataObject::new(Action::Enter, self.epr_entry_pdp);
        self.send_data(ctx, Sop::Sop, DataMessageType::EprMode, &[mdo.0]);
        None
    }

    pub(super) fn run_epr_mode_entry<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded | MsgCheck::DpmDiscarded => return Some(PeState::SnkReady),
        }

        if let Some(message) = self.take_message(ctx) {
            let Some(action) = epr_action(&message) else {
                return Some(PeState::SendSoftReset(Sop::Sop));
            };

            return match action {
                Action::EnterAcknowledged => Some(PeState::EprEntryWaitForResponse),
                Action::EnterSucceeded => {
                    self.epr_entered(ctx);
                    Some(PeState::SnkWaitForCapabilities)
                }
                Action::EnterFailed => {
                    debug!("C{}: EPR entry failed, cause {}", ctx.id(), epr_data(&message));
                    Some(PeState::SendSoftReset(Sop::Sop))
                }
                Action::Exit => Some(PeState::SnkWaitForCapabilities),
                Action::Enter => Some(PeState::SendSoftReset(Sop::Sop)),
            };
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::SnkHardReset);
        }

        None
    }

    pub(super) fn run_epr_entry_wait<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if let Some(message) = self.take_message(ctx) {
            let Some(action) = epr_action(&message) else {
                return Some(PeState::SendSoftReset(Sop::Sop));
            };

            return match action {
                Action::EnterSucceeded => {
                    ctx.timers.disable(TimerId::PeSinkEprEnter);
                    self.epr_entered(ctx);
                    Some(PeState::SnkWaitForCapabilities)
                }
                Action::EnterFailed => {
                    ctx.timers.disable(TimerId::PeSinkEprEnter);
                    Some(PeState::SendSoftReset(Sop::Sop))
                }
                Action::Exit => {
                    ctx.timers.disable(TimerId::PeSinkEprEnter);
                    Some(PeState::SnkWaitForCapabilities)
                }
                _ => Some(PeState::SendSoftReset(Sop::Sop)),
            };
        }

        if ctx.timers.is_expired(TimerId::PeSinkEprEnter, ctx.now) {
            ctx.timers.disable(TimerId::PeSinkEprEnter);
            return Some(PeState::SnkHardReset);
        }

        None
    }

    fn epr_entered<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        info!("C{}: entered EPR mode", ctx.id());
        ctx.port.set_flag(PeFlag::IN_EPR);
        ctx.timers
            .enable(TimerId::PeSinkEprKeepAlive, ctx.now, times::T_SINK_EPR_KEEP_ALIVE_US);
    }

    pub(super) fn enter_epr_keep_alive<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        self.arm_sender_response(ctx);
        self.send_ext(
            ctx,
            Sop::Sop,
            ExtendedMessageType::ExtendedControl,
            &[ExtendedControlType::EprKeepAlive.into(), 0],
        );
        None
    }

    pub(super) fn run_epr_keep_alive<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match self.msg_check(ctx) {
            MsgCheck::SendPending => return None,
            MsgCheck::SendCompleted | MsgCheck::Sent => (),
            MsgCheck::Discarded | MsgCheck::DpmDiscarded => return Some(PeState::SnkReady),
        }

        if let Some(message) = self.take_message(ctx) {
            let acked = message.is_extended(ExtendedMessageType::ExtendedControl)
                && message.ext_payload().first().copied().map(ExtendedControlType::from)
                    == Some(ExtendedControlType::EprKeepAliveAck);

            if acked {
                ctx.timers
                    .enable(TimerId::PeSinkEprKeepAlive, ctx.now, times::T_SINK_EPR_KEEP_ALIVE_US);
                return Some(PeState::SnkReady);
            }
            return Some(PeState::SendSoftReset(Sop::Sop));
        }

        if ctx.timers.is_expired(TimerId::PeSenderResponse, ctx.now) {
            return Some(PeState::SnkHardReset);
        }

        None
    }

    pub(super) fn enter_epr_mode_exit<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        // An EPR contract must first step down to an SPR PDO; the exit
        // request comes back around once the new contract is in place.
        let in_epr_contract = ctx.port.contract.map(|c| c.pdo_index > 7).unwrap_or(false);
        if in_epr_contract {
            if let CapsRecord::Known(caps) = &ctx.port.src_caps {
                if let Ok(request) = request::PowerSource::new_fixed(
                    request::CurrentRequest::Highest,
                    request::VoltageRequest::Safe5V,
                    caps,
                ) {
                    self.snk_request = Some(request);
                    ctx.port.post_dpm_request(crate::port::DpmRequest::EPR_MODE_EXIT);
                    return Some(PeState::SnkSelectCapability);
                }
            }
            return Some(PeState::SnkHardReset);
        }

        let mdo = EprModeDataObject::new(Action::Exit, 0);
        self.send_data(ctx, Sop::Sop, DataMessageType::EprMode, &[mdo.0]);
        None
    }

    pub(super) fn run_epr_mode_exit<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        if ctx.port.take_flag(PeFlag::TX_COMPLETE) {
            ctx.port.clear_flag(PeFlag::IN_EPR);
            ctx.timers.disable(TimerId::PeSinkEprKeepAlive);
            return Some(PeState::SnkWaitForCapabilities);
        }
        if ctx.port.take_flag(PeFlag::MSG_DISCARDED) {
            return Some(PeState::SnkReady);
        }
        None
    }

    // --- EPR messages arriving in Ready ------------------------------

    pub(super) fn handle_epr_mode_in_ready<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        message: RxMessage,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        match epr_action(&message) {
            Some(Action::Exit) => {
                ctx.port.clear_flag(PeFlag::IN_EPR);
                ctx.timers.disable(TimerId::PeSinkEprKeepAlive);

                // Without an SPR contract to fall back to, only a Hard
                // Reset recovers a defined power level.
                let epr_contract = ctx.port.contract.map(|c| c.pdo_index > 7).unwrap_or(true);
                Some(if epr_contract {
                    PeState::SnkHardReset
                } else {
                    PeState::SnkWaitForCapabilities
                })
            }
            _ => Some(PeState::SendSoftReset(Sop::Sop)),
        }
    }

    pub(super) fn handle_epr_source_caps<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        message: RxMessage,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let objects: heapless::Vec<u32, { crate::message::pdo::MAX_EPR_PDOS }> = message
            .ext_payload()
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .collect();

        let caps = Capabilities::from_objects(&objects);

        // EPR PDOs leaking into SPR positions violate the contract.
        if ctx.port.check_flag(PeFlag::IN_EPR) && caps.has_epr_pdo_in_spr_positions() {
            return Some(PeState::SnkHardReset);
        }

        ctx.port.src_caps = CapsRecord::Known(caps);
        Some(PeState::SnkEvaluateCapability)
    }

    pub(super) fn handle_extended_control<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        message: RxMessage,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<PeState> {
        let control = message.ext_payload().first().copied().map(ExtendedControlType::from);

        match control {
            Some(ExtendedControlType::EprGetSinkCap) => {
                let pdos = self.sink_pdos(ctx);
                let mut buf = [0u8; 28];
                for (index, pdo) in pdos.iter().enumerate() {
                    LittleEndian::write_u32(&mut buf[index * 4..index * 4 + 4], *pdo);
                }
                self.send_ext(
                    ctx,
                    Sop::Sop,
                    ExtendedMessageType::EprSinkCapabilities,
                    &buf[..pdos.len() * 4],
                );
                None
            }
            Some(ExtendedControlType::EprKeepAliveAck) => None,
            _ => Some(PeState::SendNotSupported),
        }
    }
}

fn epr_action(message: &RxMessage) -> Option<Action> {
    message.object(0).map(EprModeDataObject).and_then(|mdo| mdo.action())
}

fn epr_data(message: &RxMessage) -> u8 {
    message.object(0).map(EprModeDataObject).map(|mdo| mdo.data()).unwrap_or(0)
}
