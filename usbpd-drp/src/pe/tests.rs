//! Tests for the policy engine.
use usbpd_drp_traits::{PdRev, ProtocolLayer, Sop};

use super::{PeState, PolicyEngine};
use crate::dummy::{Bench, Sent, caps_5v3a, partner_ctrl, partner_data};
use crate::message::header::{ControlMessageType, DataMessageType};
use crate::port::{DpmRequest, PeFlag};
use crate::timer::TimerId;
use crate::times;
use crate::PowerRole;

fn sink_bench() -> (PolicyEngine, Bench) {
    let mut bench = Bench::new();
    bench.port.power_role = PowerRole::Sink;
    bench.prl.start(0, PdRev::R3_1);
    (PolicyEngine::new(), bench)
}

/// Walk a fresh sink engine into SnkWaitForCapabilities.
fn run_to_wait_for_caps(pe: &mut PolicyEngine, bench: &mut Bench, now: u64) {
    bench.board.vbus_present = true;
    for _ in 0..4 {
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
    }
    assert_eq!(pe.state(), Some(PeState::SnkWaitForCapabilities));
}

/// Drive the full contract negotiation against a 5 V / 3 A source.
fn negotiate_contract(pe: &mut PolicyEngine, bench: &mut Bench, mut now: u64) -> u64 {
    run_to_wait_for_caps(pe, bench, now);

    bench.receive_message(partner_data(DataMessageType::SourceCapabilities, &[caps_5v3a()], 0, true));
    now += 1_000;
    let mut ctx = bench.ctx(now);
    pe.run(&mut ctx); // consume caps -> evaluate
    let mut ctx = bench.ctx(now);
    pe.run(&mut ctx); // evaluate -> select (sends Request)
    assert_eq!(pe.state(), Some(PeState::SnkSelectCapability));

    let request = bench.prl.take_sent().expect("request sent");
    match request {
        Sent::Data(Sop::Sop, t, objects) => {
            assert_eq!(t, DataMessageType::Request as u8);
            // Object position 1, operating current 3 A.
            assert_eq!((objects[0] >> 28) & 0xF, 1);
            assert_eq!((objects[0] >> 10) & 0x3FF, 300);
        }
        other => panic!("expected Request, sent {:?}", other),
    }

    bench.tx_complete();
    bench.receive_message(partner_ctrl(ControlMessageType::Accept, 1, true));
    now += 1_000;
    let mut ctx = bench.ctx(now);
    pe.run(&mut ctx);
    assert_eq!(pe.state(), Some(PeState::SnkTransitionSink));

    bench.receive_message(partner_ctrl(ControlMessageType::PsRdy, 2, true));
    now += 1_000;
    let mut ctx = bench.ctx(now);
    pe.run(&mut ctx);
    assert_eq!(pe.state(), Some(PeState::SnkReady));

    now
}

#[test]
fn sink_negotiates_explicit_contract() {
    let (mut pe, mut bench) = sink_bench();
    negotiate_contract(&mut pe, &mut bench, 0);

    let contract = bench.port.contract.expect("explicit contract");
    assert_eq!(contract.pdo_index, 1);
    assert_eq!(contract.mv, 5000);
    assert_eq!(contract.ma, 3000);
    assert!(bench.port.check_flag(PeFlag::EXPLICIT_CONTRACT));

    // The full negotiated current reaches the charger.
    assert_eq!(bench.board.input_limit, (3000, 5000));
}

#[test]
fn ready_entry_clears_ams_flags() {
    let (mut pe, mut bench) = sink_bench();
    let now = negotiate_contract(&mut pe, &mut bench, 0);

    bench.port.set_flag(
        PeFlag::MSG_DISCARDED | PeFlag::VDM_REQUEST_TIMEOUT | PeFlag::LOCALLY_INITIATED_AMS | PeFlag::INTERRUPTIBLE_AMS,
    );

    pe.enter_ready(&mut bench.ctx(now));

    assert!(!bench.port.check_flag(
        PeFlag::MSG_DISCARDED | PeFlag::VDM_REQUEST_TIMEOUT | PeFlag::LOCALLY_INITIATED_AMS | PeFlag::INTERRUPTIBLE_AMS
    ));
}

#[test]
fn sink_wait_cap_timeout_hard_resets() {
    let (mut pe, mut bench) = sink_bench();
    run_to_wait_for_caps(&mut pe, &mut bench, 0);

    // Let the wait-cap budget lapse.
    let now = times::T_SINK_WAIT_CAP_US + 1_000;
    let mut ctx = bench.ctx(now);
    pe.run(&mut ctx);

    assert_eq!(pe.state(), Some(PeState::SnkHardReset));
    assert!(bench.port.check_flag(PeFlag::SNK_WAIT_CAP_TIMEOUT));
    let mut ctx = bench.ctx(now + 1_000);
    pe.run(&mut ctx);
    assert_eq!(bench.prl.hard_resets, 1);
}

#[test]
fn soft_reset_in_ready_is_accepted_once() {
    let (mut pe, mut bench) = sink_bench();
    let now = negotiate_contract(&mut pe, &mut bench, 0);

    bench.receive_message(partner_ctrl(ControlMessageType::SoftReset, 3, true));
    let mut ctx = bench.ctx(now + 1_000);
    pe.run(&mut ctx);

    assert_eq!(pe.state(), Some(PeState::SoftResetReceived));
    assert_eq!(bench.prl.soft_resets, 1);
    let accepts = bench
        .prl
        .sent
        .iter()
        .filter(|sent| sent.msg_type() == ControlMessageType::Accept as u8)
        .count();
    assert_eq!(accepts, 1);

    // Accept's GoodCRC moves the sink back to waiting for capabilities.
    bench.tx_complete();
    let mut ctx = bench.ctx(now + 2_000);
    pe.run(&mut ctx);
    assert_eq!(pe.state(), Some(PeState::SnkWaitForCapabilities));
}

#[test]
fn pr_swap_wait_backs_off_and_retries() {
    let (mut pe, mut bench) = sink_bench();
    let mut now = negotiate_contract(&mut pe, &mut bench, 0);
    let mut message_id = 3;

    // Six Wait responses: the first five arm the back-off timer, the
    // sixth exhausts the ladder and stops retrying.
    for round in 1..=6u8 {
        bench.port.post_dpm_request(DpmRequest::PR_SWAP);
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::SendPrSwap), "round {}", round);
        assert_eq!(bench.prl.last_sent().unwrap().msg_type(), ControlMessageType::PrSwap as u8);

        bench.tx_complete();
        bench.receive_message(partner_ctrl(ControlMessageType::Wait, message_id, true));
        message_id = (message_id + 1) & 0x7;
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::SnkReady));

        if round <= 5 {
            assert!(!bench.timers.is_disabled(TimerId::PePrSwapWait), "round {}", round);
            // Keep the timer out of the next round's way.
            bench.timers.disable(TimerId::PePrSwapWait);
        } else {
            assert!(bench.timers.is_disabled(TimerId::PePrSwapWait));
        }
        now += 1_000;
    }
}

#[test]
fn discover_identity_ladder_downgrades_and_fails() {
    let (mut pe, mut bench) = sink_bench();
    let mut now = negotiate_contract(&mut pe, &mut bench, 0);

    // Six unanswered SOP' attempts walk the whole ladder.
    for attempt in 1..=6u8 {
        pe.prepare_discover_identity(&mut bench.ctx(now), Sop::SopPrime);
        pe.state = Some(PeState::VdmRequest);
        pe.entered = true;
        pe.arm_sender_response(&mut bench.ctx(now));
        pe.vdm_timeout_extended = false;

        // Transmit completes, then the response budget (with its one
        // extension) lapses.
        bench.tx_complete();
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        now += times::T_VDM_SENDER_RESPONSE_US + 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        now += 2 * times::T_VDM_SENDER_RESPONSE_US + 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);

        assert_eq!(pe.state(), Some(PeState::SnkReady), "attempt {}", attempt);
        assert_eq!(pe.discover_identity_counter.value(), attempt);

        if attempt == 4 {
            // Attempt four downgrades the cable conversation.
            assert_eq!(bench.prl.get_rev(0, Sop::SopPrime), PdRev::R2_0);
        }

        now += times::T_DISCOVER_IDENTITY_US + times::T_DISCOVER_IDENTITY_NO_CONTRACT_US;
    }

    // The ladder ends in discovery failure on every SOP' record.
    use crate::port::DiscState;
    let discovery = &bench.port.discovery[Sop::SopPrime.index()];
    assert_eq!(discovery.identity_state, DiscState::Fail);
    assert_eq!(discovery.svids_state, DiscState::Fail);
    assert_eq!(discovery.modes_state, DiscState::Fail);

    // And the host heard about it.
    assert!(bench
        .chipset
        .events
        .iter()
        .any(|(_, event)| *event == usbpd_drp_traits::StatusEvent::SopPrimeDiscDone));
}

#[test]
fn hard_reset_exhaustion_requests_error_recovery() {
    let (mut pe, mut bench) = sink_bench();
    let now = negotiate_contract(&mut pe, &mut bench, 0);

    // Two hard resets are allowed; the third attempt gives up.
    for _ in 0..2 {
        assert!(pe.hard_reset_counter.increment().is_ok());
    }

    pe.transition(PeState::SnkHardReset, &mut bench.ctx(now));
    assert!(bench.port.check_dpm_request(DpmRequest::ERROR_RECOVERY));
}

#[test]
fn dr_swap_in_modal_operation_hard_resets() {
    let (mut pe, mut bench) = sink_bench();
    let now = negotiate_contract(&mut pe, &mut bench, 0);

    bench.port.set_flag(PeFlag::MODAL_OPERATION);
    bench.receive_message(partner_ctrl(ControlMessageType::DrSwap, 3, true));

    let mut ctx = bench.ctx(now + 1_000);
    pe.run(&mut ctx);
    assert_eq!(pe.state(), Some(PeState::SnkHardReset));
}

#[test]
fn get_sink_cap_is_answered_with_sink_capabilities() {
    let (mut pe, mut bench) = sink_bench();
    let now = negotiate_contract(&mut pe, &mut bench, 0);

    bench.receive_message(partner_ctrl(ControlMessageType::GetSinkCap, 3, true));
    let mut ctx = bench.ctx(now + 1_000);
    pe.run(&mut ctx);

    assert_eq!(pe.state(), Some(PeState::GiveSinkCap));
    match bench.prl.last_sent().unwrap() {
        Sent::Data(Sop::Sop, t, objects) => {
            assert_eq!(*t, DataMessageType::SinkCapabilities as u8);
            assert!(!objects.is_empty());
        }
        other => panic!("expected Sink_Capabilities, sent {:?}", other),
    }

    bench.tx_complete();
    let mut ctx = bench.ctx(now + 2_000);
    pe.run(&mut ctx);
    assert_eq!(pe.state(), Some(PeState::SnkReady));
}

mod source {
    use usbpd_drp_traits::{PdRev, ProtocolLayer, Sop};

    use crate::dummy::{Bench, Sent, partner_data};
    use crate::message::header::DataMessageType;
    use crate::pe::{PeState, PolicyEngine};
    use crate::times;
    use crate::PowerRole;

    fn source_bench() -> (PolicyEngine, Bench) {
        let mut bench = Bench::new();
        bench.port.power_role = PowerRole::Source;
        bench.prl.start(0, PdRev::R3_1);
        bench.board.vbus_present = true;
        (PolicyEngine::new(), bench)
    }

    #[test]
    fn source_offers_and_supplies_a_contract() {
        let (mut pe, mut bench) = source_bench();
        let mut now = 0;

        // Startup sends the current advertisement right away.
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::SrcSendCapabilities));

        match bench.prl.take_sent().expect("caps sent") {
            Sent::Data(Sop::Sop, t, objects) => {
                assert_eq!(t, DataMessageType::SourceCapabilities as u8);
                // The limited 1.5 A advertisement while unclaimed.
                assert_eq!((objects[0] & 0x3FF) * 10, 1500);
            }
            other => panic!("expected Source_Capabilities, sent {:?}", other),
        }

        bench.tx_complete();
        // The partner requests PDO 1 at 1 A.
        let rdo = (1u32 << 28) | (100 << 10) | 100;
        bench.receive_message(partner_data(DataMessageType::Request, &[rdo], 0, false));
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::SrcNegotiateCapability));
        assert_eq!(
            bench.prl.last_sent().unwrap().msg_type(),
            crate::message::header::ControlMessageType::Accept as u8
        );

        // Accept acknowledged; the supply changes after tSrcTransition.
        bench.tx_complete();
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::SrcTransitionSupply));

        now += times::T_SRC_TRANSITION_US + 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::SrcReady));
        assert_eq!(
            bench.prl.last_sent().unwrap().msg_type(),
            crate::message::header::ControlMessageType::PsRdy as u8
        );

        let contract = bench.port.contract.expect("contract");
        assert_eq!(contract.pdo_index, 1);
        assert_eq!(contract.mv, 5000);
        assert_eq!(contract.ma, 1000);
    }

    #[test]
    fn request_beyond_advertisement_is_rejected() {
        let (mut pe, mut bench) = source_bench();
        let mut now = 0;

        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        bench.prl.sent.clear();

        bench.tx_complete();
        // 3 A against a 1.5 A advertisement.
        let rdo = (1u32 << 28) | (300 << 10) | 300;
        bench.receive_message(partner_data(DataMessageType::Request, &[rdo], 0, false));
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);

        assert_eq!(
            pe.state(),
            Some(PeState::SrcCapabilityResponse(crate::pe::CapResponse::Reject))
        );
        assert_eq!(
            bench.prl.last_sent().unwrap().msg_type(),
            crate::message::header::ControlMessageType::Reject as u8
        );

        // Without a prior contract, a rejection ends in Hard Reset.
        bench.tx_complete();
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::SrcHardReset));
    }
}

mod epr {
    use usbpd_drp_traits::{PdRev, ProtocolLayer, Sop};

    use crate::dummy::{Bench, Sent, partner_data};
    use crate::message::epr::{Action, EprModeDataObject};
    use crate::message::header::DataMessageType;
    use crate::pe::{PeState, PolicyEngine};
    use crate::port::{DpmRequest, PeFlag};
    use crate::PowerRole;

    fn epr_ready() -> (PolicyEngine, Bench, u64) {
        let mut bench = Bench::new();
        bench.port.power_role = PowerRole::Sink;
        bench.prl.start(0, PdRev::R3_1);
        let mut pe = PolicyEngine::new();
        let now = super::negotiate_contract(&mut pe, &mut bench, 0);
        (pe, bench, now)
    }

    #[test]
    fn epr_entry_walks_ack_then_success() {
        let (mut pe, mut bench, mut now) = epr_ready();

        pe.epr_entry_pdp = 140;
        bench.port.post_dpm_request(DpmRequest::EPR_MODE_ENTRY);
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::EprModeEntry));

        match bench.prl.last_sent().unwrap() {
            Sent::Data(Sop::Sop, t, objects) => {
                assert_eq!(*t, DataMessageType::EprMode as u8);
                let mdo = EprModeDataObject(objects[0]);
                assert_eq!(mdo.action(), Some(Action::Enter));
                assert_eq!(mdo.data(), 140);
            }
            other => panic!("expected EPR_Mode, sent {:?}", other),
        }

        bench.tx_complete();
        bench.receive_message(partner_data(
            DataMessageType::EprMode,
            &[EprModeDataObject::new(Action::EnterAcknowledged, 0).0],
            3,
            true,
        ));
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);
        assert_eq!(pe.state(), Some(PeState::EprEntryWaitForResponse));

        bench.receive_message(partner_data(
            DataMessageType::EprMode,
            &[EprModeDataObject::new(Action::EnterSucceeded, 0).0],
            4,
            true,
        ));
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);

        // EPR is up; the sink waits for the EPR advertisement next.
        assert!(bench.port.check_flag(PeFlag::IN_EPR));
        assert_eq!(pe.state(), Some(PeState::SnkWaitForCapabilities));
    }

    #[test]
    fn epr_entry_failure_soft_resets() {
        let (mut pe, mut bench, mut now) = epr_ready();

        pe.epr_entry_pdp = 140;
        bench.port.post_dpm_request(DpmRequest::EPR_MODE_ENTRY);
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);

        bench.tx_complete();
        bench.receive_message(partner_data(
            DataMessageType::EprMode,
            &[EprModeDataObject::new(Action::EnterFailed, 1).0],
            3,
            true,
        ));
        now += 1_000;
        let mut ctx = bench.ctx(now);
        pe.run(&mut ctx);

        assert!(matches!(pe.state(), Some(PeState::SendSoftReset(Sop::Sop))));
        assert!(!bench.port.check_flag(PeFlag::IN_EPR));
    }
}
