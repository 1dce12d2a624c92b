//! Tests for the Type-C connection layer.
use usbpd_drp_traits::{CcLevel, CcPull, MuxMode};

use super::{TcState, TypeC};
use crate::dummy::Bench;
use crate::port::{Contract, DpmRequest, EventBits, PeFlag};
use crate::times;
use crate::{CcState, Polarity, PowerRole};

fn run(tc: &mut TypeC, bench: &mut Bench, now: u64) {
    let mut ctx = bench.ctx(now);
    tc.run(&mut ctx);
}

/// Boot through ErrorRecovery into UnattachedSnk.
fn boot(tc: &mut TypeC, bench: &mut Bench) -> u64 {
    run(tc, bench, 0);
    assert_eq!(tc.state(), Some(TcState::ErrorRecovery));
    assert_eq!(bench.board.pull, Some((CcPull::Open, bench.config.default_rp)));

    let now = times::T_ERROR_RECOVERY_US + 1_000;
    run(tc, bench, now);
    assert_eq!(tc.state(), Some(TcState::UnattachedSnk));
    assert_eq!(bench.board.pull.map(|(pull, _)| pull), Some(CcPull::Rd));
    now
}

/// Walk a booted port to Attached.SNK with Rp on the given line.
fn attach_snk(tc: &mut TypeC, bench: &mut Bench, mut now: u64, cc: (CcLevel, CcLevel)) -> u64 {
    bench.board.cc = cc;
    bench.board.vbus_present = true;

    now += 1_000;
    run(tc, bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachWaitSnk));

    // First sample latches the candidate and restarts the debounce.
    now += 1_000;
    run(tc, bench, now);

    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(tc, bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachedSnk));
    now
}

#[test]
fn sink_attach_latches_polarity_cc1() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let now = boot(&mut tc, &mut bench);
    attach_snk(&mut tc, &mut bench, now, (CcLevel::Rp3A0, CcLevel::Open));

    assert_eq!(bench.port.polarity, Some(Polarity::Cc1));
    assert_eq!(bench.port.cc_state, CcState::DfpAttached);
    assert_eq!(bench.board.polarity_flipped, Some(false));
    assert_eq!(bench.board.mux, MuxMode::Usb);
    assert!(bench.board.auto_discharge);
    assert!(tc.pd_enabled());
    assert!(bench.prl.running);
}

#[test]
fn sink_attach_latches_polarity_cc2() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let now = boot(&mut tc, &mut bench);
    attach_snk(&mut tc, &mut bench, now, (CcLevel::Open, CcLevel::Rp1A5));

    assert_eq!(bench.port.polarity, Some(Polarity::Cc2));
    assert_eq!(bench.board.polarity_flipped, Some(true));
}

#[test]
fn attach_wait_restarts_debounce_on_classification_change() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    bench.board.cc = (CcLevel::Rp1A5, CcLevel::Open);
    bench.board.vbus_present = true;

    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += 1_000;
    run(&mut tc, &mut bench, now);

    // Half-way through the debounce the reading flips lines.
    now += times::T_CC_DEBOUNCE_US / 2;
    bench.board.cc = (CcLevel::Open, CcLevel::Rp1A5);
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachWaitSnk));

    // The original deadline alone is not enough anymore.
    now += times::T_CC_DEBOUNCE_US / 2 + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachWaitSnk));

    // The full period after the change completes the attach.
    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachedSnk));
    assert_eq!(bench.port.polarity, Some(Polarity::Cc2));
}

#[test]
fn vbus_removal_detaches_sink_without_frs() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    now = attach_snk(&mut tc, &mut bench, now, (CcLevel::Rp3A0, CcLevel::Open));

    // Partner state set up during the attach must be cleared again.
    bench.port.set_contract(Contract {
        pdo_index: 1,
        mv: 5000,
        ma: 3000,
    });
    bench.port.latch_event(EventBits::SOP_DISC_DONE);

    bench.board.vbus_present = false;
    now += 1_000;
    run(&mut tc, &mut bench, now);

    assert_eq!(tc.state(), Some(TcState::UnattachedSnk));
    assert!(!tc.pd_enabled());
    assert!(!bench.prl.running);
    assert!(bench.port.contract.is_none());
    assert_eq!(bench.port.polarity, None);
    // Only the disconnect event survives the cleanup.
    assert_eq!(bench.port.events, EventBits::DISCONNECTED);
}

#[test]
fn frs_enabled_sink_debounces_vbus_removal() {
    let mut bench = Bench::new();
    bench.config.frs_capable = true;
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    now = attach_snk(&mut tc, &mut bench, now, (CcLevel::Rp3A0, CcLevel::Open));

    bench.board.vbus_present = false;
    now += 1_000;
    run(&mut tc, &mut bench, now);
    // One reading is not enough with FRS armed.
    assert_eq!(tc.state(), Some(TcState::AttachedSnk));

    now += times::T_FRS_VBUS_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::UnattachedSnk));
}

#[test]
fn try_src_wins_when_partner_presents_rd() {
    let mut bench = Bench::new();
    bench.config.try_src = true;
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    bench.board.cc = (CcLevel::Rp1A5, CcLevel::Open);
    bench.board.vbus_present = true;

    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::TrySrc));
    assert_eq!(bench.board.pull.map(|(pull, _)| pull), Some(CcPull::Rp));

    // The partner flips to Rd within the try window.
    bench.board.cc = (CcLevel::Rd, CcLevel::Open);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += times::T_PD_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);

    assert_eq!(tc.state(), Some(TcState::AttachedSrc));
    assert_eq!(bench.port.power_role, PowerRole::Source);
    assert!(bench.board.sourcing);
    assert!(bench.board.vconn);
}

#[test]
fn try_src_times_out_into_try_wait_snk() {
    let mut bench = Bench::new();
    bench.config.try_src = true;
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    bench.board.cc = (CcLevel::Rp1A5, CcLevel::Open);
    bench.board.vbus_present = true;

    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::TrySrc));

    // Nobody presents Rd; fall back toward the sink role.
    bench.board.cc = (CcLevel::Rp1A5, CcLevel::Open);
    now += times::T_DRP_TRY_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::TryWaitSnk));

    // The source is still there; tCCDebounce with vBus completes the
    // attach, whatever the CC lines read.
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::TryWaitSnk));
    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachedSnk));
    assert_eq!(bench.port.polarity, Some(Polarity::Cc1));
}

#[test]
fn try_wait_snk_detaches_after_open_cc_debounce() {
    let mut bench = Bench::new();
    bench.config.try_src = true;
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    bench.board.cc = (CcLevel::Rp1A5, CcLevel::Open);
    bench.board.vbus_present = true;

    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::TrySrc));

    // The partner disappeared entirely.
    bench.board.cc = (CcLevel::Open, CcLevel::Open);
    bench.board.vbus_present = false;
    now += times::T_DRP_TRY_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::TryWaitSnk));

    // Both CCs open for tPDDebounce ends the attempt.
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::TryWaitSnk));
    now += times::T_PD_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::UnattachedSnk));
}

#[test]
fn source_attach_enables_pd_after_vconn_stable() {
    let mut bench = Bench::new();
    bench.config.drp_toggle = true;
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);

    // Toggle to the source side and find a sink.
    now += times::T_DRP_AUTO_TOGGLE_US + 1_000;
    bench.config.auto_toggle = false;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::UnattachedSrc));

    bench.board.cc = (CcLevel::Rd, CcLevel::Open);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachWaitSrc));

    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachedSrc));
    assert_eq!(bench.port.polarity, Some(Polarity::Cc1));
    assert!(bench.board.sourcing);
    // VCONN comes up before vBus and PD waits for it to stabilize.
    assert!(bench.board.vconn);
    assert!(!tc.pd_enabled());

    now += times::POWER_SUPPLY_TURN_ON_DELAY_US.max(times::T_VCONN_STABLE_US) + 1_000;
    run(&mut tc, &mut bench, now);
    assert!(tc.pd_enabled());
}

#[test]
fn supply_failure_unwinds_and_recovers() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    now += times::T_DRP_AUTO_TOGGLE_US + 1_000;
    bench.config.auto_toggle = false;
    run(&mut tc, &mut bench, now);

    bench.board.cc = (CcLevel::Open, CcLevel::Rd);
    bench.board.fail_supply = true;
    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    now += times::T_CC_DEBOUNCE_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::AttachedSrc));

    // The failed supply queued ErrorRecovery and unwound VCONN.
    assert!(!bench.board.vconn);
    assert_eq!(bench.board.mux, MuxMode::None);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::ErrorRecovery));
}

#[test]
fn suspend_is_acknowledged_in_disabled() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);

    bench.port.post_dpm_request(DpmRequest::SUSPEND);
    now += 1_000;
    run(&mut tc, &mut bench, now);

    assert_eq!(tc.state(), Some(TcState::Disabled));
    assert!(bench.port.check_flag(PeFlag::SUSPENDED));
    assert_eq!(bench.board.pull, Some((CcPull::Open, bench.config.default_rp)));

    // Resume goes back through ErrorRecovery.
    bench.port.clear_dpm_request(DpmRequest::SUSPEND);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::ErrorRecovery));
    assert!(!bench.port.check_flag(PeFlag::SUSPENDED));
}

#[test]
fn auto_toggle_drops_to_low_power_mode() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);

    // Nothing attached: hand the toggle to hardware.
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::DrpAutoToggle));
    assert!(bench.board.auto_toggling);

    now += times::T_LOW_POWER_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::LowPowerMode));
    assert_eq!(bench.board.lpm_entries, 1);

    // An interrupt-context wake exits after the debounce.
    bench.port.set_flag(PeFlag::CHECK_CONNECTION);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::LowPowerMode));
    now += times::T_LOW_POWER_EXIT_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::UnattachedSnk));
}

#[test]
fn lpm_prevent_refcount_blocks_entry() {
    let mut bench = Bench::new();
    let mut tc = TypeC::new();

    let mut now = boot(&mut tc, &mut bench);
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::DrpAutoToggle));

    bench.port.prevent_lpm();
    now += times::T_LOW_POWER_US + 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::DrpAutoToggle));

    bench.port.allow_lpm();
    now += 1_000;
    run(&mut tc, &mut bench, now);
    assert_eq!(tc.state(), Some(TcState::LowPowerMode));
}
