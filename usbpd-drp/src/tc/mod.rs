//! Type-C connection state machine.
//!
//! Orients the CC pulls, debounces attach and detach, runs Try.SRC for
//! source-preferred DRPs, performs the electrical half of power-role
//! swaps and manages hardware auto-toggle and low-power mode.
use usbpd_drp_traits::{Board, CcLevel, CcPull, Chipset, MuxMode, ProtocolLayer, VbusLevel};

use crate::engine::Ctx;
use crate::port::{DpmRequest, EventBits, PeFlag};
use crate::timer::{TimerId, TimerRange};
use crate::times;
use crate::{CcState, DataRole, Polarity, PowerRole};

/// Connection-layer states.
///
/// Grouped by the CC termination their super-state asserts on entry:
/// open (disabled, error recovery), Rd (the sink-side states), Rp (the
/// source-side states); the attached and auto-toggle states manage their
/// terminations themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcState {
    /// Port disabled (suspend acknowledged).
    Disabled,
    /// CC open dwell to recover from an unknown or broken state.
    ErrorRecovery,
    /// Presenting Rd, waiting for a source.
    UnattachedSnk,
    /// Debouncing a possible source attach.
    AttachWaitSnk,
    /// Sink attached and (possibly) running PD.
    AttachedSnk,
    /// Try.SRC failed; waiting for the partner to come back as a source.
    TryWaitSnk,
    /// Presenting Rp, waiting for a sink.
    UnattachedSrc,
    /// Debouncing a possible sink attach.
    AttachWaitSrc,
    /// Source-preferred DRP probing for the source role.
    TrySrc,
    /// Source attached and (possibly) running PD.
    AttachedSrc,
    /// CC toggling handed to the TCPC hardware.
    DrpAutoToggle,
    /// TCPC in its low-power state.
    LowPowerMode,
    /// Debug-accessory sink waiting for vBus.
    CtUnattachedSnk,
    /// Debug-accessory sink attached.
    CtAttachedSnk,
}

impl TcState {
    fn cc_pull(self) -> Option<CcPull> {
        match self {
            TcState::Disabled | TcState::ErrorRecovery => Some(CcPull::Open),
            TcState::UnattachedSnk
            | TcState::AttachWaitSnk
            | TcState::TryWaitSnk
            | TcState::CtUnattachedSnk
            | TcState::CtAttachedSnk => Some(CcPull::Rd),
            TcState::UnattachedSrc | TcState::AttachWaitSrc | TcState::TrySrc => Some(CcPull::Rp),
            _ => None,
        }
    }
}

/// The Type-C layer for one port.
#[derive(Debug)]
pub struct TypeC {
    state: Option<TcState>,
    pd_enabled: bool,
    /// Set while the attached-source entry waits for VCONN to stabilize
    /// before starting the policy engine.
    pd_start_pending: bool,
    /// Last CC reading under debounce; `None` restarts the debounce.
    last_cc: Option<(CcLevel, CcLevel)>,
}

impl TypeC {
    /// Create the layer; the first tick enters ErrorRecovery to recover
    /// from whatever state the hardware booted in.
    pub fn new() -> Self {
        Self {
            state: None,
            pd_enabled: false,
            pd_start_pending: false,
            last_cc: None,
        }
    }

    /// Whether the policy engine should run.
    pub fn pd_enabled(&self) -> bool {
        self.pd_enabled
    }

    /// The current state, if the layer has started.
    pub fn state(&self) -> Option<TcState> {
        self.state
    }

    /// Run one tick.
    pub(crate) fn run<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let Some(state) = self.state else {
            self.transition(TcState::ErrorRecovery, ctx);
            return;
        };

        if let Some(next) = self.run_common(state, ctx) {
            self.transition(next, ctx);
            return;
        }

        if let Some(next) = self.run_state(state, ctx) {
            self.transition(next, ctx);
        }
    }

    /// Checks that outrank the per-state behavior.
    fn run_common<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        state: TcState,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<TcState> {
        // Suspension wins over everything.
        if ctx.port.check_dpm_request(DpmRequest::SUSPEND) {
            return (state != TcState::Disabled).then_some(TcState::Disabled);
        } else if state == TcState::Disabled {
            // Resume re-derives all state from scratch.
            return Some(TcState::ErrorRecovery);
        }

        if ctx.port.take_dpm_request(DpmRequest::ERROR_RECOVERY) && state != TcState::ErrorRecovery {
            return Some(TcState::ErrorRecovery);
        }

        // An FRS K-code with no running policy engine would leave a
        // half-swapped port.
        if ctx.port.check_flag(PeFlag::FAST_ROLE_SWAP_SIGNALED) && !self.pd_enabled {
            ctx.port.clear_flag(PeFlag::FAST_ROLE_SWAP_SIGNALED);
            return Some(TcState::ErrorRecovery);
        }

        None
    }

    fn transition<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, next: TcState, ctx: &mut Ctx<P, B, C>) {
        debug!("C{}: TC {:?} -> {:?}", ctx.id(), self.state, next);

        self.exit_state(self.state, ctx);
        self.state = Some(next);
        self.enter_state(next, ctx);
    }

    fn exit_state<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, state: Option<TcState>, ctx: &mut Ctx<P, B, C>) {
        match state {
            Some(TcState::Disabled) => ctx.port.clear_flag(PeFlag::SUSPENDED),
            Some(TcState::DrpAutoToggle) => ctx.board.drp_auto_toggle(ctx.port.id, false),
            Some(TcState::LowPowerMode) => {
                ctx.port.clear_flag(PeFlag::CHECK_CONNECTION);
                ctx.timers.disable(TimerId::TcLowPowerExitTime);
            }
            _ => (),
        }
    }

    fn enter_state<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, state: TcState, ctx: &mut Ctx<P, B, C>) {
        // Entering a super-state asserts its termination and drops VCONN.
        if let Some(pull) = state.cc_pull() {
            let rp = ctx.shared.selected_rp(ctx.port.id);
            ctx.board.set_cc(ctx.port.id, pull, rp);
            if ctx.port.take_flag(PeFlag::VCONN_ON) {
                let _ = ctx.board.set_vconn(ctx.port.id, false);
            }
        }

        match state {
            TcState::Disabled => {
                self.disconnect(ctx);
                ctx.port.set_flag(PeFlag::SUSPENDED);
            }
            TcState::ErrorRecovery => {
                self.disconnect(ctx);
                ctx.timers.enable(TimerId::TcTimeout, ctx.now, times::T_ERROR_RECOVERY_US);
            }
            TcState::UnattachedSnk => {
                self.disconnect(ctx);
                ctx.port.power_role = PowerRole::Sink;
                ctx.port.data_role = DataRole::Ufp;
                if ctx.config.drp_toggle {
                    ctx.timers
                        .enable(TimerId::TcNextRoleSwap, ctx.now, times::T_DRP_AUTO_TOGGLE_US);
                }
            }
            TcState::UnattachedSrc => {
                self.disconnect(ctx);
                ctx.port.power_role = PowerRole::Source;
                ctx.port.data_role = DataRole::Dfp;
                if ctx.config.drp_toggle {
                    ctx.timers
                        .enable(TimerId::TcNextRoleSwap, ctx.now, times::T_DRP_AUTO_TOGGLE_US);
                }
            }
            TcState::AttachWaitSnk | TcState::AttachWaitSrc => {
                self.last_cc = None;
            }
            TcState::TrySrc => {
                ctx.port.power_role = PowerRole::Source;
                ctx.timers.enable(TimerId::TcTimeout, ctx.now, times::T_DRP_TRY_US);
                ctx.timers.disable(TimerId::TcPdDebounce);
            }
            TcState::TryWaitSnk => {
                ctx.port.power_role = PowerRole::Sink;
                self.last_cc = None;
                ctx.timers
                    .enable(TimerId::TcTryWaitDebounce, ctx.now, times::T_CC_DEBOUNCE_US);
                ctx.timers.disable(TimerId::TcPdDebounce);
            }
            TcState::AttachedSnk => self.enter_attached_snk(ctx),
            TcState::AttachedSrc => self.enter_attached_src(ctx),
            TcState::DrpAutoToggle => {
                ctx.board.drp_auto_toggle(ctx.port.id, true);
                ctx.timers.enable(TimerId::TcLowPowerTime, ctx.now, times::T_LOW_POWER_US);
            }
            TcState::LowPowerMode => {
                ctx.board.enter_low_power_mode(ctx.port.id);
            }
            TcState::CtUnattachedSnk => {
                self.disconnect(ctx);
                ctx.port.power_role = PowerRole::Sink;
            }
            TcState::CtAttachedSnk => {
                let polarity = ctx.port.polarity.unwrap_or(Polarity::Cc1);
                ctx.board.set_polarity(ctx.port.id, polarity.is_flipped());
                ctx.board.mux_set(ctx.port.id, MuxMode::Usb, polarity.is_flipped());
                ctx.board.auto_discharge_disconnect(ctx.port.id, true);
            }
        }
    }

    fn run_state<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        state: TcState,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<TcState> {
        match state {
            TcState::Disabled => None,
            TcState::ErrorRecovery => self.run_error_recovery(ctx),
            TcState::UnattachedSnk => self.run_unattached_snk(ctx),
            TcState::AttachWaitSnk => self.run_attach_wait_snk(ctx),
            TcState::AttachedSnk => self.run_attached_snk(ctx),
            TcState::TryWaitSnk => self.run_try_wait_snk(ctx),
            TcState::UnattachedSrc => self.run_unattached_src(ctx),
            TcState::AttachWaitSrc => self.run_attach_wait_src(ctx),
            TcState::TrySrc => self.run_try_src(ctx),
            TcState::AttachedSrc => self.run_attached_src(ctx),
            TcState::DrpAutoToggle => self.run_drp_auto_toggle(ctx),
            TcState::LowPowerMode => self.run_low_power_mode(ctx),
            TcState::CtUnattachedSnk => self.run_ct_unattached_snk(ctx),
            TcState::CtAttachedSnk => self.run_ct_attached_snk(ctx),
        }
    }

    // --- Detach bookkeeping ------------------------------------------

    /// Tear down everything derived from the last partner.
    fn disconnect<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        if self.pd_enabled {
            self.pd_enabled = false;
            ctx.prl.stop(ctx.port.id);
        }
        self.pd_start_pending = false;
        self.last_cc = None;

        ctx.board.auto_discharge_disconnect(ctx.port.id, false);
        ctx.board.mux_set(ctx.port.id, MuxMode::None, false);
        ctx.board.set_input_current_limit(ctx.port.id, 0, 0);
        ctx.board.frs_detection_enable(ctx.port.id, false);

        ctx.timers.disable_range(TimerRange::Tc);
        ctx.timers.disable_range(TimerRange::Pe);
        ctx.timers.disable_range(TimerRange::Pr);
        ctx.timers.disable_range(TimerRange::Dpm);

        let had_partner = ctx.port.cc_state != CcState::None && ctx.port.cc_state != CcState::Unset;
        ctx.port.clear_partner_state();
        if had_partner {
            ctx.notify_event(EventBits::DISCONNECTED);
        }

        crate::dpm::remove_sink(ctx.shared, ctx.config, ctx.port.id);
        crate::dpm::remove_source(ctx.shared, ctx.config, ctx.port.id);
    }

    // --- Individual states -------------------------------------------

    fn run_error_recovery<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        if !ctx.timers.is_expired(TimerId::TcTimeout, ctx.now) {
            return None;
        }

        ctx.timers.disable(TimerId::TcTimeout);
        // DRPs restart probing from the sink side.
        Some(TcState::UnattachedSnk)
    }

    fn run_unattached_snk<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);

        if cc1.is_rp() || cc2.is_rp() {
            return Some(TcState::AttachWaitSnk);
        }

        if ctx.config.drp_toggle && ctx.timers.is_expired(TimerId::TcNextRoleSwap, ctx.now) {
            return Some(TcState::UnattachedSrc);
        }

        if ctx.config.auto_toggle && ctx.config.drp_toggle {
            return Some(TcState::DrpAutoToggle);
        }

        None
    }

    fn run_attach_wait_snk<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<TcState> {
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);
        let dts_capable = ctx.board.is_dts_capable(ctx.port.id);

        // Restart both debounces whenever the raw reading moves.
        if self.last_cc != Some((cc1, cc2)) {
            self.last_cc = Some((cc1, cc2));
            ctx.timers.enable(TimerId::TcCcDebounce, ctx.now, times::T_CC_DEBOUNCE_US);
            ctx.timers.enable(TimerId::TcPdDebounce, ctx.now, times::T_PD_DEBOUNCE_US);
            return None;
        }

        let classification = match (cc1.is_rp(), cc2.is_rp()) {
            (true, true) if dts_capable => CcState::DfpDebugAcc,
            (true, false) | (false, true) => CcState::DfpAttached,
            _ => CcState::None,
        };

        if classification == CcState::None {
            if ctx.timers.is_expired(TimerId::TcPdDebounce, ctx.now) {
                return Some(if ctx.config.drp_toggle {
                    TcState::UnattachedSrc
                } else {
                    TcState::UnattachedSnk
                });
            }
            return None;
        }

        if !ctx.timers.is_expired(TimerId::TcCcDebounce, ctx.now) || !ctx.vbus_present() {
            return None;
        }

        ctx.port.cc_state = classification;
        ctx.port.polarity = Some(snk_polarity(cc1, cc2, classification == CcState::DfpDebugAcc));

        if classification == CcState::DfpAttached && ctx.config.try_src {
            return Some(TcState::TrySrc);
        }

        Some(TcState::AttachedSnk)
    }

    fn enter_attached_snk<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        // Latch orientation from a fresh sample; keep what AttachWait
        // recorded when the source's Rp is not visible right now.
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);
        if cc1.is_rp() || cc2.is_rp() {
            let dts = ctx.port.polarity.map(|p| p.is_dts()).unwrap_or(false);
            ctx.port.polarity = Some(snk_polarity(cc1, cc2, dts));
        }

        let polarity = ctx.port.polarity.unwrap_or(Polarity::Cc1);
        let from_swap = ctx.port.check_flag(PeFlag::PR_SWAP_IN_PROGRESS | PeFlag::FAST_ROLE_SWAP_PATH);

        info!("C{}: attached as sink, polarity {:?}", ctx.id(), polarity);

        ctx.board.set_polarity(ctx.port.id, polarity.is_flipped());

        ctx.port.power_role = PowerRole::Sink;
        // A power-role swap keeps the data role and mux configuration.
        if !from_swap {
            ctx.port.data_role = DataRole::Ufp;
            ctx.board.mux_set(ctx.port.id, MuxMode::Usb, polarity.is_flipped());
        }

        // Rd must be re-asserted before auto-discharge is enabled, or
        // some TCPCs latch a discharge fault on the still-open CC.
        ctx.board.set_cc(ctx.port.id, CcPull::Rd, ctx.config.default_rp);
        ctx.board.auto_discharge_disconnect(ctx.port.id, true);

        if !self.pd_enabled {
            self.enable_pd(ctx);
        }
    }

    fn run_attached_snk<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        // The policy engine completed a swap to source.
        if ctx.port.power_role == PowerRole::Source {
            self.last_cc = None;
            return Some(TcState::AttachedSrc);
        }

        // During a power-role swap or fast role swap, vBus legitimately
        // disappears.
        if ctx.port.check_flag(PeFlag::PR_SWAP_IN_PROGRESS | PeFlag::FAST_ROLE_SWAP_PATH) {
            return None;
        }

        let vbus_removed = ctx.board.vbus_at_level(ctx.port.id, VbusLevel::Removed);

        if ctx.config.frs_capable {
            // Debounce: FRS hardware may pull vBus around during the swap.
            if vbus_removed {
                if ctx.timers.is_disabled(TimerId::TcVbusDebounce) {
                    ctx.timers
                        .enable(TimerId::TcVbusDebounce, ctx.now, times::T_FRS_VBUS_DEBOUNCE_US);
                } else if ctx.timers.is_expired(TimerId::TcVbusDebounce, ctx.now) {
                    return Some(TcState::UnattachedSnk);
                }
            } else {
                ctx.timers.disable(TimerId::TcVbusDebounce);
            }
        } else if vbus_removed {
            return Some(TcState::UnattachedSnk);
        }

        None
    }

    fn run_try_src<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);

        if cc1.is_rd() || cc2.is_rd() {
            if ctx.timers.is_disabled(TimerId::TcPdDebounce) {
                ctx.timers.enable(TimerId::TcPdDebounce, ctx.now, times::T_PD_DEBOUNCE_US);
            } else if ctx.timers.is_expired(TimerId::TcPdDebounce, ctx.now) {
                ctx.port.cc_state = CcState::UfpAttached;
                ctx.port.polarity = Some(src_polarity(cc1, cc2, false));
                return Some(TcState::AttachedSrc);
            }
            return None;
        }

        ctx.timers.disable(TimerId::TcPdDebounce);

        if ctx.timers.is_expired(TimerId::TcTimeout, ctx.now) {
            ctx.timers.disable(TimerId::TcTimeout);
            return Some(TcState::TryWaitSnk);
        }

        None
    }

    fn run_try_wait_snk<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);

        // Only both CCs being open matters while waiting for the source
        // to come back; debounce that reading.
        if self.last_cc != Some((cc1, cc2)) {
            self.last_cc = Some((cc1, cc2));
            ctx.timers.enable(TimerId::TcPdDebounce, ctx.now, times::T_PD_DEBOUNCE_US);
        }

        if cc1 == CcLevel::Open && cc2 == CcLevel::Open && ctx.timers.is_expired(TimerId::TcPdDebounce, ctx.now) {
            return Some(TcState::UnattachedSnk);
        }

        // The port attaches after tCCDebounce once vBus is detected.
        if ctx.timers.is_expired(TimerId::TcTryWaitDebounce, ctx.now) && ctx.vbus_present() {
            ctx.timers.disable(TimerId::TcTryWaitDebounce);
            ctx.port.cc_state = CcState::DfpAttached;
            return Some(TcState::AttachedSnk);
        }

        None
    }

    fn run_unattached_src<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);

        if cc1.is_rd() || cc2.is_rd() || cc1 == CcLevel::Ra || cc2 == CcLevel::Ra {
            return Some(TcState::AttachWaitSrc);
        }

        if ctx.config.drp_toggle && ctx.timers.is_expired(TimerId::TcNextRoleSwap, ctx.now) {
            return Some(TcState::UnattachedSnk);
        }

        None
    }

    fn run_attach_wait_src<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<TcState> {
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);

        if self.last_cc != Some((cc1, cc2)) {
            self.last_cc = Some((cc1, cc2));
            ctx.timers.enable(TimerId::TcCcDebounce, ctx.now, times::T_CC_DEBOUNCE_US);
            return None;
        }

        let classification = match (cc1, cc2) {
            (CcLevel::Rd, CcLevel::Rd) => CcState::UfpDebugAcc,
            (CcLevel::Ra, CcLevel::Ra) => CcState::UfpAudioAcc,
            (CcLevel::Rd, _) | (_, CcLevel::Rd) => CcState::UfpAttached,
            _ => CcState::None,
        };

        if !ctx.timers.is_expired(TimerId::TcCcDebounce, ctx.now) {
            return None;
        }

        match classification {
            CcState::None => Some(if ctx.config.drp_toggle {
                TcState::UnattachedSnk
            } else {
                TcState::UnattachedSrc
            }),
            CcState::UfpAudioAcc => {
                ctx.port.cc_state = classification;
                None
            }
            _ => {
                ctx.port.cc_state = classification;
                ctx.port.polarity = Some(src_polarity(cc1, cc2, classification == CcState::UfpDebugAcc));
                Some(TcState::AttachedSrc)
            }
        }
    }

    /// The Attached.SRC entry contract. Order matters throughout.
    fn enter_attached_src<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let polarity = ctx.port.polarity.unwrap_or(Polarity::Cc1);
        let from_swap = ctx.port.check_flag(PeFlag::PR_SWAP_IN_PROGRESS | PeFlag::FAST_ROLE_SWAP_PATH);

        info!("C{}: attached as source, polarity {:?}", ctx.id(), polarity);

        // 1. Rp at the currently selected limit.
        let rp = ctx.shared.selected_rp(ctx.port.id);
        ctx.board.set_cc(ctx.port.id, CcPull::Rp, rp);

        // 2. Latch orientation.
        ctx.board.set_polarity(ctx.port.id, polarity.is_flipped());

        ctx.port.power_role = PowerRole::Source;
        // A power-role swap keeps the data role and mux configuration.
        if !from_swap {
            ctx.port.data_role = DataRole::Dfp;
            ctx.board.mux_set(ctx.port.id, MuxMode::Usb, polarity.is_flipped());
        }

        // 3. Auto-discharge before driving the supply.
        ctx.board.auto_discharge_disconnect(ctx.port.id, true);

        // 4. VCONN before vBus, unless the partner is a DTS. A swap
        //    keeps the existing VCONN arrangement.
        if !polarity.is_dts() && !from_swap {
            if ctx.board.set_vconn(ctx.port.id, true).is_ok() {
                ctx.port.set_flag(PeFlag::VCONN_ON);
            }
        }

        // 5. vBus; on failure unwind VCONN and the mux.
        if !from_swap {
            if ctx.board.power_supply_ready(ctx.port.id).is_err() {
                error!("C{}: source supply failed to start", ctx.id());
                if ctx.port.take_flag(PeFlag::VCONN_ON) {
                    let _ = ctx.board.set_vconn(ctx.port.id, false);
                }
                ctx.board.mux_set(ctx.port.id, MuxMode::None, false);
                ctx.port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
                return;
            }
        }

        // 6. Give VCONN time to stabilize before cable discovery.
        if !self.pd_enabled {
            self.pd_start_pending = true;
            ctx.timers.enable(
                TimerId::TcTimeout,
                ctx.now,
                times::POWER_SUPPLY_TURN_ON_DELAY_US.max(times::T_VCONN_STABLE_US),
            );
        }
    }

    fn run_attached_src<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        // The policy engine completed a swap to sink.
        if ctx.port.power_role == PowerRole::Sink {
            self.last_cc = None;
            return Some(TcState::AttachedSnk);
        }

        if self.pd_start_pending && ctx.timers.is_expired(TimerId::TcTimeout, ctx.now) {
            ctx.timers.disable(TimerId::TcTimeout);
            self.pd_start_pending = false;
            self.enable_pd(ctx);
        }

        // Rp current-limit updates apply directly in an implicit
        // contract; under an explicit contract the source instead
        // re-advertises its capabilities.
        if ctx.port.take_dpm_request(DpmRequest::UPDATE_CURRENT) {
            if ctx.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
                ctx.port.post_dpm_request(DpmRequest::SRC_CAP_CHANGE);
            } else {
                let rp = ctx.shared.selected_rp(ctx.port.id);
                ctx.board.set_cc(ctx.port.id, CcPull::Rp, rp);
            }
        }

        // Detach: the partner's Rd disappears, debounced.
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);
        let partner_present = cc1.is_rd() || cc2.is_rd();

        if partner_present {
            ctx.timers.disable(TimerId::TcPdDebounce);
            return None;
        }

        if ctx.port.check_flag(PeFlag::PR_SWAP_IN_PROGRESS) {
            return None;
        }

        if ctx.timers.is_disabled(TimerId::TcPdDebounce) {
            ctx.timers.enable(TimerId::TcPdDebounce, ctx.now, times::T_PD_DEBOUNCE_US);
            return None;
        }

        if !ctx.timers.is_expired(TimerId::TcPdDebounce, ctx.now) {
            return None;
        }

        ctx.board.power_supply_reset(ctx.port.id);
        Some(if ctx.config.drp_toggle {
            TcState::UnattachedSnk
        } else {
            TcState::UnattachedSrc
        })
    }

    fn run_drp_auto_toggle<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<TcState> {
        let (cc1, cc2) = ctx.board.sample_cc(ctx.port.id);

        if cc1.is_rp() || cc2.is_rp() {
            ctx.port.power_role = PowerRole::Sink;
            return Some(TcState::AttachWaitSnk);
        }
        if cc1.is_rd() || cc2.is_rd() || cc1 == CcLevel::Ra || cc2 == CcLevel::Ra {
            ctx.port.power_role = PowerRole::Source;
            return Some(TcState::AttachWaitSrc);
        }

        if ctx.port.take_flag(PeFlag::CHECK_CONNECTION) {
            return Some(TcState::UnattachedSnk);
        }

        if ctx.timers.is_expired(TimerId::TcLowPowerTime, ctx.now) && !ctx.port.lpm_prevented() {
            ctx.timers.disable(TimerId::TcLowPowerTime);
            return Some(TcState::LowPowerMode);
        }

        None
    }

    fn run_low_power_mode<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) -> Option<TcState> {
        let wake = ctx.port.check_flag(PeFlag::CHECK_CONNECTION)
            || ctx.port.lpm_prevented()
            || ctx.port.dpm_request.snapshot_raw() != 0;

        if !wake {
            ctx.timers.disable(TimerId::TcLowPowerExitTime);
            return None;
        }

        // Debounce the exit, so interrupt storms do not thrash the TCPC.
        if ctx.timers.is_disabled(TimerId::TcLowPowerExitTime) {
            ctx.timers
                .enable(TimerId::TcLowPowerExitTime, ctx.now, times::T_LOW_POWER_EXIT_US);
            return None;
        }

        if ctx.timers.is_expired(TimerId::TcLowPowerExitTime, ctx.now) {
            return Some(TcState::UnattachedSnk);
        }

        None
    }

    fn run_ct_unattached_snk<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<TcState> {
        if ctx.vbus_present() {
            ctx.port.cc_state = CcState::DfpAttached;
            return Some(TcState::CtAttachedSnk);
        }

        None
    }

    fn run_ct_attached_snk<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        ctx: &mut Ctx<P, B, C>,
    ) -> Option<TcState> {
        if ctx.board.vbus_at_level(ctx.port.id, VbusLevel::Removed) {
            return Some(TcState::CtUnattachedSnk);
        }

        None
    }

    fn enable_pd<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        ctx.prl.start(ctx.port.id, usbpd_drp_traits::PdRev::R3_1);
        self.pd_enabled = true;
    }
}

impl Default for TypeC {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink-side polarity: the line that shows Rp.
fn snk_polarity(cc1: CcLevel, cc2: CcLevel, dts: bool) -> Polarity {
    let cc1_active = if dts {
        rp_rank(cc1) >= rp_rank(cc2)
    } else {
        cc1.is_rp()
    };

    match (cc1_active, dts) {
        (true, false) => Polarity::Cc1,
        (false, false) => Polarity::Cc2,
        (true, true) => Polarity::Cc1Dts,
        (false, true) => Polarity::Cc2Dts,
    }
}

/// Source-side polarity: the line that shows Rd.
fn src_polarity(cc1: CcLevel, cc2: CcLevel, dts: bool) -> Polarity {
    let cc1_active = cc1.is_rd();

    match (cc1_active, dts) {
        (true, false) => Polarity::Cc1,
        (false, false) => Polarity::Cc2,
        (true, true) => Polarity::Cc1Dts,
        (false, true) => Polarity::Cc2Dts,
    }
}

fn rp_rank(level: CcLevel) -> u8 {
    match level {
        CcLevel::Rp3A0 => 3,
        CcLevel::Rp1A5 => 2,
        CcLevel::RpUsb => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests;
