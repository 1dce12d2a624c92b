//! Device policy manager.
//!
//! Cross-port state and policy: the shared 3 A source-current pool,
//! alternate-mode entry fan-out, SVDM Attention, Alert handling and the
//! USB-PD power-button state machine.

mod allocator;

pub use allocator::{SharedPolicy, add_non_pd_sink, balance_source_ports, remove_sink, remove_source, source_current_ma, source_pdos};
pub(crate) use allocator::{bist_shared_mode_enter, bist_shared_mode_exit, evaluate_request_rdo, evaluate_sink_caps};

use bitflags::bitflags;
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, ChipsetState, MuxMode, ProtocolLayer, Sop};

use crate::alt_mode::dp::DisplayPortMode;
use crate::alt_mode::tbt::ThunderboltMode;
use crate::alt_mode::usb4::Usb4Mode;
use crate::alt_mode::VdmSetup;
use crate::engine::Ctx;
use crate::message::alert::{Ado, ExtendedAlertType};
use crate::message::vdm::{self, SvdmVersion, VdmCommand, VdmCommandType, VdmHeader};
use crate::pe::{PeState, PolicyEngine, VdmResult};
use crate::port::{DiscState, DpmRequest, PeFlag, Port};
use crate::timer::TimerId;
use crate::times;
use crate::DataRole;

bitflags! {
    /// Internal DPM flags, mirrored per port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DpmFlag: u32 {
        /// Mode entry concluded (successfully or not).
        const MODE_ENTRY_DONE = 1 << 0;
        /// Exit of all modes was requested.
        const EXIT_REQUEST = 1 << 1;
        /// The AP asked for DisplayPort.
        const ENTER_DP = 1 << 2;
        /// The AP asked for Thunderbolt.
        const ENTER_TBT = 1 << 3;
        /// The AP asked for USB4.
        const ENTER_USB4 = 1 << 4;
        /// An Attention message is queued.
        const SEND_ATTENTION = 1 << 5;
        /// Data Reset was requested and not yet resolved.
        const DATA_RESET_REQUESTED = 1 << 6;
        /// Data Reset concluded.
        const DATA_RESET_DONE = 1 << 7;
        /// The partner's USB-PD power button is pressed.
        const PD_BUTTON_PRESSED = 1 << 8;
        /// The partner's USB-PD power button was released.
        const PD_BUTTON_RELEASED = 1 << 9;
    }
}

/// Requests to enter any alternate mode.
const ENTER_ANY: DpmFlag = DpmFlag::ENTER_DP.union(DpmFlag::ENTER_TBT).union(DpmFlag::ENTER_USB4);

/// Maximum Attention length: header plus one VDO.
const ATTENTION_MAX_VDO: usize = 2;

/// Alternate modes the platform can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TypecMode {
    /// DisplayPort alternate mode.
    DisplayPort,
    /// Thunderbolt-compat alternate mode.
    Thunderbolt,
    /// USB4.
    Usb4,
}

/// Attention could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttentionError {
    /// One Attention is already pending.
    Busy,
    /// Attention must be one or two VDOs.
    InvalidLength,
}

/// Mode entry could not be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModeEntryError {
    /// Another enter request is still active.
    Busy,
}

/// USB-PD power-button progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum PdButtonState {
    /// No press in flight.
    #[default]
    Idle,
    /// Press seen, release pending.
    Pressed,
}

/// The per-port DPM slice.
#[derive(Debug)]
pub struct PortDpm {
    /// Queued Attention payload, guarded by the request flag.
    attention: Vec<u32, ATTENTION_MAX_VDO>,
    pd_button: PdButtonState,
    /// DisplayPort module.
    pub dp: DisplayPortMode,
    /// Thunderbolt-compat module.
    pub tbt: ThunderboltMode,
    /// USB4 module.
    pub usb4: Usb4Mode,
    /// Attach edge tracking for module resets.
    was_running: bool,
}

impl PortDpm {
    /// Create the slice.
    pub fn new() -> Self {
        Self {
            attention: Vec::new(),
            pd_button: PdButtonState::Idle,
            dp: DisplayPortMode::new(),
            tbt: ThunderboltMode::new(),
            usb4: Usb4Mode::new(),
            was_running: false,
        }
    }

    /// Queue an SVDM Attention message; only one may be pending.
    pub fn request_attention(&mut self, port: &Port, data: &[u32]) -> Result<(), AttentionError> {
        if port.dpm_flags.check_raw(DpmFlag::SEND_ATTENTION.bits()) {
            return Err(AttentionError::Busy);
        }
        if data.is_empty() || data.len() > ATTENTION_MAX_VDO {
            return Err(AttentionError::InvalidLength);
        }

        self.attention = Vec::from_slice(data).map_err(|_| AttentionError::InvalidLength)?;
        port.dpm_flags.set_raw(DpmFlag::SEND_ATTENTION.bits());
        Ok(())
    }

    /// Record an AP mode-entry request.
    pub fn request_enter_mode(&mut self, port: &Port, mode: TypecMode) -> Result<(), ModeEntryError> {
        if port.dpm_flags.check_raw(ENTER_ANY.bits()) {
            return Err(ModeEntryError::Busy);
        }

        let flag = match mode {
            TypecMode::DisplayPort => DpmFlag::ENTER_DP,
            TypecMode::Thunderbolt => DpmFlag::ENTER_TBT,
            TypecMode::Usb4 => DpmFlag::ENTER_USB4,
        };
        port.dpm_flags.set_raw(flag.bits());
        port.dpm_flags
            .clear_raw((DpmFlag::MODE_ENTRY_DONE | DpmFlag::EXIT_REQUEST | DpmFlag::DATA_RESET_DONE).bits());
        Ok(())
    }

    /// Record a mode-exit request.
    pub fn set_mode_exit_request(&mut self, port: &Port) {
        port.dpm_flags.set_raw(DpmFlag::EXIT_REQUEST.bits());
        port.dpm_flags.clear_raw(DpmFlag::DATA_RESET_DONE.bits());
    }

    /// Queue a power-state-change Alert toward the partner.
    pub fn queue_power_state_alert(&self, port: &mut Port) {
        port.pending_ado = Some(Ado::new_power_state_change().0);
        port.post_dpm_request(DpmRequest::SEND_ALERT);
    }

    /// Run the per-port DPM slice for one tick.
    pub(crate) fn run<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        pe: &mut PolicyEngine,
        ctx: &mut Ctx<P, B, C>,
    ) {
        // Reset module state across attach cycles.
        let running = pe.is_running();
        if !running {
            if self.was_running {
                self.dp.reset();
                self.tbt.reset();
                self.usb4.reset();
                self.pd_button = PdButtonState::Idle;
                self.attention.clear();
            }
            self.was_running = false;
            return;
        }
        self.was_running = true;

        // Route exchange outcomes back into the modules first. The
        // teardown marker goes before the Data Reset outcome, so a
        // completing Data Reset re-latches its done flag afterwards.
        self.dispatch_vdm_results(pe, ctx);
        self.usb4.note_outcome(pe, ctx);
        if pe.alt_mode_teardown {
            pe.alt_mode_teardown = false;
            self.teardown_modes(ctx);
        }
        if let Some(success) = pe.data_reset_outcome.take() {
            self.data_reset_complete(ctx, success);
        }

        let in_ready = matches!(pe.state(), Some(PeState::SrcReady) | Some(PeState::SnkReady));
        if !in_ready || pe.vdm.is_some() {
            return;
        }

        if ctx.port.data_role == DataRole::Dfp {
            self.run_discovery(pe, ctx);
            if pe.vdm.is_some() {
                return;
            }

            if check(ctx.port, DpmFlag::EXIT_REQUEST) {
                self.attempt_mode_exit(pe, ctx);
            } else if !check(ctx.port, DpmFlag::MODE_ENTRY_DONE) {
                self.attempt_mode_entry(pe, ctx);
            }

            self.run_pd_button(ctx);
        } else if check(ctx.port, DpmFlag::SEND_ATTENTION) {
            self.send_attention(pe, ctx);
        }
    }

    // --- Discovery driver --------------------------------------------

    /// Fetch identity, SVIDs and modes where still needed.
    fn run_discovery<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, pe: &mut PolicyEngine, ctx: &mut Ctx<P, B, C>) {
        // SOP' first: cable knowledge gates mode entry, and cable
        // discovery needs us to own VCONN.
        if ctx.port.check_flag(PeFlag::VCONN_ON) {
            let sop_prime = &ctx.port.discovery[Sop::SopPrime.index()];

            if sop_prime.identity_state == DiscState::Needed {
                if ctx.timers.is_disabled(TimerId::PeDiscoverIdentity)
                    || ctx.timers.is_expired(TimerId::PeDiscoverIdentity, ctx.now)
                {
                    ctx.timers.disable(TimerId::PeDiscoverIdentity);
                    pe.prepare_discover_identity(ctx, Sop::SopPrime);
                    ctx.port.post_dpm_request(DpmRequest::VDM);
                }
                return;
            }

            if sop_prime.identity_state == DiscState::Complete && sop_prime.svids_state == DiscState::Needed {
                pe.prepare_discover_svids(ctx, Sop::SopPrime);
                ctx.port.post_dpm_request(DpmRequest::VDM);
                return;
            }

            if let Some(svid) = next_mode_svid(&ctx.port.discovery[Sop::SopPrime.index()]) {
                pe.prepare_discover_modes(ctx, Sop::SopPrime, svid);
                ctx.port.post_dpm_request(DpmRequest::VDM);
                return;
            }
        }

        let sop = &ctx.port.discovery[Sop::Sop.index()];

        if sop.identity_state == DiscState::Needed {
            pe.prepare_discover_identity(ctx, Sop::Sop);
            ctx.port.post_dpm_request(DpmRequest::VDM);
            return;
        }

        if sop.identity_state == DiscState::Complete && sop.svids_state == DiscState::Needed {
            pe.prepare_discover_svids(ctx, Sop::Sop);
            ctx.port.post_dpm_request(DpmRequest::VDM);
            return;
        }

        if let Some(svid) = next_mode_svid(&ctx.port.discovery[Sop::Sop.index()]) {
            pe.prepare_discover_modes(ctx, Sop::Sop, svid);
            ctx.port.post_dpm_request(DpmRequest::VDM);
        }
    }

    // --- Mode entry fan-out ------------------------------------------

    /// Whether a mode was explicitly requested (or the engine drives
    /// policy itself).
    fn mode_entry_requested<P: ProtocolLayer, B: Board, C: Chipset>(&self, ctx: &Ctx<P, B, C>, flag: DpmFlag) -> bool {
        if !ctx.config.require_ap_mode_entry {
            return true;
        }
        ctx.port.dpm_flags.check_raw(flag.bits())
    }

    fn set_mode_entry_done(&self, port: &Port) {
        port.dpm_flags.set_raw(DpmFlag::MODE_ENTRY_DONE.bits());
        port.dpm_flags.clear_raw(ENTER_ANY.bits());
    }

    /// The policy engine exited every mode (Hard Reset, Data Reset or
    /// ErrorRecovery): drop the module state, return muxed pins to plain
    /// USB and let entry start over from scratch.
    fn teardown_modes<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let was_active = self.dp.is_active() || self.tbt.is_active() || self.usb4.is_active();

        self.usb4.exit_mode_request(ctx);
        self.dp.reset();
        self.tbt.reset();

        if was_active {
            let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
            ctx.board.mux_set(ctx.port.id, MuxMode::Usb, flipped);
        }

        ctx.port.dpm_flags.clear_raw(
            (DpmFlag::MODE_ENTRY_DONE | DpmFlag::DATA_RESET_REQUESTED | DpmFlag::DATA_RESET_DONE).bits(),
        );
    }

    fn data_reset_complete<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>, success: bool) {
        ctx.port.dpm_flags.clear_raw(DpmFlag::DATA_RESET_REQUESTED.bits());
        if success {
            ctx.port.dpm_flags.set_raw(DpmFlag::DATA_RESET_DONE.bits());
            ctx.port.dpm_flags.clear_raw(DpmFlag::MODE_ENTRY_DONE.bits());
            self.dp.reset();
            self.tbt.reset();
            self.usb4.reset();
        } else {
            self.set_mode_entry_done(ctx.port);
        }
    }

    /// One cycle of the entry sequence: USB4, then Thunderbolt, then
    /// DisplayPort, one VDM at a time.
    fn attempt_mode_entry<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, pe: &mut PolicyEngine, ctx: &mut Ctx<P, B, C>) {
        // Mode state desyncs while the AP sleeps; do not enter then.
        if ctx.config.require_ap_mode_entry && ctx.chipset.state() == ChipsetState::HardOff {
            return;
        }

        let discovery = &ctx.port.discovery[Sop::Sop.index()];
        if !discovery.complete() {
            return;
        }

        if self.dp.entry_is_done() || self.tbt.entry_is_done() || self.usb4.entry_is_done() {
            self.set_mode_entry_done(ctx.port);
            return;
        }

        // Sequencing with safe state requires the mux to have settled.
        if !ctx.board.mux_set_completed(ctx.port.id) {
            return;
        }

        // AP-driven platforms run Data Reset once before any entry.
        if ctx.config.require_ap_mode_entry
            && ctx.config.data_reset_supported
            && ctx.port.dpm_flags.check_raw(ENTER_ANY.bits())
            && !check(ctx.port, DpmFlag::DATA_RESET_REQUESTED)
            && !check(ctx.port, DpmFlag::DATA_RESET_DONE)
        {
            if data_reset_allowed(ctx) {
                ctx.port.dpm_flags.set_raw(DpmFlag::DATA_RESET_REQUESTED.bits());
                ctx.port.post_dpm_request(DpmRequest::DATA_RESET);
            } else {
                ctx.port.dpm_flags.set_raw(DpmFlag::DATA_RESET_DONE.bits());
            }
            return;
        }
        if ctx.config.require_ap_mode_entry
            && ctx.config.data_reset_supported
            && !check(ctx.port, DpmFlag::DATA_RESET_DONE)
        {
            return;
        }

        // USB4 first, when the port, partner and cable all qualify.
        if ctx.board.is_tbt_usb4_port(ctx.port.id)
            && Usb4Mode::partner_is_capable(ctx)
            && Usb4Mode::cable_is_capable(ctx)
            && self.mode_entry_requested(ctx, DpmFlag::ENTER_USB4)
        {
            if Usb4Mode::tbt_cable_entry_required(ctx) {
                // Old active cable: TBT on the plugs, then Enter_USB.
                self.tbt.set_cable_only();
                match self.tbt.setup_next_vdm(ctx) {
                    VdmSetup::Ready(sop, data) => {
                        self.forward_vdm(pe, ctx, sop, &data);
                        return;
                    }
                    VdmSetup::MuxWait => return,
                    VdmSetup::Unsupported => {
                        // Cable plugs are in; fall through to Enter_USB.
                    }
                    VdmSetup::Error => {
                        self.set_mode_entry_done(ctx.port);
                        return;
                    }
                }
            }

            if self.usb4.request_entry(pe, ctx) {
                return;
            }
            self.set_mode_entry_done(ctx.port);
            return;
        }

        // Thunderbolt-compat next.
        if ctx.board.is_tbt_usb4_port(ctx.port.id)
            && ThunderboltMode::partner_supports(ctx)
            && self.mode_entry_requested(ctx, DpmFlag::ENTER_TBT)
        {
            match self.tbt.setup_next_vdm(ctx) {
                VdmSetup::Ready(sop, data) => {
                    self.forward_vdm(pe, ctx, sop, &data);
                    return;
                }
                VdmSetup::MuxWait => return,
                VdmSetup::Unsupported | VdmSetup::Error => (),
            }
        }

        // DisplayPort last.
        if DisplayPortMode::partner_supports(ctx) && self.mode_entry_requested(ctx, DpmFlag::ENTER_DP) {
            match self.dp.setup_next_vdm(ctx) {
                VdmSetup::Ready(sop, data) => {
                    self.forward_vdm(pe, ctx, sop, &data);
                    return;
                }
                VdmSetup::MuxWait => return,
                VdmSetup::Unsupported | VdmSetup::Error => (),
            }
        }

        // Nothing applies; stop trying until policy changes.
        self.set_mode_entry_done(ctx.port);
    }

    fn attempt_mode_exit<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, pe: &mut PolicyEngine, ctx: &mut Ctx<P, B, C>) {
        // Data Reset tears down every mode in one stroke.
        if ctx.config.data_reset_supported {
            if !check(ctx.port, DpmFlag::DATA_RESET_REQUESTED) && !check(ctx.port, DpmFlag::DATA_RESET_DONE) {
                ctx.port.dpm_flags.set_raw(DpmFlag::DATA_RESET_REQUESTED.bits());
                ctx.port.post_dpm_request(DpmRequest::DATA_RESET);
                return;
            }
            if !check(ctx.port, DpmFlag::DATA_RESET_DONE) {
                return;
            }
        }

        if self.usb4.is_active() {
            debug!("C{}: USB4 teardown", ctx.id());
            self.usb4.exit_mode_request(ctx);
        }

        if !ctx.board.mux_set_completed(ctx.port.id) {
            return;
        }

        let setup = if self.tbt.is_active() {
            debug!("C{}: TBT teardown", ctx.id());
            self.tbt.exit_mode_request();
            self.tbt.setup_next_vdm(ctx)
        } else if self.dp.is_active() {
            debug!("C{}: DP teardown", ctx.id());
            self.dp.exit_mode_request();
            self.dp.setup_next_vdm(ctx)
        } else {
            self.mode_exit_complete(ctx.port);
            return;
        };

        if let VdmSetup::Ready(sop, data) = setup {
            self.forward_vdm(pe, ctx, sop, &data);
        }
    }

    fn mode_exit_complete(&mut self, port: &Port) {
        port.dpm_flags
            .clear_raw((DpmFlag::MODE_ENTRY_DONE | DpmFlag::EXIT_REQUEST | DpmFlag::SEND_ATTENTION).bits());
        if !self.dp.is_active() && !self.tbt.is_active() && !self.usb4.is_active() {
            port.clear_flag(PeFlag::MODAL_OPERATION);
        }
    }

    fn forward_vdm<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        pe: &mut PolicyEngine,
        ctx: &mut Ctx<P, B, C>,
        sop: Sop,
        data: &[u32],
    ) {
        if pe.prepare_dpm_vdm(sop, data, true) {
            ctx.port.post_dpm_request(DpmRequest::VDM);
        } else {
            self.set_mode_entry_done(ctx.port);
        }
    }

    // --- VDM outcome routing -----------------------------------------

    fn dispatch_vdm_results<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        pe: &mut PolicyEngine,
        ctx: &mut Ctx<P, B, C>,
    ) {
        let Some(result) = pe.take_vdm_result() else {
            return;
        };

        match result {
            VdmResult::Ack(sop, objects) => {
                let header = VdmHeader(objects.first().copied().unwrap_or(0));

                // Partner-initiated Attention lands here too.
                if header.command() == Some(VdmCommand::Attention)
                    && header.command_type() == VdmCommandType::InitiatorReq
                {
                    if header.standard_or_vid() == vdm::DP_SID {
                        self.dp.attention(ctx, &objects);
                    }
                    return;
                }

                match header.standard_or_vid() {
                    vdm::DP_SID => self.dp.vdm_acked(ctx, sop, &objects),
                    vdm::INTEL_VID => self.tbt.vdm_acked(ctx, sop, &objects),
                    svid => {
                        debug!("C{}: unexpected VDM ACK for SVID {:x}", ctx.id(), svid);
                    }
                }
            }
            VdmResult::Nak(_sop, svid, command) => match svid {
                vdm::DP_SID => self.dp.vdm_naked(ctx, command),
                vdm::INTEL_VID => self.tbt.vdm_naked(ctx, command),
                svid => {
                    debug!("C{}: unexpected VDM NAK for SVID {:x}", ctx.id(), svid);
                }
            },
        }
    }

    // --- Attention ---------------------------------------------------

    fn send_attention<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, pe: &mut PolicyEngine, ctx: &mut Ctx<P, B, C>) {
        let version = if ctx.rev(Sop::Sop) == usbpd_drp_traits::PdRev::R2_0 {
            SvdmVersion::V10
        } else {
            SvdmVersion::V20
        };

        // The queued payload may already carry its header; a bare VDO
        // gets the standard Attention header prepended.
        let mut data: Vec<u32, 7> = Vec::new();
        let first = VdmHeader(self.attention.first().copied().unwrap_or(0));
        if first.command() != Some(VdmCommand::Attention) {
            let header = VdmHeader::new_request(vdm::DP_SID, version, VdmCommand::Attention).with_object_position(1);
            let _ = data.push(header.0);
        }
        for vdo in &self.attention {
            let _ = data.push(*vdo);
        }

        // Attention never gets a response.
        if pe.prepare_dpm_vdm(Sop::Sop, &data, false) {
            ctx.port.post_dpm_request(DpmRequest::VDM);
        }
        ctx.port.dpm_flags.clear_raw(DpmFlag::SEND_ATTENTION.bits());
        self.attention.clear();
    }

    // --- USB-PD power button -----------------------------------------

    fn run_pd_button<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        let pressed = check(ctx.port, DpmFlag::PD_BUTTON_PRESSED);
        let released = check(ctx.port, DpmFlag::PD_BUTTON_RELEASED);

        // Press and release together cannot be ordered; drop both.
        if pressed && released {
            ctx.port
                .dpm_flags
                .clear_raw((DpmFlag::PD_BUTTON_PRESSED | DpmFlag::PD_BUTTON_RELEASED).bits());
            ctx.timers.disable(TimerId::DpmPdButtonShortPress);
            ctx.timers.disable(TimerId::DpmPdButtonLongPress);
            self.pd_button = PdButtonState::Idle;
            return;
        }

        match self.pd_button {
            PdButtonState::Idle => {
                if pressed {
                    ctx.timers
                        .enable(TimerId::DpmPdButtonShortPress, ctx.now, times::PD_BUTTON_SHORT_PRESS_MAX_US);
                    ctx.timers
                        .enable(TimerId::DpmPdButtonLongPress, ctx.now, times::PD_BUTTON_LONG_PRESS_MAX_US);
                    self.pd_button = PdButtonState::Pressed;
                }
            }
            PdButtonState::Pressed => {
                if pressed {
                    // A repeated press restarts the window.
                    ctx.timers
                        .enable(TimerId::DpmPdButtonShortPress, ctx.now, times::PD_BUTTON_SHORT_PRESS_MAX_US);
                    ctx.timers
                        .enable(TimerId::DpmPdButtonLongPress, ctx.now, times::PD_BUTTON_LONG_PRESS_MAX_US);
                } else if ctx.timers.is_expired(TimerId::DpmPdButtonLongPress, ctx.now) {
                    // Held past the long window: a stuck button.
                    ctx.timers.disable(TimerId::DpmPdButtonShortPress);
                    ctx.timers.disable(TimerId::DpmPdButtonLongPress);
                    self.pd_button = PdButtonState::Idle;
                } else if released {
                    if ctx.chipset.state().is_off() {
                        ctx.chipset.power_on();
                    } else if ctx.timers.is_expired(TimerId::DpmPdButtonShortPress, ctx.now) {
                        ctx.chipset.force_shutdown();
                    } else {
                        ctx.chipset.simulate_power_button_press();
                    }
                    ctx.timers.disable(TimerId::DpmPdButtonShortPress);
                    ctx.timers.disable(TimerId::DpmPdButtonLongPress);
                    self.pd_button = PdButtonState::Idle;
                }
            }
        }

        ctx.port
            .dpm_flags
            .clear_raw((DpmFlag::PD_BUTTON_PRESSED | DpmFlag::PD_BUTTON_RELEASED).bits());
    }
}

impl Default for PortDpm {
    fn default() -> Self {
        Self::new()
    }
}

/// Alert reception: feed power-button events into the DPM flags.
pub(crate) fn handle_alert<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &mut Ctx<P, B, C>, ado: Ado) {
    match ado.extended_alert_event() {
        Some(ExtendedAlertType::PowerButtonPress) if ctx.port.data_role == DataRole::Dfp => {
            ctx.port.dpm_flags.set_raw(DpmFlag::PD_BUTTON_PRESSED.bits());
        }
        Some(ExtendedAlertType::PowerButtonRelease) if ctx.port.data_role == DataRole::Dfp => {
            ctx.port.dpm_flags.set_raw(DpmFlag::PD_BUTTON_RELEASED.bits());
        }
        other => {
            debug!("C{}: alert {:?}", ctx.id(), other);
        }
    }
}

/// Data Reset is only initiated toward partners that will answer it:
/// USB4-capable or alternate-mode-capable hubs and peripherals.
fn data_reset_allowed<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
    use crate::message::vdm::{IdHeader, ProductTypeUfp, UfpVdo};

    let discovery = &ctx.port.discovery[Sop::Sop.index()];
    let Some(id_header) = discovery.identity.first().map(|raw| IdHeader(*raw)) else {
        return false;
    };

    if !matches!(
        id_header.product_type_ufp(),
        ProductTypeUfp::Hub | ProductTypeUfp::Peripheral
    ) {
        return false;
    }

    discovery
        .identity
        .get(3)
        .map(|raw| {
            let vdo = UfpVdo(*raw);
            vdo.usb4_device_capable() || vdo.supports_alternate_modes()
        })
        .unwrap_or(false)
}

/// The next SVID whose modes are still unfetched, if SVIDs are known.
fn next_mode_svid(discovery: &crate::port::Discovery) -> Option<u16> {
    if discovery.svids_state != DiscState::Complete || discovery.modes_state != DiscState::Needed {
        return None;
    }

    discovery
        .svids
        .iter()
        .find(|svid| discovery.modes_for(**svid).is_none())
        .copied()
}

fn check(port: &Port, flag: DpmFlag) -> bool {
    port.dpm_flags.check_raw(flag.bits())
}

#[cfg(test)]
mod tests {
    use super::{DpmFlag, PortDpm, handle_alert};
    use crate::dummy::Bench;
    use crate::message::alert::{Ado, ExtendedAlertType};
    use crate::message::vdm::{VdmCommand, VdmHeader};
    use crate::pe::{PeState, PolicyEngine};
    use crate::port::{DiscState, DpmRequest};
    use crate::times;
    use crate::DataRole;
    use usbpd_drp_traits::{ProtocolLayer, Sop};

    /// A ready DFP whose partner discovery already concluded, so the
    /// discovery driver stays out of the way.
    fn ready_dfp() -> (PortDpm, PolicyEngine, Bench) {
        let mut bench = Bench::new();
        bench.port.data_role = DataRole::Dfp;
        bench.prl.start(0, usbpd_drp_traits::PdRev::R3_1);

        let discovery = &mut bench.port.discovery[Sop::Sop.index()];
        discovery.identity_state = DiscState::Fail;
        discovery.svids_state = DiscState::Fail;
        discovery.modes_state = DiscState::Fail;

        let mut pe = PolicyEngine::new();
        pe.force_state(PeState::SrcReady);

        (PortDpm::new(), pe, bench)
    }

    fn press_ado() -> Ado {
        Ado(0)
            .with_extended_alert(true)
            .with_extended_alert_type(ExtendedAlertType::PowerButtonPress.into())
    }

    fn release_ado() -> Ado {
        Ado(0)
            .with_extended_alert(true)
            .with_extended_alert_type(ExtendedAlertType::PowerButtonRelease.into())
    }

    #[test]
    fn short_press_simulates_power_button() {
        let (mut dpm, mut pe, mut bench) = ready_dfp();

        handle_alert(&mut bench.ctx(0), press_ado());
        dpm.run(&mut pe, &mut bench.ctx(0));

        handle_alert(&mut bench.ctx(1_000), release_ado());
        dpm.run(&mut pe, &mut bench.ctx(1_000));

        assert_eq!(bench.chipset.button_presses, 1);
        assert_eq!(bench.chipset.shutdowns, 0);
    }

    #[test]
    fn long_press_forces_shutdown() {
        let (mut dpm, mut pe, mut bench) = ready_dfp();

        handle_alert(&mut bench.ctx(0), press_ado());
        dpm.run(&mut pe, &mut bench.ctx(0));

        let held = times::PD_BUTTON_SHORT_PRESS_MAX_US + 1_000;
        handle_alert(&mut bench.ctx(held), release_ado());
        dpm.run(&mut pe, &mut bench.ctx(held));

        assert_eq!(bench.chipset.shutdowns, 1);
        assert_eq!(bench.chipset.button_presses, 0);
    }

    #[test]
    fn press_when_off_wakes_the_chipset() {
        let (mut dpm, mut pe, mut bench) = ready_dfp();
        bench.chipset.state = usbpd_drp_traits::ChipsetState::SoftOff;

        handle_alert(&mut bench.ctx(0), press_ado());
        dpm.run(&mut pe, &mut bench.ctx(0));
        handle_alert(&mut bench.ctx(1_000), release_ado());
        dpm.run(&mut pe, &mut bench.ctx(1_000));

        assert_eq!(bench.chipset.power_ons, 1);
    }

    #[test]
    fn simultaneous_press_and_release_resets_the_machine() {
        let (mut dpm, mut pe, mut bench) = ready_dfp();

        handle_alert(&mut bench.ctx(0), press_ado());
        handle_alert(&mut bench.ctx(0), release_ado());
        dpm.run(&mut pe, &mut bench.ctx(0));

        assert_eq!(bench.chipset.button_presses, 0);
        assert_eq!(bench.chipset.power_ons, 0);
        assert_eq!(bench.chipset.shutdowns, 0);
    }

    #[test]
    fn only_one_attention_may_be_pending() {
        let mut bench = Bench::new();
        bench.port.data_role = DataRole::Ufp;
        let mut dpm = PortDpm::new();

        assert!(dpm.request_attention(&bench.port, &[0x1234]).is_ok());
        assert!(dpm.request_attention(&bench.port, &[0x5678]).is_err());
        // Zero or oversized payloads are refused outright.
        assert!(PortDpm::new().request_attention(&bench.port, &[]).is_err());
    }

    #[test]
    fn attention_is_forwarded_once_to_the_policy_engine() {
        let mut bench = Bench::new();
        bench.port.data_role = DataRole::Ufp;
        bench.prl.start(0, usbpd_drp_traits::PdRev::R3_1);

        let mut pe = PolicyEngine::new();
        pe.force_state(PeState::SnkReady);
        let mut dpm = PortDpm::new();

        dpm.request_attention(&bench.port, &[0xABCD]).unwrap();
        dpm.run(&mut pe, &mut bench.ctx(0));

        // The exchange is queued on the engine with the standard header.
        assert!(bench.port.check_dpm_request(DpmRequest::VDM));
        let exchange = pe.vdm.as_ref().expect("attention queued");
        let header = VdmHeader(exchange.data[0]);
        assert_eq!(header.command(), Some(VdmCommand::Attention));
        assert!(!exchange.response_expected);

        // The pending flag cleared; a second run queues nothing new.
        assert!(!bench.port.dpm_flags.check_raw(DpmFlag::SEND_ATTENTION.bits()));
    }

    #[test]
    fn hard_reset_tears_down_mode_state() {
        use crate::port::PeFlag;

        let (mut dpm, mut pe, mut bench) = ready_dfp();

        // A previous cycle left DP concluded and entry marked done.
        dpm.dp.vdm_naked(&mut bench.ctx(0), None);
        bench
            .port
            .dpm_flags
            .set_raw((DpmFlag::MODE_ENTRY_DONE | DpmFlag::DATA_RESET_DONE).bits());
        bench.port.set_flag(PeFlag::MODAL_OPERATION);
        assert!(dpm.dp.entry_is_done());

        // Hard Reset exits every alternate mode unconditionally.
        pe.exit_all_modes(&mut bench.ctx(0));
        assert!(!bench.port.check_flag(PeFlag::MODAL_OPERATION));

        dpm.run(&mut pe, &mut bench.ctx(1_000));

        // The module state and the entry bookkeeping start over.
        assert!(!pe.alt_mode_teardown);
        assert!(!dpm.dp.entry_is_done());
        assert!(!bench
            .port
            .dpm_flags
            .check_raw((DpmFlag::MODE_ENTRY_DONE | DpmFlag::DATA_RESET_DONE).bits()));
    }

    #[test]
    fn discovery_driver_starts_with_partner_identity() {
        let mut bench = Bench::new();
        bench.port.data_role = DataRole::Dfp;
        bench.prl.start(0, usbpd_drp_traits::PdRev::R3_1);

        let mut pe = PolicyEngine::new();
        pe.force_state(PeState::SrcReady);
        let mut dpm = PortDpm::new();

        dpm.run(&mut pe, &mut bench.ctx(0));

        assert!(bench.port.check_dpm_request(DpmRequest::VDM));
        let exchange = pe.vdm.as_ref().expect("discovery queued");
        assert_eq!(exchange.sop, Sop::Sop);
        let header = VdmHeader(exchange.data[0]);
        assert_eq!(header.command(), Some(VdmCommand::DiscoverIdentity));

        // Nothing else is attempted while the exchange is in flight.
        dpm.run(&mut pe, &mut bench.ctx(1_000));
        assert!(pe.vdm.is_some());
    }
}
