//! The engine that owns every port's state machines and fans collaborator
//! callbacks into them.
//!
//! One cooperatively-scheduled task per port calls [`Engine::run_port`]
//! and sleeps for [`Engine::next_wake`] between ticks. The protocol layer
//! interrupt path calls the `message_*` / `report_error` entry points,
//! which only touch atomic flags and the per-port mailbox.
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, PdRev, PrlErrorKind, ProtocolLayer, RpValue, Sop};

use crate::dpm::{self, PortDpm, SharedPolicy};
use crate::message::RxMessage;
use crate::pe::PolicyEngine;
use crate::port::{DpmRequest, EventBits, PeFlag, Port};
use crate::tc::TypeC;
use crate::timer::PdTimers;
use crate::{CcState, PowerRole};

/// Build-time engine policy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefer the source role on attach (Try.SRC).
    pub try_src: bool,
    /// Toggle between Rp and Rd while unattached.
    pub drp_toggle: bool,
    /// Allow handing the toggle to TCPC hardware and dropping to LPM.
    pub auto_toggle: bool,
    /// Default Rp advertisement.
    pub default_rp: RpValue,
    /// Number of ports that may claim 3 A simultaneously.
    pub ports_3a: usize,
    /// Whether fast role swap is supported at all.
    pub frs_capable: bool,
    /// Mode entry waits for an AP request instead of self-driving.
    pub require_ap_mode_entry: bool,
    /// Whether Data Reset is sent before (AP-driven) mode entry.
    pub data_reset_supported: bool,
    /// Source PDOs advertised while limited to 1.5 A.
    pub src_pdos: Vec<u32, 7>,
    /// Source PDOs advertised while holding a 3 A claim.
    pub src_pdos_max: Vec<u32, 7>,
    /// Sink PDOs advertised in Sink_Capabilities.
    pub snk_pdos: Vec<u32, 7>,
    /// Identity VDOs returned to Discover Identity (ID header first);
    /// empty means the request is NAKed.
    pub identity_vdos: Vec<u32, 6>,
}

impl Default for Config {
    fn default() -> Self {
        use crate::message::pdo::FixedSupply;

        let pdo_1a5 = FixedSupply::default()
            .with_raw_voltage(100)
            .with_raw_max_current(150)
            .with_dual_role_power(true)
            .with_dual_role_data(true)
            .0;
        let pdo_3a0 = FixedSupply::default()
            .with_raw_voltage(100)
            .with_raw_max_current(300)
            .with_dual_role_power(true)
            .with_dual_role_data(true)
            .0;

        Self {
            try_src: false,
            drp_toggle: true,
            auto_toggle: true,
            default_rp: RpValue::Rp1A5,
            ports_3a: 1,
            frs_capable: cfg!(feature = "frs"),
            require_ap_mode_entry: false,
            data_reset_supported: true,
            src_pdos: Vec::from_slice(&[pdo_1a5]).unwrap(),
            src_pdos_max: Vec::from_slice(&[pdo_3a0]).unwrap(),
            snk_pdos: Vec::from_slice(&[pdo_3a0]).unwrap(),
            identity_vdos: Vec::new(),
        }
    }
}

/// Borrow bundle handed to every state function.
pub(crate) struct Ctx<'a, P: ProtocolLayer, B: Board, C: Chipset> {
    /// Monotonic time of this tick, microseconds.
    pub now: u64,
    /// The port's shared state.
    pub port: &'a mut Port,
    /// The port's timer table.
    pub timers: &'a mut PdTimers,
    /// The protocol layer black box.
    pub prl: &'a mut P,
    /// Board electricals.
    pub board: &'a mut B,
    /// Application processor collaborator.
    pub chipset: &'a mut C,
    /// Engine policy.
    pub config: &'a Config,
    /// Cross-port shared-current policy.
    pub shared: &'a SharedPolicy,
}

impl<P: ProtocolLayer, B: Board, C: Chipset> Ctx<'_, P, B, C> {
    /// The port index.
    pub fn id(&self) -> usize {
        self.port.id
    }

    /// Latch host events and notify the chipset about the new ones.
    pub fn notify_event(&mut self, event: EventBits) {
        let new = self.port.latch_event(event);
        for bit in new.iter() {
            if let Some(status_event) = bit.status_event() {
                self.chipset.notify_event(self.port.id, status_event);
            }
        }
    }

    /// Whether vBus is at a valid supply level.
    pub fn vbus_present(&mut self) -> bool {
        self.board.vbus_at_level(self.port.id, usbpd_drp_traits::VbusLevel::Present)
    }

    /// The negotiated revision on a SOP class.
    pub fn rev(&self, sop: Sop) -> PdRev {
        self.prl.get_rev(self.port.id, sop)
    }
}

struct PortUnit {
    port: Port,
    timers: PdTimers,
    tc: TypeC,
    pe: PolicyEngine,
    dpm: PortDpm,
}

impl PortUnit {
    fn new(id: usize) -> Self {
        Self {
            port: Port::new(id),
            timers: PdTimers::new(),
            tc: TypeC::new(),
            pe: PolicyEngine::new(),
            dpm: PortDpm::new(),
        }
    }
}

/// The multi-port protocol engine.
pub struct Engine<P: ProtocolLayer, B: Board, C: Chipset, const N: usize> {
    prl: P,
    board: B,
    chipset: C,
    config: Config,
    ports: Vec<PortUnit, N>,
    shared: SharedPolicy,
    /// Pokes the task loop when a collaborator delivered work.
    wake: embassy_sync::signal::Signal<embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex, ()>,
}

impl<P: ProtocolLayer, B: Board, C: Chipset, const N: usize> Engine<P, B, C, N> {
    /// Create an engine for `N` ports.
    pub fn new(prl: P, board: B, chipset: C, config: Config) -> Self {
        let mut ports = Vec::new();
        for id in 0..N {
            // Capacity is N.
            let _ = ports.push(PortUnit::new(id));
        }

        let shared = SharedPolicy::new(config.default_rp);

        Self {
            prl,
            board,
            chipset,
            config,
            ports,
            shared,
            wake: embassy_sync::signal::Signal::new(),
        }
    }

    /// Drive every port cooperatively; never returns.
    ///
    /// Each pass ticks all ports, then sleeps until the earliest timer
    /// deadline or until a collaborator entry point posts new work.
    /// Boards that run one task per port can skip this and call
    /// [`Self::run_port`] / [`Self::next_wake`] from their own loops.
    pub async fn run<T: usbpd_drp_traits::Timer, K: usbpd_drp_traits::Clock>(&mut self, clock: &K) {
        use embassy_futures::select::{Either, select};

        // Poll at least this often: CC sampling has no interrupt here.
        const MAX_SLEEP_US: u64 = 10_000;

        loop {
            let now = clock.now_us();
            let mut sleep_us = MAX_SLEEP_US;

            for port in 0..self.ports.len() {
                self.run_port(port, now);
                if let Some(delta) = self.next_wake(port, now) {
                    sleep_us = sleep_us.min(delta.max(1));
                }
                if self.has_pending_work(port) {
                    sleep_us = 1;
                }
            }

            match select(T::after_micros(sleep_us), self.wake.wait()).await {
                Either::First(()) => (),
                Either::Second(()) => (),
            }
        }
    }

    /// Run one tick of a port's state machines.
    ///
    /// Out-of-range ports are a programmer error.
    pub fn run_port(&mut self, port: usize, now_us: u64) {
        let unit = &mut self.ports[port];

        {
            let mut ctx = Ctx {
                now: now_us,
                port: &mut unit.port,
                timers: &mut unit.timers,
                prl: &mut self.prl,
                board: &mut self.board,
                chipset: &mut self.chipset,
                config: &self.config,
                shared: &self.shared,
            };

            unit.tc.run(&mut ctx);

            if unit.tc.pd_enabled() {
                unit.pe.run(&mut ctx);
            } else {
                unit.pe.ensure_stopped(&mut ctx);
            }

            unit.dpm.run(&mut unit.pe, &mut ctx);

            ctx.timers.manage_expired(now_us);
        }

        // Cross-port arbitration runs on whichever task triggered it.
        dpm::balance_source_ports(
            self.ports.iter().map(|unit| &unit.port),
            &self.config,
            &self.shared,
            now_us,
        );
    }

    /// Microseconds until the next timer deadline on a port.
    pub fn next_wake(&self, port: usize, now_us: u64) -> Option<u64> {
        self.ports[port].timers.next_expiration(now_us)
    }


    /// Wake the task loop.
    fn kick(&self) {
        self.wake.signal(());
    }

    /// Whether a port has unconsumed work (besides timers).
    pub fn has_pending_work(&self, port: usize) -> bool {
        let port = &self.ports[port].port;
        port.check_flag(
            PeFlag::MSG_RECEIVED | PeFlag::TX_COMPLETE | PeFlag::PROTOCOL_ERROR | PeFlag::CHECK_CONNECTION,
        ) || port.dpm_request.snapshot_raw() != 0
    }

    // --- Protocol layer entry points ---------------------------------

    /// A complete message arrived on `sop`.
    pub fn message_received(&mut self, port: usize, sop: Sop, data: &[u8]) {
        match RxMessage::from_bytes(sop, data) {
            Ok(message) => {
                let unit = &mut self.ports[port];
                unit.port.rx = Some(message);
                unit.port.set_flag(PeFlag::MSG_RECEIVED);
                self.kick();
            }
            Err(parse_error) => {
                warn!("C{}: dropping unparseable message: {:?}", port, parse_error);
                self.ports[port].port.set_flag(PeFlag::PROTOCOL_ERROR);
            }
        }
    }

    /// The last transmit reached GoodCRC.
    pub fn message_sent(&mut self, port: usize) {
        self.ports[port].port.set_flag(PeFlag::TX_COMPLETE);
        self.kick();
    }

    /// The last transmit was pre-empted by an inbound message.
    pub fn message_discarded(&mut self, port: usize) {
        self.ports[port].port.set_flag(PeFlag::MSG_DISCARDED);
        self.kick();
    }

    /// The protocol layer reported an asynchronous error.
    pub fn report_error(&mut self, port: usize, kind: PrlErrorKind, sop: Sop) {
        let unit = &mut self.ports[port];
        match kind {
            // The protocol layer retries chunk waits on its own.
            PrlErrorKind::RchChunkWaitTimeout => (),
            PrlErrorKind::TchTransmit => unit.pe.note_tch_error(sop),
            PrlErrorKind::Protocol => unit.port.set_flag(PeFlag::PROTOCOL_ERROR),
        }
        self.kick();
    }

    /// Hard Reset ordered sets were seen on the wire.
    pub fn hard_reset_received(&mut self, port: usize) {
        self.ports[port].pe.hard_reset_received();
        self.kick();
    }

    /// Our Hard Reset signaling completed.
    pub fn hard_reset_sent(&mut self, port: usize) {
        self.ports[port].pe.hard_reset_sent();
        self.kick();
    }

    /// The PHY detected the fast-role-swap K-code.
    pub fn frs_signaled(&mut self, port: usize) {
        self.ports[port].port.set_flag(PeFlag::FAST_ROLE_SWAP_SIGNALED);
        self.kick();
    }

    // --- Host / platform entry points --------------------------------

    /// Mark a port suspended or resumed; the port task acknowledges by
    /// entering the disabled state and raising [`PeFlag::SUSPENDED`].
    pub fn set_suspend(&mut self, port: usize, suspend: bool) {
        let unit = &self.ports[port];
        if suspend {
            unit.port.post_dpm_request(DpmRequest::SUSPEND);
        } else {
            unit.port.clear_dpm_request(DpmRequest::SUSPEND);
        }
        self.kick();
    }

    /// Whether a suspend request has been acknowledged.
    pub fn is_suspended(&self, port: usize) -> bool {
        self.ports[port].port.check_flag(PeFlag::SUSPENDED)
    }

    /// Request ErrorRecovery on a port.
    pub fn set_error_recovery(&mut self, port: usize) {
        self.ports[port].port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
    }

    /// Request a power-role swap.
    pub fn request_pr_swap(&mut self, port: usize) {
        self.ports[port].port.post_dpm_request(DpmRequest::PR_SWAP);
    }

    /// Request a data-role swap.
    pub fn request_dr_swap(&mut self, port: usize) {
        self.ports[port].port.post_dpm_request(DpmRequest::DR_SWAP);
    }

    /// Request a VCONN swap.
    pub fn request_vconn_swap(&mut self, port: usize) {
        self.ports[port].port.post_dpm_request(DpmRequest::VCONN_SWAP);
    }

    /// Queue an SVDM Attention message (UFP role).
    pub fn request_vdm_attention(&mut self, port: usize, data: &[u32]) -> Result<(), dpm::AttentionError> {
        let unit = &mut self.ports[port];
        unit.dpm.request_attention(&unit.port, data)
    }

    /// Request entry into an alternate mode (AP-driven policy).
    pub fn request_enter_mode(&mut self, port: usize, mode: dpm::TypecMode) -> Result<(), dpm::ModeEntryError> {
        let unit = &mut self.ports[port];
        unit.dpm.request_enter_mode(&unit.port, mode)
    }

    /// Request exit from all active alternate modes.
    pub fn request_exit_modes(&mut self, port: usize) {
        let unit = &mut self.ports[port];
        unit.dpm.set_mode_exit_request(&unit.port);
    }

    /// A non-PD sink attached; consider it for a 3 A grant.
    pub fn add_non_pd_sink(&mut self, port: usize) {
        dpm::add_non_pd_sink(&self.shared, &self.config, port);
    }

    /// The chipset moved between S0/S3/S5-G3; alert partners.
    pub fn chipset_power_state_changed(&mut self) {
        for unit in self.ports.iter_mut() {
            if unit.port.check_flag(PeFlag::EXPLICIT_CONTRACT) {
                unit.dpm.queue_power_state_alert(&mut unit.port);
            }
        }
        self.kick();
    }

    /// The source current available to the platform charger, in mA.
    pub fn source_current_ma(&self, port: usize) -> u32 {
        let unit = &self.ports[port];
        if unit.port.power_role == PowerRole::Sink {
            return 0;
        }

        dpm::source_current_ma(&self.shared, &self.config, port)
    }

    /// The partner classification on a port.
    pub fn cc_state(&self, port: usize) -> CcState {
        self.ports[port].port.cc_state
    }

    /// The explicit contract on a port, if any.
    pub fn contract(&self, port: usize) -> Option<crate::port::Contract> {
        self.ports[port].port.contract
    }

    /// Direct access to a port's state, for tests and diagnostics.
    #[cfg(test)]
    pub(crate) fn unit(&mut self, port: usize) -> (&mut Port, &mut PdTimers, &mut TypeC, &mut PolicyEngine) {
        let unit = &mut self.ports[port];
        (&mut unit.port, &mut unit.timers, &mut unit.tc, &mut unit.pe)
    }

    /// Direct access to the collaborators, for tests.
    #[cfg(test)]
    pub(crate) fn collaborators(&mut self) -> (&mut P, &mut B, &mut C) {
        (&mut self.prl, &mut self.board, &mut self.chipset)
    }
}

#[cfg(test)]
mod tests {
    use usbpd_drp_traits::{CcLevel, Sop};

    use super::{Config, Engine};
    use crate::dummy::{FakeBoard, FakeChipset, FakePrl, caps_5v3a};
    use crate::message::header::{ControlMessageType, DataMessageType, Header, SpecRevision};
    use crate::pe::PeState;
    use crate::tc::TcState;
    use crate::times;
    use crate::{DataRole, PowerRole};

    type TestEngine = Engine<FakePrl, FakeBoard, FakeChipset, 2>;

    fn new_engine() -> TestEngine {
        Engine::new(FakePrl::new(), FakeBoard::new(), FakeChipset::new(), Config::default())
    }

    /// Serialize a partner message to wire bytes.
    fn wire(msg_type_raw: u8, objects: &[u32], message_id: u8) -> std::vec::Vec<u8> {
        use byteorder::{ByteOrder, LittleEndian};

        let header = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecRevision::R3_X)
            .with_message_id(message_id)
            .with_message_type_raw(msg_type_raw)
            .with_num_objects(objects.len() as u8);

        let mut bytes = std::vec![0u8; 2 + objects.len() * 4];
        header.to_bytes(&mut bytes);
        for (index, object) in objects.iter().enumerate() {
            LittleEndian::write_u32(&mut bytes[2 + index * 4..6 + index * 4], *object);
        }
        bytes
    }

    /// Walk port 0 from boot to Attached.SNK with PD running.
    fn attach_as_sink(engine: &mut TestEngine) -> u64 {
        engine.run_port(0, 0);

        let mut now = times::T_ERROR_RECOVERY_US + 1_000;
        engine.run_port(0, now);
        {
            let (_, board, _) = engine.collaborators();
            board.cc = (CcLevel::Rp3A0, CcLevel::Open);
            board.vbus_present = true;
        }

        now += 1_000;
        engine.run_port(0, now);
        now += 1_000;
        engine.run_port(0, now);
        now += times::T_CC_DEBOUNCE_US + 1_000;
        engine.run_port(0, now);

        let (_, _, tc, _) = engine.unit(0);
        assert_eq!(tc.state(), Some(TcState::AttachedSnk));
        now
    }

    #[test]
    fn sink_contract_end_to_end() {
        let mut engine = new_engine();
        let mut now = attach_as_sink(&mut engine);

        // The policy engine is waiting for the source advertisement.
        now += 1_000;
        engine.run_port(0, now);
        {
            let (_, _, _, pe) = engine.unit(0);
            assert_eq!(pe.state(), Some(PeState::SnkWaitForCapabilities));
        }

        // Source_Capabilities: 5 V at 3 A, unconstrained.
        engine.message_received(0, Sop::Sop, &wire(DataMessageType::SourceCapabilities as u8, &[caps_5v3a()], 0));
        now += 1_000;
        engine.run_port(0, now);
        now += 1_000;
        engine.run_port(0, now);

        // The engine requested PDO 1 at 3 A.
        {
            let (prl, _, _) = engine.collaborators();
            let request = prl.take_sent().expect("request sent");
            match request {
                crate::dummy::Sent::Data(Sop::Sop, t, objects) => {
                    assert_eq!(t, DataMessageType::Request as u8);
                    assert_eq!((objects[0] >> 28) & 0xF, 1);
                    assert_eq!((objects[0] >> 10) & 0x3FF, 300);
                }
                other => panic!("expected Request, sent {:?}", other),
            }
        }

        engine.message_sent(0);
        engine.message_received(0, Sop::Sop, &wire(ControlMessageType::Accept as u8, &[], 1));
        now += 1_000;
        engine.run_port(0, now);

        engine.message_received(0, Sop::Sop, &wire(ControlMessageType::PsRdy as u8, &[], 2));
        now += 1_000;
        engine.run_port(0, now);

        let contract = engine.contract(0).expect("explicit contract");
        assert_eq!(contract.pdo_index, 1);
        assert_eq!(contract.mv, 5000);
        assert_eq!(contract.ma, 3000);

        // The charger ceiling follows the contract.
        let (_, board, _) = engine.collaborators();
        assert_eq!(board.input_limit, (3000, 5000));
    }

    #[test]
    fn detach_clears_contract_and_notifies() {
        let mut engine = new_engine();
        let mut now = attach_as_sink(&mut engine);

        {
            let (_, board, _) = engine.collaborators();
            board.vbus_present = false;
            board.cc = (CcLevel::Open, CcLevel::Open);
        }

        now += 1_000;
        engine.run_port(0, now);

        assert!(engine.contract(0).is_none());
        let (_, _, chipset) = engine.collaborators();
        assert!(
            chipset
                .events
                .iter()
                .any(|(port, event)| *port == 0 && *event == usbpd_drp_traits::StatusEvent::Disconnected)
        );
    }

    #[test]
    fn suspend_round_trip() {
        let mut engine = new_engine();
        engine.run_port(0, 0);

        engine.set_suspend(0, true);
        engine.run_port(0, 1_000);
        assert!(engine.is_suspended(0));

        engine.set_suspend(0, false);
        engine.run_port(0, 2_000);
        assert!(!engine.is_suspended(0));
    }
}

