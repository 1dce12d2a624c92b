//! Scripted collaborator fakes for driving the state machines in tests.
use std::vec::Vec;

use usbpd_drp_traits::{
    Board, CcLevel, CcPull, Chipset, ChipsetState, MuxMode, PdRev, PowerSupplyError, PrlError, ProtocolLayer, RpValue,
    Sop, StatusEvent, VbusLevel,
};

use crate::dpm::SharedPolicy;
use crate::engine::{Config, Ctx};
use crate::port::Port;
use crate::timer::PdTimers;

/// What a fake protocol layer recorded being asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// Control message: (sop, type code).
    Ctrl(Sop, u8),
    /// Data message: (sop, type code, objects).
    Data(Sop, u8, Vec<u32>),
    /// Extended message: (sop, type code, payload).
    Ext(Sop, u8, Vec<u8>),
}

impl Sent {
    /// The raw 5-bit message type code.
    pub fn msg_type(&self) -> u8 {
        match self {
            Sent::Ctrl(_, t) | Sent::Data(_, t, _) | Sent::Ext(_, t, _) => *t,
        }
    }
}

/// A protocol layer that records sends and lets tests inspect them.
#[derive(Debug, Default)]
pub struct FakePrl {
    /// Everything the engine asked to transmit, in order.
    pub sent: Vec<Sent>,
    /// Hard resets driven onto the wire.
    pub hard_resets: usize,
    /// Soft resets of the message counters.
    pub soft_resets: usize,
    /// Started state.
    pub running: bool,
    /// Per-SOP negotiated revision.
    pub revs: [PdRev; Sop::COUNT],
}

impl FakePrl {
    /// Create the fake, stopped at r3.1.
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            hard_resets: 0,
            soft_resets: 0,
            running: false,
            revs: [PdRev::R3_1; Sop::COUNT],
        }
    }

    /// Pop the oldest recorded send.
    pub fn take_sent(&mut self) -> Option<Sent> {
        if self.sent.is_empty() {
            None
        } else {
            Some(self.sent.remove(0))
        }
    }

    /// The most recent recorded send.
    pub fn last_sent(&self) -> Option<&Sent> {
        self.sent.last()
    }
}

impl ProtocolLayer for FakePrl {
    fn send_ctrl(&mut self, _port: usize, sop: Sop, msg_type: u8) -> Result<(), PrlError> {
        self.sent.push(Sent::Ctrl(sop, msg_type));
        Ok(())
    }

    fn send_data(&mut self, _port: usize, sop: Sop, msg_type: u8, objects: &[u32]) -> Result<(), PrlError> {
        self.sent.push(Sent::Data(sop, msg_type, objects.to_vec()));
        Ok(())
    }

    fn send_ext(&mut self, _port: usize, sop: Sop, msg_type: u8, data: &[u8]) -> Result<(), PrlError> {
        self.sent.push(Sent::Ext(sop, msg_type, data.to_vec()));
        Ok(())
    }

    fn reset_soft(&mut self, _port: usize) {
        self.soft_resets += 1;
    }

    fn execute_hard_reset(&mut self, _port: usize) {
        self.hard_resets += 1;
    }

    fn hard_reset_complete(&mut self, _port: usize) {}

    fn get_rev(&self, _port: usize, sop: Sop) -> PdRev {
        self.revs[sop.index()]
    }

    fn set_rev(&mut self, _port: usize, sop: Sop, rev: PdRev) {
        self.revs[sop.index()] = rev;
    }

    fn is_running(&self, _port: usize) -> bool {
        self.running
    }

    fn is_busy(&self, _port: usize) -> bool {
        false
    }

    fn start(&mut self, _port: usize, rev: PdRev) {
        self.running = true;
        self.revs = [rev; Sop::COUNT];
    }

    fn stop(&mut self, _port: usize) {
        self.running = false;
    }
}

/// A board fake with settable CC and vBus readings.
#[derive(Debug)]
pub struct FakeBoard {
    /// CC readings returned by `sample_cc`.
    pub cc: (CcLevel, CcLevel),
    /// vBus present.
    pub vbus_present: bool,
    /// vBus at vSafe0V.
    pub vbus_safe0v: bool,
    /// Last applied CC pull.
    pub pull: Option<(CcPull, RpValue)>,
    /// Latched polarity.
    pub polarity_flipped: Option<bool>,
    /// Source supply on.
    pub sourcing: bool,
    /// Next `power_supply_ready` fails.
    pub fail_supply: bool,
    /// VCONN driven.
    pub vconn: bool,
    /// Last mux configuration.
    pub mux: MuxMode,
    /// Mux settled.
    pub mux_settled: bool,
    /// Auto-discharge enabled.
    pub auto_discharge: bool,
    /// FRS detection armed.
    pub frs_armed: bool,
    /// Last reported input ceiling (mA, mV).
    pub input_limit: (u32, u32),
    /// Hardware toggle engaged.
    pub auto_toggling: bool,
    /// Low-power mode entries.
    pub lpm_entries: usize,
    /// TBT/USB4 policy answer.
    pub tbt_usb4_allowed: bool,
}

impl FakeBoard {
    /// Create the fake with nothing attached.
    pub fn new() -> Self {
        Self {
            cc: (CcLevel::Open, CcLevel::Open),
            vbus_present: false,
            vbus_safe0v: true,
            pull: None,
            polarity_flipped: None,
            sourcing: false,
            fail_supply: false,
            vconn: false,
            mux: MuxMode::None,
            mux_settled: true,
            auto_discharge: false,
            frs_armed: false,
            input_limit: (0, 0),
            auto_toggling: false,
            lpm_entries: 0,
            tbt_usb4_allowed: true,
        }
    }
}

impl Default for FakeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for FakeBoard {
    fn set_cc(&mut self, _port: usize, pull: CcPull, rp: RpValue) {
        self.pull = Some((pull, rp));
    }

    fn sample_cc(&mut self, _port: usize) -> (CcLevel, CcLevel) {
        self.cc
    }

    fn set_polarity(&mut self, _port: usize, flipped: bool) {
        self.polarity_flipped = Some(flipped);
    }

    fn vbus_at_level(&mut self, _port: usize, level: VbusLevel) -> bool {
        match level {
            VbusLevel::Present => self.vbus_present,
            VbusLevel::Safe0V => self.vbus_safe0v,
            VbusLevel::Removed => !self.vbus_present,
        }
    }

    fn power_supply_ready(&mut self, _port: usize) -> Result<(), PowerSupplyError> {
        if self.fail_supply {
            return Err(PowerSupplyError);
        }
        self.sourcing = true;
        self.vbus_present = true;
        self.vbus_safe0v = false;
        Ok(())
    }

    fn power_supply_reset(&mut self, _port: usize) {
        self.sourcing = false;
        self.vbus_present = false;
        self.vbus_safe0v = true;
    }

    fn transition_voltage(&mut self, _port: usize, _pdo_index: usize) {}

    fn set_vconn(&mut self, _port: usize, enabled: bool) -> Result<(), PowerSupplyError> {
        self.vconn = enabled;
        Ok(())
    }

    fn mux_set(&mut self, _port: usize, mode: MuxMode, _polarity_flipped: bool) {
        self.mux = mode;
    }

    fn mux_set_completed(&mut self, _port: usize) -> bool {
        self.mux_settled
    }

    fn auto_discharge_disconnect(&mut self, _port: usize, enabled: bool) {
        self.auto_discharge = enabled;
    }

    fn frs_detection_enable(&mut self, _port: usize, enabled: bool) {
        self.frs_armed = enabled;
    }

    fn set_input_current_limit(&mut self, _port: usize, ma: u32, mv: u32) {
        self.input_limit = (ma, mv);
    }

    fn drp_auto_toggle(&mut self, _port: usize, enabled: bool) {
        self.auto_toggling = enabled;
    }

    fn enter_low_power_mode(&mut self, _port: usize) {
        self.lpm_entries += 1;
    }

    fn is_tbt_usb4_port(&self, _port: usize) -> bool {
        self.tbt_usb4_allowed
    }
}

/// A chipset fake recording notifications and button actions.
#[derive(Debug)]
pub struct FakeChipset {
    /// Reported power state.
    pub state: ChipsetState,
    /// Posted host events, in order.
    pub events: Vec<(usize, StatusEvent)>,
    /// `power_on` calls.
    pub power_ons: usize,
    /// Simulated short presses.
    pub button_presses: usize,
    /// Forced shutdowns.
    pub shutdowns: usize,
}

impl FakeChipset {
    /// Create the fake, powered on.
    pub fn new() -> Self {
        Self {
            state: ChipsetState::On,
            events: Vec::new(),
            power_ons: 0,
            button_presses: 0,
            shutdowns: 0,
        }
    }
}

impl Default for FakeChipset {
    fn default() -> Self {
        Self::new()
    }
}

impl Chipset for FakeChipset {
    fn state(&self) -> ChipsetState {
        self.state
    }

    fn power_on(&mut self) {
        self.power_ons += 1;
    }

    fn simulate_power_button_press(&mut self) {
        self.button_presses += 1;
    }

    fn force_shutdown(&mut self) {
        self.shutdowns += 1;
    }

    fn notify_event(&mut self, port: usize, event: StatusEvent) {
        self.events.push((port, event));
    }
}

/// A single-port bench for driving state machines without the engine.
pub struct Bench {
    /// The port under test.
    pub port: Port,
    /// Its timers.
    pub timers: PdTimers,
    /// The protocol layer fake.
    pub prl: FakePrl,
    /// The board fake.
    pub board: FakeBoard,
    /// The chipset fake.
    pub chipset: FakeChipset,
    /// Engine policy.
    pub config: Config,
    /// Shared-current policy.
    pub shared: SharedPolicy,
}

impl Bench {
    /// Create a bench for port 0 with default policy.
    pub fn new() -> Self {
        let config = Config::default();
        let shared = SharedPolicy::new(config.default_rp);

        Self {
            port: Port::new(0),
            timers: PdTimers::new(),
            prl: FakePrl::new(),
            board: FakeBoard::new(),
            chipset: FakeChipset::new(),
            config,
            shared,
        }
    }

    /// Borrow everything as a state-function context.
    pub fn ctx(&mut self, now_us: u64) -> Ctx<'_, FakePrl, FakeBoard, FakeChipset> {
        Ctx {
            now: now_us,
            port: &mut self.port,
            timers: &mut self.timers,
            prl: &mut self.prl,
            board: &mut self.board,
            chipset: &mut self.chipset,
            config: &self.config,
            shared: &self.shared,
        }
    }

    /// Deliver a parsed message into the port mailbox.
    pub fn receive_message(&mut self, message: crate::message::RxMessage) {
        self.port.rx = Some(message);
        self.port.set_flag(crate::port::PeFlag::MSG_RECEIVED);
    }

    /// Signal GoodCRC for the last transmit.
    pub fn tx_complete(&mut self) {
        self.port.set_flag(crate::port::PeFlag::TX_COMPLETE);
    }
}

impl Default for Bench {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a control message as the partner would send it.
pub fn partner_ctrl(
    msg_type: crate::message::header::ControlMessageType,
    message_id: u8,
    partner_is_source: bool,
) -> crate::message::RxMessage {
    use crate::message::header::{Header, SpecRevision};
    use crate::{DataRole, PowerRole};

    let (power_role, data_role) = if partner_is_source {
        (PowerRole::Source, DataRole::Dfp)
    } else {
        (PowerRole::Sink, DataRole::Ufp)
    };

    let header = Header::new_template(data_role, power_role, SpecRevision::R3_X)
        .with_message_id(message_id)
        .with_message_type_raw(msg_type as u8);

    crate::message::RxMessage {
        sop: Sop::Sop,
        header,
        objects: heapless::Vec::new(),
        ext: None,
    }
}

/// Build a data message as the partner would send it.
pub fn partner_data(
    msg_type: crate::message::header::DataMessageType,
    objects: &[u32],
    message_id: u8,
    partner_is_source: bool,
) -> crate::message::RxMessage {
    let mut message = partner_ctrl(
        crate::message::header::ControlMessageType::Reserved,
        message_id,
        partner_is_source,
    );
    message.header = message
        .header
        .with_message_type_raw(msg_type as u8)
        .with_num_objects(objects.len() as u8);
    message.objects = heapless::Vec::from_slice(objects).unwrap();
    message
}

/// Source capabilities used across the tests: 5 V at 3 A, unconstrained.
pub fn caps_5v3a() -> u32 {
    crate::message::pdo::FixedSupply::default()
        .with_raw_voltage(100)
        .with_raw_max_current(300)
        .with_unconstrained_power(true)
        .with_dual_role_data(true)
        .0
}
