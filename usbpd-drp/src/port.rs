//! Per-port state shared between the connection layer, the policy engine
//! and the device policy manager.
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use heapless::Vec;
use usbpd_drp_traits::{Sop, StatusEvent};

use crate::message::RxMessage;
use crate::message::pdo::Capabilities;
use crate::{CcState, DataRole, Polarity, PowerRole};

bitflags! {
    /// Policy engine flags.
    ///
    /// Set from the port task and, for the PRL-reported group, from the
    /// interrupt path; stored in an atomic cell.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeFlag: u32 {
        /// Last transmit reached GoodCRC.
        const TX_COMPLETE = 1 << 0;
        /// An inbound message is waiting in the mailbox.
        const MSG_RECEIVED = 1 << 1;
        /// Outbound was pre-empted by a higher-priority inbound.
        const MSG_DISCARDED = 1 << 2;
        /// The protocol layer reported an inbound or format error.
        const PROTOCOL_ERROR = 1 << 3;
        /// An explicit contract is in place.
        const EXPLICIT_CONTRACT = 1 << 4;
        /// At least one alternate mode is active.
        const MODAL_OPERATION = 1 << 5;
        /// Between PR_Swap Accept and the final PS_RDY.
        const PR_SWAP_IN_PROGRESS = 1 << 6;
        /// The PHY detected the fast-role-swap K-code.
        const FAST_ROLE_SWAP_SIGNALED = 1 << 7;
        /// The engine is on the FRS branch rather than PR_Swap.
        const FAST_ROLE_SWAP_PATH = 1 << 8;
        /// Entered Ready; jitter-delay the first transmit.
        const FIRST_MSG = 1 << 9;
        /// A VDM exchange exceeded its sender-response budget.
        const VDM_REQUEST_TIMEOUT = 1 << 10;
        /// The port is in Extended Power Range mode.
        const IN_EPR = 1 << 11;
        /// No Source_Capabilities arrived within the budget.
        const SNK_WAIT_CAP_TIMEOUT = 1 << 12;
        /// This side opened the current atomic message sequence.
        const LOCALLY_INITIATED_AMS = 1 << 13;
        /// The current atomic message sequence may be interrupted.
        const INTERRUPTIBLE_AMS = 1 << 14;
        /// The current exchange was opened on behalf of a DPM request.
        const DPM_INITIATED = 1 << 15;
        /// This port currently sources VCONN.
        const VCONN_ON = 1 << 16;
        /// A GoodCRC-acknowledged exchange has happened this attach.
        const PD_CONNECTED = 1 << 17;
        /// The port task acknowledged a suspend request.
        const SUSPENDED = 1 << 18;
        /// Interrupt context asked for a connection re-check (LPM exit).
        const CHECK_CONNECTION = 1 << 19;
        /// A Chunk was received that the engine will not reassemble.
        const CHUNKING_NOT_SUPPORTED = 1 << 20;
        /// The source advertisement changed while under contract.
        const SRC_CAP_CHANGED = 1 << 21;
    }
}

bitflags! {
    /// Requests the device policy manager posts toward the policy engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DpmRequest: u32 {
        /// Swap power roles.
        const PR_SWAP = 1 << 0;
        /// Swap data roles.
        const DR_SWAP = 1 << 1;
        /// Swap the VCONN source.
        const VCONN_SWAP = 1 << 2;
        /// Re-send Source_Capabilities (advertisement changed).
        const SRC_CAP_CHANGE = 1 << 3;
        /// Fetch the partner's source capabilities.
        const GET_SRC_CAPS = 1 << 4;
        /// Fetch the partner's sink capabilities.
        const GET_SNK_CAPS = 1 << 5;
        /// Run the prepared VDM exchange.
        const VDM = 1 << 6;
        /// Send Enter_USB.
        const ENTER_USB = 1 << 7;
        /// Run the Data Reset sequence.
        const DATA_RESET = 1 << 8;
        /// Send an Alert with the prepared ADO.
        const SEND_ALERT = 1 << 9;
        /// Fetch partner status.
        const GET_STATUS = 1 << 10;
        /// Enter EPR mode.
        const EPR_MODE_ENTRY = 1 << 11;
        /// Exit EPR mode.
        const EPR_MODE_EXIT = 1 << 12;
        /// Arm fast-role-swap detection.
        const FRS_DET_ENABLE = 1 << 13;
        /// Disarm fast-role-swap detection.
        const FRS_DET_DISABLE = 1 << 14;
        /// Force ErrorRecovery on this port.
        const ERROR_RECOVERY = 1 << 15;
        /// Suspend the port.
        const SUSPEND = 1 << 16;
        /// Update the advertised Rp current limit.
        const UPDATE_CURRENT = 1 << 17;
        /// Send Hard Reset.
        const HARD_RESET_SEND = 1 << 18;
    }
}

/// At most one swap request may be in flight at a time.
pub const SWAP_REQUESTS: DpmRequest = DpmRequest::PR_SWAP.union(DpmRequest::DR_SWAP).union(DpmRequest::VCONN_SWAP);

/// An atomic cell of [`PeFlag`] or [`DpmRequest`] bits.
///
/// Every mutation is traced, preserving the audit trail the original
/// firmware gets from its `FLAGS_SET` console output.
#[derive(Debug, Default)]
pub struct AtomicBits(AtomicU32);

impl AtomicBits {
    /// Create an empty set.
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn set_raw(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::SeqCst);
    }

    pub(crate) fn clear_raw(&self, bits: u32) {
        self.0.fetch_and(!bits, Ordering::SeqCst);
    }

    pub(crate) fn check_raw(&self, bits: u32) -> bool {
        self.0.load(Ordering::SeqCst) & bits != 0
    }

    pub(crate) fn snapshot_raw(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_all(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// The established explicit contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Contract {
    /// 1-indexed object position of the selected PDO.
    pub pdo_index: u8,
    /// Contract voltage in millivolts.
    pub mv: u32,
    /// Contract current in milliamperes.
    pub ma: u32,
}

/// A capability set retrieved from the partner.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CapsRecord {
    /// Never retrieved this attach.
    #[default]
    Unknown,
    /// Retrieval was attempted and failed.
    Fail,
    /// The last received capability set.
    Known(Capabilities),
}

impl CapsRecord {
    /// The PDO count; `None` encodes "retrieval failed" or "unknown".
    pub fn count(&self) -> Option<usize> {
        match self {
            CapsRecord::Known(caps) => Some(caps.0.len()),
            _ => None,
        }
    }

    /// The capability set, if known.
    pub fn known(&self) -> Option<&Capabilities> {
        match self {
            CapsRecord::Known(caps) => Some(caps),
            _ => None,
        }
    }
}

/// Discovery progress for one class of records on one SOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscState {
    /// Not yet attempted or still in progress.
    #[default]
    Needed,
    /// Completed with a response.
    Complete,
    /// Gave up after the retry ladder.
    Fail,
}

/// Discovered modes for one SVID.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SvidModes {
    /// The SVID these modes belong to.
    pub svid: u16,
    /// The raw mode VDOs, in response order.
    pub modes: Vec<u32, 6>,
}

/// Identity, SVIDs and modes discovered on one SOP.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Discovery {
    /// Discover Identity progress.
    pub identity_state: DiscState,
    /// Discover SVIDs progress.
    pub svids_state: DiscState,
    /// Discover Modes progress.
    pub modes_state: DiscState,
    /// The raw identity response objects (ID header first).
    pub identity: Vec<u32, 6>,
    /// SVIDs the partner responded with.
    pub svids: Vec<u16, 12>,
    /// Modes per SVID, fetched in SVID order.
    pub modes: Vec<SvidModes, 4>,
}

impl Discovery {
    /// Look up the discovered modes for an SVID.
    pub fn modes_for(&self, svid: u16) -> Option<&SvidModes> {
        self.modes.iter().find(|entry| entry.svid == svid)
    }

    /// Whether SVIDs and modes discovery both finished.
    pub fn complete(&self) -> bool {
        self.svids_state == DiscState::Complete && self.modes_state == DiscState::Complete
    }
}

bitflags! {
    /// Host-visible events latched until detach.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventBits: u32 {
        /// A Hard Reset was sent or received.
        const HARD_RESET = 1 << 0;
        /// The port partner detached.
        const DISCONNECTED = 1 << 1;
        /// Discovery on SOP finished.
        const SOP_DISC_DONE = 1 << 2;
        /// Discovery on SOP' finished.
        const SOP_PRIME_DISC_DONE = 1 << 3;
    }
}

impl EventBits {
    /// The trait-level event for this bit.
    pub fn status_event(self) -> Option<StatusEvent> {
        match self {
            EventBits::HARD_RESET => Some(StatusEvent::HardReset),
            EventBits::DISCONNECTED => Some(StatusEvent::Disconnected),
            EventBits::SOP_DISC_DONE => Some(StatusEvent::SopDiscDone),
            EventBits::SOP_PRIME_DISC_DONE => Some(StatusEvent::SopPrimeDiscDone),
            _ => None,
        }
    }
}

/// All mutable state for one USB-C port.
#[derive(Debug)]
pub struct Port {
    /// Port index, for logging.
    pub id: usize,
    /// Current power role.
    pub power_role: PowerRole,
    /// Current data role.
    pub data_role: DataRole,
    /// Latched connector orientation; `None` while unattached.
    pub polarity: Option<Polarity>,
    /// Last partner classification.
    pub cc_state: CcState,
    /// The explicit contract, if one is in place.
    pub contract: Option<Contract>,
    /// Partner source capabilities.
    pub src_caps: CapsRecord,
    /// Partner sink capabilities.
    pub snk_caps: CapsRecord,
    /// Discovery records, per SOP class.
    pub discovery: [Discovery; Sop::COUNT],
    /// Policy engine flags.
    pub flags: AtomicBits,
    /// Pending DPM requests.
    pub dpm_request: AtomicBits,
    /// Device-policy-manager internal flags (see `dpm::DpmFlag`).
    pub dpm_flags: AtomicBits,
    /// Latched host events.
    pub events: EventBits,
    /// Inbound message mailbox, filled by the protocol layer path.
    pub rx: Option<RxMessage>,
    /// Partner revision message data object, from Get_Revision.
    pub partner_rmdo: Option<(u8, u8)>,
    /// Alert data object queued for transmission.
    pub pending_ado: Option<u32>,
    /// Low-power-mode prevention reference count.
    pub lpm_prevent: AtomicU32,
}

impl Port {
    /// Create the state for one port.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            power_role: PowerRole::Sink,
            data_role: DataRole::Ufp,
            polarity: None,
            cc_state: CcState::Unset,
            contract: None,
            src_caps: CapsRecord::Unknown,
            snk_caps: CapsRecord::Unknown,
            discovery: Default::default(),
            flags: AtomicBits::new(),
            dpm_request: AtomicBits::new(),
            dpm_flags: AtomicBits::new(),
            events: EventBits::empty(),
            rx: None,
            partner_rmdo: None,
            pending_ado: None,
            lpm_prevent: AtomicU32::new(0),
        }
    }

    /// Set policy engine flags.
    pub fn set_flag(&self, flags: PeFlag) {
        trace!("C{}: set flags {:?}", self.id, flags);
        self.flags.set_raw(flags.bits());
    }

    /// Clear policy engine flags.
    pub fn clear_flag(&self, flags: PeFlag) {
        self.flags.clear_raw(flags.bits());
    }

    /// Whether any of the given flags is set.
    pub fn check_flag(&self, flags: PeFlag) -> bool {
        self.flags.check_raw(flags.bits())
    }

    /// Consume a flag: report whether it was set, clearing it.
    pub fn take_flag(&self, flags: PeFlag) -> bool {
        let was_set = self.check_flag(flags);
        if was_set {
            self.clear_flag(flags);
        }
        was_set
    }

    /// Post DPM requests toward the policy engine.
    ///
    /// May be called from any task; the port task observes the bits no
    /// later than its next tick.
    pub fn post_dpm_request(&self, request: DpmRequest) {
        trace!("C{}: DPM request {:?}", self.id, request);
        self.dpm_request.set_raw(request.bits());
    }

    /// Clear DPM request bits.
    pub fn clear_dpm_request(&self, request: DpmRequest) {
        self.dpm_request.clear_raw(request.bits());
    }

    /// Whether any of the given requests is pending.
    pub fn check_dpm_request(&self, request: DpmRequest) -> bool {
        self.dpm_request.check_raw(request.bits())
    }

    /// Consume a pending request: report whether it was set, clearing it.
    pub fn take_dpm_request(&self, request: DpmRequest) -> bool {
        let was_set = self.check_dpm_request(request);
        if was_set {
            self.clear_dpm_request(request);
        }
        was_set
    }

    /// Establish the explicit contract.
    pub fn set_contract(&mut self, contract: Contract) {
        info!(
            "C{}: explicit contract {} mV / {} mA (PDO {})",
            self.id, contract.mv, contract.ma, contract.pdo_index
        );
        self.contract = Some(contract);
        self.set_flag(PeFlag::EXPLICIT_CONTRACT);
    }

    /// Invalidate the explicit contract.
    pub fn invalidate_contract(&mut self) {
        self.contract = None;
        self.clear_flag(PeFlag::EXPLICIT_CONTRACT);
    }

    /// Latch a host event; returns the bits newly set.
    pub fn latch_event(&mut self, event: EventBits) -> EventBits {
        let new = event - self.events;
        self.events |= event;
        new
    }

    /// Clear state derived from the attached partner.
    ///
    /// Called on detach and on ErrorRecovery entry. Flags survive only
    /// for the suspend/LPM group; `DISCONNECTED` is re-latched by the
    /// caller.
    pub fn clear_partner_state(&mut self) {
        self.invalidate_contract();
        self.src_caps = CapsRecord::Unknown;
        self.snk_caps = CapsRecord::Unknown;
        self.discovery = Default::default();
        self.partner_rmdo = None;
        self.pending_ado = None;
        self.rx = None;
        self.events = EventBits::empty();
        self.cc_state = CcState::None;
        self.polarity = None;

        let keep = (PeFlag::SUSPENDED | PeFlag::CHECK_CONNECTION).bits();
        let kept = self.flags.snapshot_raw() & keep;
        self.flags.clear_all();
        self.flags.set_raw(kept);

        // A pending suspend request must survive until acknowledged.
        let kept_requests = self.dpm_request.snapshot_raw() & DpmRequest::SUSPEND.bits();
        self.dpm_request.clear_all();
        self.dpm_request.set_raw(kept_requests);
        self.dpm_flags.clear_all();
    }

    /// Whether low-power mode entry is currently inhibited.
    pub fn lpm_prevented(&self) -> bool {
        self.lpm_prevent.load(Ordering::SeqCst) > 0
    }

    /// Hold off low-power mode entry.
    pub fn prevent_lpm(&self) {
        self.lpm_prevent.fetch_add(1, Ordering::SeqCst);
    }

    /// Release a low-power-mode hold.
    pub fn allow_lpm(&self) {
        self.lpm_prevent.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::{Contract, DpmRequest, EventBits, PeFlag, Port};
    use crate::CcState;

    #[test]
    fn flags_are_settable_and_takeable() {
        let port = Port::new(0);

        port.set_flag(PeFlag::TX_COMPLETE | PeFlag::FIRST_MSG);
        assert!(port.check_flag(PeFlag::TX_COMPLETE));
        assert!(port.take_flag(PeFlag::TX_COMPLETE));
        assert!(!port.check_flag(PeFlag::TX_COMPLETE));
        assert!(port.check_flag(PeFlag::FIRST_MSG));
    }

    #[test]
    fn detach_clears_partner_state() {
        let mut port = Port::new(0);

        port.set_contract(Contract {
            pdo_index: 1,
            mv: 5000,
            ma: 3000,
        });
        port.set_flag(PeFlag::MODAL_OPERATION | PeFlag::SUSPENDED);
        port.post_dpm_request(DpmRequest::PR_SWAP);
        port.latch_event(EventBits::SOP_DISC_DONE);

        port.clear_partner_state();

        assert!(port.contract.is_none());
        assert!(!port.check_flag(PeFlag::EXPLICIT_CONTRACT | PeFlag::MODAL_OPERATION));
        // The suspend acknowledgement survives detach.
        assert!(port.check_flag(PeFlag::SUSPENDED));
        assert!(!port.check_dpm_request(DpmRequest::PR_SWAP));
        assert!(port.events.is_empty());
        assert_eq!(port.cc_state, CcState::None);
    }

    #[test]
    fn latch_event_reports_only_new_bits() {
        let mut port = Port::new(1);

        assert_eq!(port.latch_event(EventBits::HARD_RESET), EventBits::HARD_RESET);
        assert_eq!(port.latch_event(EventBits::HARD_RESET), EventBits::empty());
    }
}
