//! The shared source-current allocator.
//!
//! Platforms advertise 1.5 A everywhere until a port proves it needs
//! more; the 3 A claims are then balanced across at most
//! `Config::ports_3a` ports. Priority runs PD sinks first, then FRS
//! partners, then non-PD sinks.
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, ProtocolLayer, RpValue};

use crate::engine::{Config, Ctx};
use crate::message::pdo::{Capabilities, FrsCurrent};
use crate::port::{DpmRequest, Port};
use crate::times;
use crate::{PdRev, PowerRole, Sop};

/// Largest port count the claim masks cover.
const MAX_PORTS: usize = 8;

#[derive(Debug)]
struct AllocatorState {
    /// Ports currently allocated 3 A.
    max_current_claimed: u32,
    /// The Rp advertisement selected per port.
    selected_rp: [RpValue; MAX_PORTS],
    /// Compliance override: all shared power management off.
    bist_shared_mode: bool,
    /// On BIST shared exit, every source port goes through recovery.
    bist_exit_pending: bool,
    /// A downgraded port is settling; do not rebalance before this.
    deferred_until: Option<u64>,
}

/// Cross-port shared-current policy.
///
/// The claim set only changes under the mutex; the requester sets are
/// plain atomics so any task can file a request before triggering a
/// balance.
pub struct SharedPolicy {
    state: Mutex<CriticalSectionRawMutex, RefCell<AllocatorState>>,
    /// Ports with PD sinks that want more than 1.5 A.
    sink_max_pdo_requested: AtomicU32,
    /// Ports with FRS partners that need 3 A after a swap.
    source_frs_max_requested: AtomicU32,
    /// Ports with non-PD sinks of unknown draw.
    non_pd_sink_max_requested: AtomicU32,
    /// A balance pass is wanted.
    balance_requested: AtomicU32,
}

impl SharedPolicy {
    /// Create the policy with every port at the default advertisement.
    pub fn new(default_rp: RpValue) -> Self {
        Self {
            state: Mutex::new(RefCell::new(AllocatorState {
                max_current_claimed: 0,
                selected_rp: [default_rp; MAX_PORTS],
                bist_shared_mode: false,
                bist_exit_pending: false,
                deferred_until: None,
            })),
            sink_max_pdo_requested: AtomicU32::new(0),
            source_frs_max_requested: AtomicU32::new(0),
            non_pd_sink_max_requested: AtomicU32::new(0),
            balance_requested: AtomicU32::new(0),
        }
    }

    /// The Rp currently selected for a port.
    pub fn selected_rp(&self, port: usize) -> RpValue {
        self.state.lock(|state| state.borrow().selected_rp[port])
    }

    /// Whether a port holds a 3 A claim.
    pub fn claims_3a(&self, port: usize) -> bool {
        self.state.lock(|state| state.borrow().max_current_claimed & bit(port) != 0)
    }

    /// Whether BIST shared test mode is active.
    pub fn bist_shared_mode(&self) -> bool {
        self.state.lock(|state| state.borrow().bist_shared_mode)
    }

    /// The number of claimed ports, for invariant checks.
    pub fn claimed_count(&self) -> usize {
        self.state
            .lock(|state| state.borrow().max_current_claimed.count_ones() as usize)
    }

    fn request_balance(&self) {
        self.balance_requested.store(1, Ordering::SeqCst);
    }
}

fn bit(port: usize) -> u32 {
    1u32 << port
}

fn lowest_port(mask: u32) -> usize {
    mask.trailing_zeros() as usize
}

/// The source PDO set a port currently advertises.
///
/// Ports offer the limited set until they hold a 3 A claim; BIST shared
/// test mode forces the full set everywhere.
pub fn source_pdos(shared: &SharedPolicy, config: &Config, port: usize) -> Vec<u32, 7> {
    if config.ports_3a > 0 && (shared.claims_3a(port) || shared.bist_shared_mode()) {
        config.src_pdos_max.clone()
    } else {
        config.src_pdos.clone()
    }
}

/// The source current to account for a port, in mA.
pub fn source_current_ma(shared: &SharedPolicy, config: &Config, port: usize) -> u32 {
    if shared.claims_3a(port) || shared.bist_shared_mode() {
        3000
    } else if config.default_rp == RpValue::Rp1A5 {
        1500
    } else {
        500
    }
}

/// Evaluate a partner's Sink_Capabilities (or, as a sink, its
/// Source_Capabilities dual-role FRS bits) for current policy.
pub(crate) fn evaluate_sink_caps<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &mut Ctx<P, B, C>, caps: &Capabilities) {
    let Some(vsafe5v) = caps.vsafe_5v() else {
        return;
    };
    if vsafe5v.raw_voltage() != 100 {
        // Not a valid vSafe5V object.
        return;
    }

    let port_bit = bit(ctx.port.id);

    if ctx.port.power_role == PowerRole::Source {
        if ctx.config.ports_3a == 0 {
            return;
        }

        // Needs more than 1.5 A at 5 V?
        if u32::from(vsafe5v.raw_max_current()) * 10 <= 1500 {
            return;
        }

        note_sink_needs_3a(ctx.shared, ctx.port.id);
        return;
    } else {
        if !ctx.config.frs_capable {
            return;
        }

        // FRS only exists from PD r3.0.
        if ctx.rev(Sop::Sop) == PdRev::R2_0 {
            return;
        }

        let frs = FrsCurrent::from(vsafe5v.fast_role_swap_current());
        if !vsafe5v.dual_role_power() || frs == FrsCurrent::NotSupported {
            return;
        }

        match frs {
            FrsCurrent::UsbDefault | FrsCurrent::Current1A5 => {
                // No 3 A needed; arm FRS right away.
                ctx.port.post_dpm_request(DpmRequest::FRS_DET_ENABLE);
                return;
            }
            _ => (),
        }

        if ctx.config.ports_3a == 0 {
            return;
        }

        ctx.shared.source_frs_max_requested.fetch_or(port_bit, Ordering::SeqCst);
    }

    ctx.shared.request_balance();
}

/// A PD sink on `port` advertised needing more than 1.5 A.
pub(crate) fn note_sink_needs_3a(shared: &SharedPolicy, port: usize) {
    shared.sink_max_pdo_requested.fetch_or(bit(port), Ordering::SeqCst);
    shared.request_balance();
}

/// Evaluate a received RDO: a partner that holds a 3 A grant but only
/// requests 1.5 A (op current ≤ 150 in 10 mA units) gives the slot back.
pub(crate) fn evaluate_request_rdo<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &mut Ctx<P, B, C>, rdo: u32) {
    if ctx.config.ports_3a == 0 {
        return;
    }

    note_sink_rdo(ctx.shared, ctx.port.id, rdo);
}

fn note_sink_rdo(shared: &SharedPolicy, port: usize, rdo: u32) {
    let position = (rdo >> 28) & 0xF;
    if position == 0 {
        return;
    }

    let op_current_10ma = (rdo >> 10) & 0x3FF;
    let port_bit = bit(port);

    // Some compliant-but-cautious sinks take the 3 A offer and then
    // request 1.5 A anyway; reclaim the slot for somebody else.
    if shared.sink_max_pdo_requested.load(Ordering::SeqCst) & port_bit != 0 && op_current_10ma <= 150 {
        shared.sink_max_pdo_requested.fetch_and(!port_bit, Ordering::SeqCst);
        shared.request_balance();
    }
}

/// A non-PD sink attached; its draw is unknown, so offer it 3 A when
/// the budget allows.
pub fn add_non_pd_sink(shared: &SharedPolicy, config: &Config, port: usize) {
    if config.ports_3a == 0 {
        return;
    }

    shared.non_pd_sink_max_requested.fetch_or(bit(port), Ordering::SeqCst);
    shared.request_balance();
}

/// A sink detached; release its requests and restore the default Rp.
pub fn remove_sink(shared: &SharedPolicy, config: &Config, port: usize) {
    if config.ports_3a == 0 {
        return;
    }

    let port_bit = bit(port);
    let had = (shared.sink_max_pdo_requested.load(Ordering::SeqCst)
        | shared.non_pd_sink_max_requested.load(Ordering::SeqCst))
        & port_bit
        != 0;

    if !had {
        return;
    }

    shared.sink_max_pdo_requested.fetch_and(!port_bit, Ordering::SeqCst);
    shared.non_pd_sink_max_requested.fetch_and(!port_bit, Ordering::SeqCst);

    shared.state.lock(|state| {
        state.borrow_mut().selected_rp[port] = config.default_rp;
    });
    shared.request_balance();
}

/// A source (FRS) partner detached.
pub fn remove_source(shared: &SharedPolicy, config: &Config, port: usize) {
    if config.ports_3a == 0 || !config.frs_capable {
        return;
    }

    let port_bit = bit(port);
    if shared.source_frs_max_requested.load(Ordering::SeqCst) & port_bit == 0 {
        return;
    }

    shared.source_frs_max_requested.fetch_and(!port_bit, Ordering::SeqCst);
    shared.request_balance();
}

/// BIST shared test mode entry: offer the maximum everywhere.
pub(crate) fn bist_shared_mode_enter<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &mut Ctx<P, B, C>) {
    if ctx.config.ports_3a == 0 || ctx.port.power_role != PowerRole::Source {
        return;
    }

    info!("C{}: entering BIST shared test mode", ctx.id());
    ctx.shared.state.lock(|state| {
        state.borrow_mut().bist_shared_mode = true;
    });
    ctx.shared.request_balance();
}

/// BIST shared test mode exit: declare error recovery bankruptcy.
pub(crate) fn bist_shared_mode_exit<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &mut Ctx<P, B, C>) {
    if ctx.config.ports_3a == 0 {
        return;
    }

    let was_enabled = ctx.shared.state.lock(|state| {
        let mut state = state.borrow_mut();
        let was_enabled = state.bist_shared_mode;
        state.bist_shared_mode = false;
        state.bist_exit_pending = was_enabled;
        was_enabled
    });

    if was_enabled {
        ctx.shared.request_balance();
    }
}

/// Centralized, mutex-controlled updates to the claimed 3 A ports.
///
/// Runs on whichever task observed a request change; downgrades are
/// debounced so the losing partner has settled before the budget is
/// re-spent.
pub fn balance_source_ports<'a>(
    ports: impl Iterator<Item = &'a Port> + Clone,
    config: &Config,
    shared: &SharedPolicy,
    now_us: u64,
) {
    if shared.balance_requested.swap(0, Ordering::SeqCst) == 0 {
        // Nothing new; only deferred work may remain.
        let due = shared.state.lock(|state| {
            let state = state.borrow();
            state.deferred_until.map(|at| now_us >= at).unwrap_or(false)
        });
        if !due {
            return;
        }
    }

    // BIST shared-mode bookkeeping runs regardless of the debounce.
    let (bist_active, bist_exit) = shared.state.lock(|state| {
        let mut state = state.borrow_mut();
        let exit = state.bist_exit_pending;
        state.bist_exit_pending = false;
        (state.bist_shared_mode, exit)
    });

    if bist_exit {
        for port in ports.clone() {
            port.post_dpm_request(DpmRequest::ERROR_RECOVERY);
        }
    }

    if bist_active {
        // All arbitration is off; every source port offers the maximum.
        shared.state.lock(|state| {
            let mut state = state.borrow_mut();
            for port in ports.clone() {
                if port.power_role == PowerRole::Source {
                    state.selected_rp[port.id] = RpValue::Rp3A0;
                    port.post_dpm_request(DpmRequest::UPDATE_CURRENT | DpmRequest::SRC_CAP_CHANGE);
                }
            }
        });
        return;
    }

    let snk = shared.sink_max_pdo_requested.load(Ordering::SeqCst);
    let frs = shared.source_frs_max_requested.load(Ordering::SeqCst);
    let non_pd = shared.non_pd_sink_max_requested.load(Ordering::SeqCst);

    shared.state.lock(|state| {
        let mut state = state.borrow_mut();

        // Still waiting for a downgraded port to settle.
        if let Some(at) = state.deferred_until {
            if now_us < at {
                shared.balance_requested.store(1, Ordering::SeqCst);
                return;
            }
            state.deferred_until = None;
        }

        // Drop claims nobody asks for anymore.
        let removed = state.max_current_claimed & !(snk | frs | non_pd);
        state.max_current_claimed &= !removed;

        let budget = config.ports_3a as u32;

        // Priority 1: PD sinks that advertised needing more than 1.5 A.
        let mut new_ports = snk & !state.max_current_claimed;
        while new_ports != 0 {
            let new_max_port = lowest_port(new_ports);

            if state.max_current_claimed.count_ones() < budget {
                state.max_current_claimed |= bit(new_max_port);
                grant(&mut state, ports.clone(), new_max_port);
            } else if non_pd & state.max_current_claimed != 0 {
                // Always downgrade non-PD ports first.
                let victim = lowest_port(non_pd & state.max_current_claimed);
                downgrade(&mut state, ports.clone(), victim, config.default_rp);
                state.deferred_until = Some(now_us + times::T_SINK_ADJ_US);
                shared.balance_requested.store(1, Ordering::SeqCst);
                return;
            } else if frs & state.max_current_claimed != 0 {
                let victim = lowest_port(frs & state.max_current_claimed);
                post_to(ports.clone(), victim, DpmRequest::FRS_DET_DISABLE);
                state.max_current_claimed &= !bit(victim);
                // Give the victim's task time to process the disable.
                state.deferred_until = Some(now_us + times::T_FRS_DISABLE_SETTLE_US);
                shared.balance_requested.store(1, Ordering::SeqCst);
                return;
            } else {
                // No lower-priority port to take the slot from.
                break;
            }
            new_ports &= !bit(new_max_port);
        }

        // Priority 2: FRS partners.
        let mut new_ports = frs & !state.max_current_claimed;
        while new_ports != 0 {
            let new_frs_port = lowest_port(new_ports);

            if state.max_current_claimed.count_ones() < budget {
                state.max_current_claimed |= bit(new_frs_port);
                post_to(ports.clone(), new_frs_port, DpmRequest::FRS_DET_ENABLE);
            } else if non_pd & state.max_current_claimed != 0 {
                let victim = lowest_port(non_pd & state.max_current_claimed);
                downgrade(&mut state, ports.clone(), victim, config.default_rp);
                state.deferred_until = Some(now_us + times::T_SINK_ADJ_US);
                shared.balance_requested.store(1, Ordering::SeqCst);
                return;
            } else {
                break;
            }
            new_ports &= !bit(new_frs_port);
        }

        // Priority 3: non-PD sinks, only from spare budget.
        let mut new_ports = non_pd & !state.max_current_claimed;
        while new_ports != 0 {
            let new_max_port = lowest_port(new_ports);

            if state.max_current_claimed.count_ones() < budget {
                state.max_current_claimed |= bit(new_max_port);
                grant(&mut state, ports.clone(), new_max_port);
            } else {
                break;
            }
            new_ports &= !bit(new_max_port);
        }
    });
}

fn grant<'a>(state: &mut AllocatorState, ports: impl Iterator<Item = &'a Port>, port: usize) {
    debug!("granting 3A to C{}", port);
    state.selected_rp[port] = RpValue::Rp3A0;
    post_to(ports, port, DpmRequest::UPDATE_CURRENT | DpmRequest::SRC_CAP_CHANGE);
}

fn downgrade<'a>(state: &mut AllocatorState, ports: impl Iterator<Item = &'a Port>, port: usize, rp: RpValue) {
    debug!("downgrading C{} from 3A", port);
    state.max_current_claimed &= !bit(port);
    state.selected_rp[port] = rp;
    post_to(ports, port, DpmRequest::UPDATE_CURRENT | DpmRequest::SRC_CAP_CHANGE);
}

fn post_to<'a>(ports: impl Iterator<Item = &'a Port>, id: usize, request: DpmRequest) {
    for port in ports {
        if port.id == id {
            port.post_dpm_request(request);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use usbpd_drp_traits::RpValue;

    use super::{SharedPolicy, add_non_pd_sink, balance_source_ports, note_sink_needs_3a, note_sink_rdo, remove_sink};
    use crate::engine::Config;
    use crate::port::{DpmRequest, Port};
    use crate::times;

    fn setup() -> (Config, SharedPolicy, [Port; 2]) {
        let config = Config {
            ports_3a: 1,
            ..Default::default()
        };
        let shared = SharedPolicy::new(config.default_rp);
        (config, shared, [Port::new(0), Port::new(1)])
    }

    #[test]
    fn non_pd_sink_gets_spare_budget() {
        let (config, shared, ports) = setup();

        add_non_pd_sink(&shared, &config, 0);
        balance_source_ports(ports.iter(), &config, &shared, 0);

        assert!(shared.claims_3a(0));
        assert_eq!(shared.selected_rp(0), RpValue::Rp3A0);
        assert!(ports[0].check_dpm_request(DpmRequest::UPDATE_CURRENT | DpmRequest::SRC_CAP_CHANGE));
        assert_eq!(shared.claimed_count(), 1);
    }

    #[test]
    fn pd_sink_preempts_non_pd_after_debounce() {
        let (config, shared, ports) = setup();

        // Port 0: non-PD sink holds the only slot.
        add_non_pd_sink(&shared, &config, 0);
        balance_source_ports(ports.iter(), &config, &shared, 0);
        assert!(shared.claims_3a(0));

        // Port 1: a PD sink advertises needing 3 A.
        note_sink_needs_3a(&shared, 1);
        balance_source_ports(ports.iter(), &config, &shared, 1_000);

        // The non-PD port was downgraded; the grant waits out tSinkAdj.
        assert!(!shared.claims_3a(0));
        assert!(!shared.claims_3a(1));
        assert_eq!(shared.selected_rp(0), config.default_rp);

        // Rebalancing is refused inside the debounce window.
        balance_source_ports(ports.iter(), &config, &shared, 2_000);
        assert!(!shared.claims_3a(1));

        // After the debounce, the PD sink gets the slot.
        balance_source_ports(ports.iter(), &config, &shared, 1_000 + times::T_SINK_ADJ_US + 1);
        assert!(shared.claims_3a(1));
        assert!(!shared.claims_3a(0));
        assert_eq!(shared.claimed_count(), 1);
        assert_eq!(shared.selected_rp(1), RpValue::Rp3A0);
    }

    #[test]
    fn low_current_rdo_releases_the_claim() {
        let (config, shared, ports) = setup();

        note_sink_needs_3a(&shared, 1);
        balance_source_ports(ports.iter(), &config, &shared, 0);
        assert!(shared.claims_3a(1));

        // The partner then only requests 1.5 A (150 in 10 mA units).
        let rdo = (1u32 << 28) | (150 << 10) | 150;
        note_sink_rdo(&shared, 1, rdo);
        balance_source_ports(ports.iter(), &config, &shared, 1_000);

        assert!(!shared.claims_3a(1));
        assert_eq!(shared.claimed_count(), 0);
    }

    #[test]
    fn detach_restores_default_rp_and_frees_the_slot() {
        let (config, shared, ports) = setup();

        note_sink_needs_3a(&shared, 0);
        balance_source_ports(ports.iter(), &config, &shared, 0);
        assert!(shared.claims_3a(0));

        remove_sink(&shared, &config, 0);
        balance_source_ports(ports.iter(), &config, &shared, 1_000);

        assert!(!shared.claims_3a(0));
        assert_eq!(shared.selected_rp(0), config.default_rp);
        assert_eq!(shared.claimed_count(), 0);
    }

    #[test]
    fn pool_invariant_holds_with_more_requesters_than_budget() {
        let (config, shared, ports) = setup();

        note_sink_needs_3a(&shared, 0);
        note_sink_needs_3a(&shared, 1);
        balance_source_ports(ports.iter(), &config, &shared, 0);

        assert_eq!(shared.claimed_count(), 1);
        // The lowest port wins the slot.
        assert!(shared.claims_3a(0));
        assert!(!shared.claims_3a(1));
    }
}
