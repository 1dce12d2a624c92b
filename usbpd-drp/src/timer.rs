//! Per-port deadline service shared by all the port state machines.
//!
//! Every `(port, timer)` pair holds at most one absolute deadline. A timer
//! is in exactly one of three states:
//!
//! - **Disabled** — not participating in expiration checks,
//! - **Active** — armed with a deadline, counted by [`PdTimers::next_expiration`],
//! - **Expired** — moved out of the active set by [`PdTimers::manage_expired`],
//!   but still reporting [`PdTimers::is_expired`] until explicitly disabled.
//!
//! Timer ids are grouped into ranges so a layer can clear all of its
//! timers in one call at a state break (e.g. detach).

/// Timers managed for one port.
///
/// Grouped by owner: device policy manager, policy engine, protocol-layer
/// shadowing, Type-C connection layer.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TimerId {
    // Device policy manager range.
    DpmPdButtonLongPress,
    DpmPdButtonShortPress,

    // Policy engine range.
    PeBistContMode,
    PeChunkingNotSupported,
    PeDataResetFail,
    PeDiscoverIdentity,
    PeNoResponse,
    PePrSwapWait,
    PePsHardReset,
    PePsSource,
    PePsTransition,
    PeSenderResponse,
    PeSinkEprEnter,
    PeSinkEprKeepAlive,
    PeSinkRequest,
    PeSourceCap,
    PeSrcTransition,
    PeSwapSourceStart,
    PeTimeout,
    PeVconnDischarge,
    PeVconnOn,
    PeVconnReapplied,
    PeVdmResponse,
    PeWaitAndAddJitter,

    // Protocol-layer retry range.
    PrChunkSenderRequest,
    PrChunkSenderResponse,
    PrHardResetComplete,
    PrSinkTx,

    // Type-C connection layer range.
    TcCcDebounce,
    TcLowPowerExitTime,
    TcLowPowerTime,
    TcNextRoleSwap,
    TcPdDebounce,
    TcTimeout,
    TcTryWaitDebounce,
    TcVbusDebounce,
}

/// Number of timers per port.
pub const TIMER_COUNT: usize = TimerId::TcVbusDebounce as usize + 1;

/// Timer ownership ranges, clearable as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerRange {
    /// Device policy manager timers.
    Dpm,
    /// Policy engine timers.
    Pe,
    /// Protocol-layer retry timers.
    Pr,
    /// Type-C connection timers.
    Tc,
}

impl TimerRange {
    const fn bounds(self) -> (TimerId, TimerId) {
        match self {
            TimerRange::Dpm => (TimerId::DpmPdButtonLongPress, TimerId::DpmPdButtonShortPress),
            TimerRange::Pe => (TimerId::PeBistContMode, TimerId::PeWaitAndAddJitter),
            TimerRange::Pr => (TimerId::PrChunkSenderRequest, TimerId::PrSinkTx),
            TimerRange::Tc => (TimerId::TcCcDebounce, TimerId::TcVbusDebounce),
        }
    }

    const fn mask(self) -> u64 {
        let (start, end) = self.bounds();
        let (start, end) = (start as u32, end as u32);

        // Contiguous bits start..=end.
        (((1u64 << (end - start + 1)) - 1) << start)
    }
}

impl TimerId {
    const fn bit(self) -> u64 {
        1u64 << (self as u32)
    }
}

/// The timer table for a single port.
#[derive(Debug)]
pub struct PdTimers {
    deadline_us: [u64; TIMER_COUNT],
    active: u64,
    disabled: u64,
}

impl Default for PdTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl PdTimers {
    /// Create a table with every timer disabled.
    pub fn new() -> Self {
        Self {
            deadline_us: [0; TIMER_COUNT],
            active: 0,
            disabled: u64::MAX,
        }
    }

    /// Arm a timer to expire `duration_us` from `now_us`.
    pub fn enable(&mut self, id: TimerId, now_us: u64, duration_us: u64) {
        self.deadline_us[id as usize] = now_us.saturating_add(duration_us);
        self.active |= id.bit();
        self.disabled &= !id.bit();
    }

    /// Disable a timer, dropping any pending expiration.
    pub fn disable(&mut self, id: TimerId) {
        self.active &= !id.bit();
        self.disabled |= id.bit();
    }

    /// Disable every timer in a range at once.
    pub fn disable_range(&mut self, range: TimerRange) {
        let mask = range.mask();
        self.active &= !mask;
        self.disabled |= mask;
    }

    /// Whether a timer is disabled.
    pub fn is_disabled(&self, id: TimerId) -> bool {
        self.disabled & id.bit() != 0
    }

    /// Whether a timer has reached its deadline.
    ///
    /// True for an armed timer whose deadline has passed, and for a timer
    /// parked in the expired state by [`Self::manage_expired`].
    pub fn is_expired(&self, id: TimerId, now_us: u64) -> bool {
        let bit = id.bit();

        if self.active & bit != 0 {
            now_us >= self.deadline_us[id as usize]
        } else {
            self.disabled & bit == 0
        }
    }

    /// Park every currently-expired timer outside the active set.
    ///
    /// Parked timers stop contributing to [`Self::next_expiration`] but
    /// keep reading as expired until disabled.
    pub fn manage_expired(&mut self, now_us: u64) {
        let mut remaining = self.active;

        while remaining != 0 {
            let idx = remaining.trailing_zeros();
            let bit = 1u64 << idx;
            remaining &= !bit;

            if now_us >= self.deadline_us[idx as usize] {
                self.active &= !bit;
            }
        }
    }

    /// Microseconds until the earliest active deadline.
    ///
    /// `None` if no timer is active; `Some(0)` if an active deadline is
    /// already due.
    pub fn next_expiration(&self, now_us: u64) -> Option<u64> {
        let mut remaining = self.active;
        let mut soonest: Option<u64> = None;

        while remaining != 0 {
            let idx = remaining.trailing_zeros();
            remaining &= !(1u64 << idx);

            let delta = self.deadline_us[idx as usize].saturating_sub(now_us);
            soonest = Some(match soonest {
                Some(current) if current <= delta => current,
                _ => delta,
            });
        }

        soonest
    }
}

#[cfg(test)]
mod tests {
    use super::{PdTimers, TimerId, TimerRange};

    #[test]
    fn tri_state_lifecycle() {
        let mut timers = PdTimers::new();

        assert!(timers.is_disabled(TimerId::PeSenderResponse));
        assert!(!timers.is_expired(TimerId::PeSenderResponse, 0));

        timers.enable(TimerId::PeSenderResponse, 1_000, 30_000);
        assert!(!timers.is_disabled(TimerId::PeSenderResponse));
        assert!(!timers.is_expired(TimerId::PeSenderResponse, 30_999));
        assert!(timers.is_expired(TimerId::PeSenderResponse, 31_000));

        // Parking keeps it reporting expired but removes it from the scan.
        timers.manage_expired(31_000);
        assert!(timers.is_expired(TimerId::PeSenderResponse, 31_000));
        assert_eq!(timers.next_expiration(31_000), None);

        timers.disable(TimerId::PeSenderResponse);
        assert!(timers.is_disabled(TimerId::PeSenderResponse));
        assert!(!timers.is_expired(TimerId::PeSenderResponse, 31_000));
    }

    #[test]
    fn expired_implies_not_disabled() {
        let mut timers = PdTimers::new();

        for id in [TimerId::TcCcDebounce, TimerId::PeNoResponse] {
            timers.enable(id, 0, 10);
            timers.manage_expired(10);
            assert!(timers.is_expired(id, 10));
            assert!(!timers.is_disabled(id));
        }
    }

    #[test]
    fn next_expiration_reports_minimum_delta() {
        let mut timers = PdTimers::new();

        assert_eq!(timers.next_expiration(0), None);

        timers.enable(TimerId::TcCcDebounce, 0, 100_000);
        timers.enable(TimerId::TcPdDebounce, 0, 10_000);
        timers.enable(TimerId::PeNoResponse, 0, 5_500_000);

        assert_eq!(timers.next_expiration(0), Some(10_000));
        assert_eq!(timers.next_expiration(4_000), Some(6_000));

        // A due timer reports zero until parked.
        assert_eq!(timers.next_expiration(10_000), Some(0));
        timers.manage_expired(10_000);
        assert_eq!(timers.next_expiration(10_000), Some(90_000));
    }

    #[test]
    fn range_clear_is_atomic_and_scoped() {
        let mut timers = PdTimers::new();

        timers.enable(TimerId::TcCcDebounce, 0, 1);
        timers.enable(TimerId::TcVbusDebounce, 0, 1);
        timers.enable(TimerId::PeSenderResponse, 0, 1);

        timers.disable_range(TimerRange::Tc);

        assert!(timers.is_disabled(TimerId::TcCcDebounce));
        assert!(timers.is_disabled(TimerId::TcVbusDebounce));
        assert!(!timers.is_disabled(TimerId::PeSenderResponse));
    }

    #[test]
    fn reenable_after_expiry_rearms() {
        let mut timers = PdTimers::new();

        timers.enable(TimerId::PeSourceCap, 0, 100);
        timers.manage_expired(100);
        timers.enable(TimerId::PeSourceCap, 100, 100);

        assert!(!timers.is_expired(TimerId::PeSourceCap, 150));
        assert_eq!(timers.next_expiration(150), Some(50));
    }
}
