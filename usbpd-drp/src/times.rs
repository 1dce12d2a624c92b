//! USB-PD and Type-C timing constants, in microseconds.
//!
//! Values follow USB-PD r3.1 Table 6-68 and USB Type-C r2.2 Table 4-30,
//! picked at the points the original firmware ships with.

/// tCCDebounce: CC stable before attach is declared.
pub const T_CC_DEBOUNCE_US: u64 = 100_000;
/// tPDDebounce: CC stable before detach is declared.
pub const T_PD_DEBOUNCE_US: u64 = 10_000;
/// tDRPTry: window to present Rp during Try.SRC.
pub const T_DRP_TRY_US: u64 = 125_000;
/// tErrorRecovery: CC Open dwell time.
pub const T_ERROR_RECOVERY_US: u64 = 25_000;
/// vBus debounce when sinking with FRS armed.
pub const T_FRS_VBUS_DEBOUNCE_US: u64 = 5_000;
/// Debounce before handing CC toggling to the TCPC.
pub const T_DRP_AUTO_TOGGLE_US: u64 = 100_000;
/// Dwell before dropping to low-power mode once toggling is in hardware.
pub const T_LOW_POWER_US: u64 = 500_000;
/// Debounce on low-power mode exit.
pub const T_LOW_POWER_EXIT_US: u64 = 100_000;

/// tSenderResponse: reply budget after GoodCRC of a request.
pub const T_SENDER_RESPONSE_US: u64 = 30_000;
/// tSinkWaitCap: budget for the first Source_Capabilities.
pub const T_SINK_WAIT_CAP_US: u64 = 465_000;
/// tPSTransition: Accept to PS_RDY while the supply settles.
pub const T_PS_TRANSITION_US: u64 = 500_000;
/// tSrcTransition: Accept to supply change on the source side.
pub const T_SRC_TRANSITION_US: u64 = 35_000;
/// tSrcRecover (max): source dwell before re-driving vBus after Hard Reset.
pub const T_SRC_RECOVER_MAX_US: u64 = 1_000_000;
/// tSrcTurnOn: supply ramp budget.
pub const T_SRC_TURN_ON_US: u64 = 275_000;
/// tSafe0V: budget for vBus to reach vSafe0V during Hard Reset.
pub const T_SAFE_0V_US: u64 = 650_000;
/// tPSHardReset: Hard Reset signaling to supply shutdown on the source.
pub const T_PS_HARD_RESET_US: u64 = 25_000;
/// tNoResponse: partner silence budget before giving up.
pub const T_NO_RESPONSE_US: u64 = 5_500_000;
/// tSwapSourceStart: delay before first Source_Capabilities after a swap.
pub const T_SWAP_SOURCE_START_US: u64 = 25_000;
/// tSendSourceCap: spacing of unanswered Source_Capabilities retries.
pub const T_SEND_SOURCE_CAP_US: u64 = 150_000;
/// tSinkRequest: back-off after a Wait response to a Request.
pub const T_SINK_REQUEST_US: u64 = 100_000;
/// tPRSwapWait: back-off after a Wait response to PR_Swap.
pub const T_PR_SWAP_WAIT_US: u64 = 100_000;
/// tPSSourceOff: PS_RDY budget while the original source powers down.
pub const T_PS_SOURCE_OFF_US: u64 = 835_000;
/// tPSSourceOn: PS_RDY budget while the new source powers up.
pub const T_PS_SOURCE_ON_US: u64 = 435_000;
/// tVCONNSourceOn: partner budget to release VCONN in a VCONN_Swap.
pub const T_VCONN_SOURCE_ON_US: u64 = 100_000;
/// Settle time after switching the local VCONN supply.
pub const VCONN_SWAP_DELAY_US: u64 = 5_000;
/// tVCONNDischarge: UFP budget to discharge VCONN during Data Reset.
pub const T_VCONN_DISCHARGE_US: u64 = 200_000;
/// tVCONNReapplied: VCONN off dwell during the Data Reset power cycle.
pub const T_VCONN_REAPPLIED_US: u64 = 15_000;
/// tDataResetFail: whole-sequence watchdog for the DFP Data Reset chain.
pub const T_DATA_RESET_FAIL_US: u64 = 225_000;
/// tDataResetFailUFP: the UFP's larger watchdog for the same sequence.
pub const T_DATA_RESET_FAIL_UFP_US: u64 = 500_000;
/// tVDMSenderResponse: reply budget for structured VDM requests.
pub const T_VDM_SENDER_RESPONSE_US: u64 = 30_000;
/// tVDMBusy: retry spacing after a BUSY VDM response.
pub const T_VDM_BUSY_US: u64 = 50_000;
/// Discover Identity retry spacing before an explicit contract.
pub const T_DISCOVER_IDENTITY_NO_CONTRACT_US: u64 = 200_000;
/// Discover Identity spacing under an explicit contract.
pub const T_DISCOVER_IDENTITY_US: u64 = 45_000;
/// tBISTContMode: dwell in BIST carrier mode.
pub const T_BIST_CONT_MODE_US: u64 = 45_000;
/// tEnterEPR: overall budget for EPR mode entry.
pub const T_SINK_EPR_ENTER_US: u64 = 500_000;
/// tSinkEPRKeepAlive: spacing of EPR_KeepAlive messages.
pub const T_SINK_EPR_KEEP_ALIVE_US: u64 = 375_000;
/// tSinkAdj: partner settle time after an Rp current-limit downgrade.
pub const T_SINK_ADJ_US: u64 = 750_000;
/// Settle time granted to a port asked to disarm FRS during rebalance.
pub const T_FRS_DISABLE_SETTLE_US: u64 = 20_000;
/// PD r2.0 first-message jitter cap, to avoid AMS collisions.
pub const T_WAIT_AND_ADD_JITTER_US: u64 = 400_000;
/// Power-supply turn-on delay the TC waits before starting the PE.
pub const POWER_SUPPLY_TURN_ON_DELAY_US: u64 = 30_000;
/// VCONN stable time before cable discovery may start.
pub const T_VCONN_STABLE_US: u64 = 50_000;

/// USB-PD power button: longest press still treated as "short".
pub const PD_BUTTON_SHORT_PRESS_MAX_US: u64 = 4_000_000;
/// USB-PD power button: presses longer than this are ignored as stuck.
pub const PD_BUTTON_LONG_PRESS_MAX_US: u64 = 8_000_000;

/// Suspend acknowledgement busy-wait bound.
pub const SUSPEND_ACK_TIMEOUT_US: u64 = 300_000;
