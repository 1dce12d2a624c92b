//! The Status Data Block, sent in response to Get_Status.
//!
//! Six bytes in PD r3.0; r3.1 appends the power-state-change byte.

/// Temperature status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TemperatureStatus {
    /// Reporting not supported.
    NotSupported,
    /// Within normal limits.
    Normal,
    /// Under a warning threshold.
    Warning,
    /// Over temperature.
    OverTemperature,
}

impl From<TemperatureStatus> for u8 {
    fn from(value: TemperatureStatus) -> Self {
        match value {
            TemperatureStatus::NotSupported => 0b00 << 1,
            TemperatureStatus::Normal => 0b01 << 1,
            TemperatureStatus::Warning => 0b10 << 1,
            TemperatureStatus::OverTemperature => 0b11 << 1,
        }
    }
}

/// Chipset power states reported in the r3.1 power-state-change byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// Not supported / unknown.
    NotSupported,
    /// S0.
    S0,
    /// Modern standby.
    ModernStandby,
    /// S3.
    S3,
    /// S4.
    S4,
    /// S5.
    S5,
    /// G3.
    G3,
}

impl From<PowerState> for u8 {
    fn from(value: PowerState) -> Self {
        match value {
            PowerState::NotSupported => 0,
            PowerState::S0 => 1,
            PowerState::ModernStandby => 2,
            PowerState::S3 => 3,
            PowerState::S4 => 4,
            PowerState::S5 => 5,
            PowerState::G3 => 6,
        }
    }
}

/// Power state indicator LED hint, OR-ed into the power-state byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerIndicator {
    /// Indicator off.
    Off,
    /// Indicator on.
    On,
    /// Indicator blinking.
    Blinking,
}

impl From<PowerIndicator> for u8 {
    fn from(value: PowerIndicator) -> Self {
        match value {
            PowerIndicator::Off => 0b00 << 3,
            PowerIndicator::On => 0b01 << 3,
            PowerIndicator::Blinking => 0b10 << 3,
        }
    }
}

/// The Status Data Block.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusDataBlock {
    /// Internal temperature in degrees Celsius; 0 means unsupported,
    /// 1 means below 2 °C.
    pub internal_temp: u8,
    /// Present input power sources.
    pub present_input: u8,
    /// Battery the input draws from, if any.
    pub present_battery_input: u8,
    /// Event flags (OCP/OTP/OVP latches).
    pub event_flags: u8,
    /// Temperature status field, pre-shifted.
    pub temperature_status: u8,
    /// Power status field.
    pub power_status: u8,
    /// r3.1 power-state-change field; `None` when talking to r3.0.
    pub power_state_change: Option<u8>,
}

impl StatusDataBlock {
    /// Serialize the block, returning the number of written bytes (6 or 7).
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.internal_temp;
        buf[1] = self.present_input;
        buf[2] = self.present_battery_input;
        buf[3] = self.event_flags;
        buf[4] = self.temperature_status;
        buf[5] = self.power_status;

        match self.power_state_change {
            Some(power_state_change) => {
                buf[6] = power_state_change;
                7
            }
            None => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PowerIndicator, PowerState, StatusDataBlock, TemperatureStatus};

    #[test]
    fn revision_controls_length() {
        let mut sdb = StatusDataBlock {
            internal_temp: 35,
            temperature_status: TemperatureStatus::Normal.into(),
            ..Default::default()
        };

        let mut buf = [0u8; 8];
        assert_eq!(sdb.to_bytes(&mut buf), 6);

        sdb.power_state_change = Some(u8::from(PowerState::S0) | u8::from(PowerIndicator::On));
        assert_eq!(sdb.to_bytes(&mut buf), 7);
        assert_eq!(buf[6], 0b0000_1001);
    }
}
