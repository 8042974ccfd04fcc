// Battery sensing and the voltage-aware duty ceiling
//
// The scheduler refreshes the shared `BatteryState` once per tick; everyone
// else only reads the atomic snapshot and never blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{
    ADC_CHANNEL_COUNT, BATTERY_CURRENT_CH, BATTERY_CURRENT_CORRECTION_SIXTEENTH_OHM,
    BATTERY_CURRENT_RAW_MAX, BATTERY_CURRENT_RAW_OFFSET, BATTERY_CURRENT_SCALED_MAX,
    BATTERY_NOMINAL_ALKALINE_MV, BATTERY_NOMINAL_RECHARGEABLE_MV, BATTERY_VOLTAGE_CH,
    BATTERY_VOLTAGE_RAW_MAX, BATTERY_VOLTAGE_SCALED_MAX, DUTY_STEPS,
};
use crate::error::{HubError, Result};
use crate::transport::AdcReader;

/// Battery chemistry, fixed by build configuration or detected once at init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryChemistry {
    Alkaline,
    Rechargeable,
}

impl BatteryChemistry {
    pub fn nominal_mv(self) -> u32 {
        match self {
            BatteryChemistry::Alkaline => BATTERY_NOMINAL_ALKALINE_MV,
            BatteryChemistry::Rechargeable => BATTERY_NOMINAL_RECHARGEABLE_MV,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            BatteryChemistry::Alkaline => 0,
            BatteryChemistry::Rechargeable => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BatteryChemistry::Alkaline,
            _ => BatteryChemistry::Rechargeable,
        }
    }
}

/// Snapshot published by the battery layer for the binding/diagnostic surface
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatteryReading {
    pub voltage_mv: u32,
    pub current_ma: u32,
    pub chemistry: BatteryChemistry,
}

/// Process-wide battery state, refreshed once per scheduler tick.
///
/// Stored in atomics so readers on any thread see a consistent-enough value
/// without taking a lock.
pub struct BatteryState {
    voltage_mv: AtomicU32,
    current_ma: AtomicU32,
    chemistry: AtomicU8,
}

impl Default for BatteryState {
    fn default() -> Self {
        Self::new(BatteryChemistry::Alkaline)
    }
}

impl BatteryState {
    fn new(chemistry: BatteryChemistry) -> Self {
        Self {
            voltage_mv: AtomicU32::new(0),
            current_ma: AtomicU32::new(0),
            chemistry: AtomicU8::new(chemistry.to_u8()),
        }
    }

    pub fn voltage_mv(&self) -> u32 {
        self.voltage_mv.load(Ordering::Relaxed)
    }

    pub fn current_ma(&self) -> u32 {
        self.current_ma.load(Ordering::Relaxed)
    }

    pub fn chemistry(&self) -> BatteryChemistry {
        BatteryChemistry::from_u8(self.chemistry.load(Ordering::Relaxed))
    }

    pub fn reading(&self) -> BatteryReading {
        BatteryReading {
            voltage_mv: self.voltage_mv(),
            current_ma: self.current_ma(),
            chemistry: self.chemistry(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_voltage_for_tests(&self, mv: u32) {
        self.voltage_mv.store(mv, Ordering::Relaxed);
    }

    /// Duty ceiling compensated for supply sag.
    ///
    /// A torque limit is calibrated against the nominal supply; when the
    /// measured voltage drops below nominal, the same torque needs more duty,
    /// so the ceiling grows by `nominal / measured`, saturating at full duty.
    pub fn duty_limit(&self, requested_steps: i32) -> i32 {
        let measured = self.voltage_mv();
        if measured == 0 {
            return requested_steps.min(DUTY_STEPS);
        }
        let nominal = self.chemistry().nominal_mv();
        let scaled = requested_steps as i64 * nominal as i64 / measured as i64;
        scaled.clamp(0, DUTY_STEPS as i64) as i32
    }
}

/// Convert a raw current-sense reading to milliamps (integer truncation)
pub fn convert_current_ma(raw: u16) -> u32 {
    (raw as u32 + BATTERY_CURRENT_RAW_OFFSET) * BATTERY_CURRENT_SCALED_MAX
        / BATTERY_CURRENT_RAW_MAX
}

/// Convert a raw voltage-sense reading to millivolts.
///
/// The correction term adds back the drop across the current-sense resistor,
/// `current_ma * correction / 16` with the correction in 1/16 Ohm.
pub fn convert_voltage_mv(raw: u16, current_ma: u32) -> u32 {
    raw as u32 * BATTERY_VOLTAGE_SCALED_MAX / BATTERY_VOLTAGE_RAW_MAX
        + current_ma * BATTERY_CURRENT_CORRECTION_SIXTEENTH_OHM / 16
}

/// Samples the sense channels and publishes `BatteryState`
pub struct BatteryMonitor {
    adc: Box<dyn AdcReader>,
    state: Arc<BatteryState>,
}

impl BatteryMonitor {
    /// Create the monitor.
    ///
    /// With `chemistry: None` the type is read once from the detect pin
    /// (high = alkaline); passing `Some` fixes it by configuration.
    pub fn new(mut adc: Box<dyn AdcReader>, chemistry: Option<BatteryChemistry>) -> Result<Self> {
        let chemistry = match chemistry {
            Some(c) => c,
            None => {
                if adc.read_type_pin()? {
                    BatteryChemistry::Alkaline
                } else {
                    BatteryChemistry::Rechargeable
                }
            }
        };
        info!("battery chemistry: {:?}", chemistry);
        Ok(Self {
            adc,
            state: Arc::new(BatteryState::new(chemistry)),
        })
    }

    /// Shared snapshot handle for controllers and the binding layer
    pub fn state(&self) -> Arc<BatteryState> {
        self.state.clone()
    }

    /// Sample both channels and publish the converted values.
    ///
    /// On error the previous snapshot is kept; the scheduler logs and moves
    /// on rather than stalling the tick.
    pub fn refresh(&mut self) -> Result<()> {
        let current_ma = convert_current_ma(self.read_channel(BATTERY_CURRENT_CH)?);
        let raw_voltage = self.read_channel(BATTERY_VOLTAGE_CH)?;
        let voltage_mv = convert_voltage_mv(raw_voltage, current_ma);

        self.state.current_ma.store(current_ma, Ordering::Relaxed);
        self.state.voltage_mv.store(voltage_mv, Ordering::Relaxed);
        Ok(())
    }

    fn read_channel(&mut self, channel: u8) -> Result<u16> {
        if channel >= ADC_CHANNEL_COUNT {
            return Err(HubError::InvalidArgument(format!(
                "ADC channel {} exceeds maximum {}",
                channel,
                ADC_CHANNEL_COUNT - 1
            )));
        }
        Ok(self.adc.read_channel(channel)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockAdc;

    #[test]
    fn test_current_conversion_truncates() {
        // (100 + 20) * 2000 / 4096 = 58 with integer truncation
        assert_eq!(convert_current_ma(100), 58);
    }

    #[test]
    fn test_voltage_correction_uses_converted_current() {
        let current = convert_current_ma(100);
        // raw * 9600 / 4096 + 58 * 12 / 16 = 4687 + 43
        assert_eq!(convert_voltage_mv(2000, current), 4687 + 43);
    }

    #[test]
    fn test_refresh_publishes_snapshot() {
        let adc = MockAdc::new(&[2000, 100, 0, 0], true);
        let mut monitor = BatteryMonitor::new(Box::new(adc), None).unwrap();
        let state = monitor.state();

        monitor.refresh().unwrap();

        assert_eq!(state.current_ma(), 58);
        assert_eq!(state.voltage_mv(), 4730);
        assert_eq!(state.chemistry(), BatteryChemistry::Alkaline);
    }

    #[test]
    fn test_chemistry_from_type_pin() {
        let adc = MockAdc::new(&[0, 0, 0, 0], false);
        let monitor = BatteryMonitor::new(Box::new(adc), None).unwrap();
        assert_eq!(monitor.state().chemistry(), BatteryChemistry::Rechargeable);
    }

    #[test]
    fn test_duty_limit_grows_as_voltage_sags() {
        let adc = MockAdc::new(&[0, 0, 0, 0], true);
        let monitor = BatteryMonitor::new(Box::new(adc), Some(BatteryChemistry::Alkaline)).unwrap();
        let state = monitor.state();

        // No measurement yet: pass through, capped at full duty
        assert_eq!(state.duty_limit(5000), 5000);

        state.voltage_mv.store(6000, Ordering::Relaxed);
        // 5000 * 9000 / 6000 = 7500
        assert_eq!(state.duty_limit(5000), 7500);
        // Saturates at full duty
        assert_eq!(state.duty_limit(9000), DUTY_STEPS);
    }

    #[test]
    fn test_channel_range_checked() {
        let adc = MockAdc::new(&[0, 0, 0, 0], true);
        let mut monitor =
            BatteryMonitor::new(Box::new(adc), Some(BatteryChemistry::Alkaline)).unwrap();
        let err = monitor.read_channel(ADC_CHANNEL_COUNT).unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));
    }
}
