// H-bridge actuator driver
//
// Owns one physical actuator's direction and duty state machine. The duty
// value is meaningful only in the two active states; coast and brake park the
// bridge with zero duty, free-wheeling vs electrically braking being the only
// difference.

use tracing::debug;

use crate::config::{DUTY_STEPS, DUTY_STEPS_PER_USER_STEP, DUTY_USER_STEPS};
use crate::error::{HubError, Result};
use crate::registry::PortId;
use crate::transport::{MotorPort, PassiveMode};

/// Which shaft rotation counts as positive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Clockwise,
    Counterclockwise,
}

impl Direction {
    fn sign(self) -> i32 {
        match self {
            Direction::Clockwise => 1,
            Direction::Counterclockwise => -1,
        }
    }
}

/// Drive mode of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Passivity {
    /// High impedance, motor freewheels
    Coast,
    /// Short brake
    Brake,
    /// Constant duty from an open-loop command
    DutyPassive,
    /// Varying duty written by an active controller
    Claimed,
}

pub struct HBridge {
    port_id: PortId,
    direction: Direction,
    duty_offset: i32,
    max_duty: i32,
    state: Passivity,
    duty_now: i32,
    port: Box<dyn MotorPort>,
}

impl HBridge {
    /// Wrap a transport port. The caller coasts the bridge right after.
    pub fn new(port_id: PortId, port: Box<dyn MotorPort>, direction: Direction) -> Self {
        Self {
            port_id,
            direction,
            duty_offset: 0,
            max_duty: DUTY_STEPS,
            state: Passivity::Coast,
            duty_now: 0,
            port,
        }
    }

    /// Update direction, friction offset and duty ceiling, in user percent.
    pub fn configure(
        &mut self,
        direction: Direction,
        duty_offset_pct: i32,
        max_duty_pct: i32,
    ) -> Result<()> {
        if !(0..=DUTY_USER_STEPS).contains(&max_duty_pct) {
            return Err(HubError::InvalidArgument(format!(
                "max duty {}% outside 0..=100",
                max_duty_pct
            )));
        }
        if !(0..=DUTY_USER_STEPS).contains(&duty_offset_pct) || duty_offset_pct > max_duty_pct {
            return Err(HubError::InvalidArgument(format!(
                "duty offset {}% outside 0..={}",
                duty_offset_pct, max_duty_pct
            )));
        }
        self.direction = direction;
        self.duty_offset = duty_offset_pct * DUTY_STEPS_PER_USER_STEP;
        self.max_duty = max_duty_pct * DUTY_STEPS_PER_USER_STEP;
        Ok(())
    }

    pub fn coast(&mut self) -> Result<()> {
        self.port.set_passive_mode(PassiveMode::Coast)?;
        self.state = Passivity::Coast;
        self.duty_now = 0;
        Ok(())
    }

    pub fn brake(&mut self) -> Result<()> {
        self.port.set_passive_mode(PassiveMode::Brake)?;
        self.state = Passivity::Brake;
        self.duty_now = 0;
        Ok(())
    }

    /// Open-loop duty command. Entering from coast/brake first moves the
    /// bridge to the passive-duty state.
    pub fn set_duty_passive(&mut self, steps: i32) -> Result<()> {
        self.state = Passivity::DutyPassive;
        self.apply(steps)
    }

    /// Closed-loop duty command from the owning controller. The most recent
    /// active writer wins; there is no multi-owner arbitration here.
    pub fn set_duty_claimed(&mut self, steps: i32) -> Result<()> {
        self.state = Passivity::Claimed;
        self.apply(steps)
    }

    /// User-percentage duty entry point (-100.0..=100.0)
    pub fn set_duty_user(&mut self, duty_pct: f32) -> Result<()> {
        if !(-100.0..=100.0).contains(&duty_pct) {
            return Err(HubError::InvalidArgument(format!(
                "duty {}% outside -100..=100",
                duty_pct
            )));
        }
        let steps = (duty_pct * DUTY_STEPS_PER_USER_STEP as f32) as i32;
        self.set_duty_passive(steps)
    }

    pub fn get_state(&self) -> (Passivity, i32) {
        (self.state, self.duty_now)
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn max_duty(&self) -> i32 {
        self.max_duty
    }

    /// Encoder access for the controller that owns this bridge
    pub fn port_mut(&mut self) -> &mut dyn MotorPort {
        self.port.as_mut()
    }

    fn apply(&mut self, steps: i32) -> Result<()> {
        let clamped = steps.clamp(-self.max_duty, self.max_duty);
        self.duty_now = clamped;

        // Nonzero commands get the static-friction offset in the direction of
        // travel; the remaining span is rescaled so full command still maps to
        // full duty.
        let raw = if clamped == 0 {
            0
        } else {
            let magnitude =
                self.duty_offset + clamped.abs() * (DUTY_STEPS - self.duty_offset) / DUTY_STEPS;
            clamped.signum() * magnitude
        };
        let raw = raw * self.direction.sign();

        debug!("port {}: duty {} -> raw {}", self.port_id, clamped, raw);
        self.port.write_duty(raw as i16)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockMotor;

    fn bridge(mock: &MockMotor) -> HBridge {
        HBridge::new(
            PortId::new(0).unwrap(),
            Box::new(mock.port()),
            Direction::Clockwise,
        )
    }

    #[test]
    fn test_claimed_duty_reflected_in_state() {
        let mock = MockMotor::new();
        let mut hbridge = bridge(&mock);

        for duty in [-10_000, -500, 0, 1, 9_999] {
            hbridge.set_duty_claimed(duty).unwrap();
            assert_eq!(hbridge.get_state(), (Passivity::Claimed, duty));
        }
    }

    #[test]
    fn test_coast_then_passive_duty_transition() {
        let mock = MockMotor::new();
        let mut hbridge = bridge(&mock);

        hbridge.set_duty_claimed(4000).unwrap();
        hbridge.coast().unwrap();
        assert_eq!(hbridge.get_state(), (Passivity::Coast, 0));
        assert_eq!(mock.passive_mode(), Some(PassiveMode::Coast));

        hbridge.set_duty_passive(2500).unwrap();
        assert_eq!(hbridge.get_state(), (Passivity::DutyPassive, 2500));
    }

    #[test]
    fn test_brake_zeroes_duty() {
        let mock = MockMotor::new();
        let mut hbridge = bridge(&mock);

        hbridge.set_duty_passive(3000).unwrap();
        hbridge.brake().unwrap();
        assert_eq!(hbridge.get_state(), (Passivity::Brake, 0));
        assert_eq!(mock.passive_mode(), Some(PassiveMode::Brake));
    }

    #[test]
    fn test_duty_clamped_to_configured_maximum() {
        let mock = MockMotor::new();
        let mut hbridge = bridge(&mock);
        hbridge.configure(Direction::Clockwise, 0, 80).unwrap();

        hbridge.set_duty_claimed(10_000).unwrap();
        assert_eq!(hbridge.get_state(), (Passivity::Claimed, 8_000));
        assert_eq!(mock.last_duty(), 8_000);

        hbridge.set_duty_claimed(-10_000).unwrap();
        assert_eq!(mock.last_duty(), -8_000);
    }

    #[test]
    fn test_friction_offset_applied_with_travel_sign() {
        let mock = MockMotor::new();
        let mut hbridge = bridge(&mock);
        hbridge.configure(Direction::Clockwise, 10, 100).unwrap();

        // 1000 steps offset; remaining span rescaled into 9000/10000
        hbridge.set_duty_claimed(5_000).unwrap();
        assert_eq!(mock.last_duty(), 1000 + (5_000_i32 * 9_000 / 10_000) as i16);

        hbridge.set_duty_claimed(-5_000).unwrap();
        assert_eq!(mock.last_duty(), -(1000 + 4_500));

        // Zero command writes zero, never the bare offset
        hbridge.set_duty_claimed(0).unwrap();
        assert_eq!(mock.last_duty(), 0);

        // Full command still reaches full duty
        hbridge.set_duty_claimed(10_000).unwrap();
        assert_eq!(mock.last_duty(), 10_000);
    }

    #[test]
    fn test_counterclockwise_flips_raw_polarity() {
        let mock = MockMotor::new();
        let mut hbridge = HBridge::new(
            PortId::new(0).unwrap(),
            Box::new(mock.port()),
            Direction::Counterclockwise,
        );

        hbridge.set_duty_claimed(3_000).unwrap();
        assert_eq!(mock.last_duty(), -3_000);
        // Reported duty keeps the commanded sign
        assert_eq!(hbridge.get_state(), (Passivity::Claimed, 3_000));
    }

    #[test]
    fn test_configure_rejects_bad_percentages() {
        let mock = MockMotor::new();
        let mut hbridge = bridge(&mock);

        assert!(hbridge.configure(Direction::Clockwise, 0, 101).is_err());
        assert!(hbridge.configure(Direction::Clockwise, -1, 100).is_err());
        assert!(hbridge.configure(Direction::Clockwise, 50, 40).is_err());
    }

    #[test]
    fn test_user_duty_range_checked() {
        let mock = MockMotor::new();
        let mut hbridge = bridge(&mock);

        assert!(hbridge.set_duty_user(150.0).is_err());
        hbridge.set_duty_user(-50.0).unwrap();
        assert_eq!(hbridge.get_state(), (Passivity::DutyPassive, -5_000));
    }
}
