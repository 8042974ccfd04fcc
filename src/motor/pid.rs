// Cascaded position/speed control law
//
// One update per tick: proportional + integral on the position error, with
// the derivative gain acting on the speed error (reference speed minus
// measured speed), which is the derivative of the position error when the
// reference is a consistent trajectory. The integral freezes while the
// output sits on the clamp.

use serde::{Deserialize, Serialize};

/// Feedback gains in duty steps per degree / degree-second / (deg/s)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

/// Integrator state for one controlled axis
#[derive(Debug, Default)]
pub struct Controller {
    integral: f32,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the integrator; called whenever a new maneuver starts.
    pub fn reset(&mut self) {
        self.integral = 0.0;
    }

    /// One control step. Returns a duty command clamped to `limit` steps.
    pub fn update(
        &mut self,
        gains: PidGains,
        position_error: f32,
        speed_error: f32,
        dt: f32,
        limit: i32,
    ) -> i32 {
        let raw = gains.kp * position_error + gains.ki * self.integral + gains.kd * speed_error;

        let bound = limit as f32;
        let clamped = raw.clamp(-bound, bound);

        // Anti-windup: integrate only while the output is unsaturated
        if raw == clamped {
            self.integral += position_error * dt;
        }

        clamped as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAINS: PidGains = PidGains {
        kp: 100.0,
        ki: 50.0,
        kd: 10.0,
    };

    #[test]
    fn test_proportional_sign_follows_error() {
        let mut control = Controller::new();
        assert!(control.update(GAINS, 5.0, 0.0, 0.005, 10_000) > 0);
        let mut control = Controller::new();
        assert!(control.update(GAINS, -5.0, 0.0, 0.005, 10_000) < 0);
    }

    #[test]
    fn test_output_clamped_to_limit() {
        let mut control = Controller::new();
        assert_eq!(control.update(GAINS, 1e6, 0.0, 0.005, 8_000), 8_000);
        assert_eq!(control.update(GAINS, -1e6, 0.0, 0.005, 8_000), -8_000);
    }

    #[test]
    fn test_integral_accumulates_when_unsaturated() {
        let mut control = Controller::new();
        let first = control.update(GAINS, 2.0, 0.0, 0.1, 10_000);
        let second = control.update(GAINS, 2.0, 0.0, 0.1, 10_000);
        assert!(second > first);
    }

    #[test]
    fn test_integral_freezes_while_saturated() {
        let mut control = Controller::new();
        // Saturate hard for many steps; the integrator must not wind up
        for _ in 0..100 {
            assert_eq!(control.update(GAINS, 1e5, 0.0, 0.1, 5_000), 5_000);
        }
        // A small error right after must not be dominated by stored integral
        let out = control.update(GAINS, 0.1, 0.0, 0.1, 5_000);
        assert!(out.abs() < 100, "windup leaked into output: {}", out);
    }

    #[test]
    fn test_reset_clears_integrator() {
        let mut control = Controller::new();
        for _ in 0..10 {
            control.update(GAINS, 2.0, 0.0, 0.1, 10_000);
        }
        control.reset();
        let out = control.update(GAINS, 0.0, 0.0, 0.1, 10_000);
        assert_eq!(out, 0);
    }
}
