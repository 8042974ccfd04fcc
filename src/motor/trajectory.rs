// Time-parameterized motion profiles
//
// A trajectory is computed once per command from the state at issue time and
// never mutated; the next command replaces it wholesale. Bounded profiles are
// trapezoidal (triangular when the travel cannot fit both ramps); unbounded
// profiles ramp to a cruise speed and hold it, optionally until a fixed end
// time.

use std::time::Instant;

/// Position/speed reference sampled from a trajectory at one tick
#[derive(Debug, Clone, Copy)]
pub struct Reference {
    /// deg
    pub position: f32,
    /// deg/s
    pub speed: f32,
    /// Past the end of the plan (always false for endless profiles)
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct Trajectory {
    start_time: Instant,
    start_pos: f32,
    start_speed: f32,
    /// Signed cruise speed; never exceeded by any sample
    cruise_speed: f32,
    /// Signed acceleration during the entry ramp
    accel_in: f32,
    /// Deceleration magnitude for the exit ramp (bounded profiles)
    accel_out: f32,
    target_pos: Option<f32>,
    /// End of the entry ramp, seconds from start
    t_ramp: f32,
    /// Start of the exit ramp (bounded), or plan end (timed), else infinity
    t_cruise_end: f32,
    /// Plan end; infinity for endless profiles
    t_end: f32,
}

impl Trajectory {
    /// Trapezoidal profile from the issue-time state to a target angle.
    ///
    /// `speed` is the cruise magnitude; direction follows the sign of the
    /// remaining travel. `accel_start`/`accel_end` are the ramp magnitudes.
    pub fn bounded(
        start_time: Instant,
        start_pos: f32,
        start_speed: f32,
        target_pos: f32,
        speed: f32,
        accel_start: f32,
        accel_end: f32,
    ) -> Self {
        let dist = target_pos - start_pos;
        let dir = if dist < 0.0 { -1.0 } else { 1.0 };
        let mut cruise = speed.abs() * dir;

        // Only the travel-direction component of the entry speed shortens the
        // ramps; a wrong-way entry speed just makes the first ramp longer.
        let v0 = start_speed;
        let d_total = dist.abs();

        // Shrink the cruise speed to a triangular profile when the ramps
        // cannot fit inside the travel.
        let v0_along = (v0 * dir).max(0.0);
        let d_in = ((cruise * cruise) - v0_along * v0_along).max(0.0) / (2.0 * accel_start);
        let d_out = cruise * cruise / (2.0 * accel_end);
        if d_in + d_out > d_total {
            let peak_sq = (2.0 * accel_start * accel_end * d_total
                + accel_end * v0_along * v0_along)
                / (accel_start + accel_end);
            let peak = peak_sq.max(0.0).sqrt().max(v0_along);
            cruise = peak * dir;
        }

        let accel_in = accel_start * if cruise >= v0 { 1.0 } else { -1.0 };
        let t_ramp = if accel_in == 0.0 {
            0.0
        } else {
            (cruise - v0) / accel_in
        };
        let p_ramp = v0 * t_ramp + 0.5 * accel_in * t_ramp * t_ramp;

        let d_out = cruise * cruise / (2.0 * accel_end) * dir;
        let d_cruise = dist - p_ramp - d_out;
        let t_cruise = if cruise == 0.0 {
            0.0
        } else {
            (d_cruise / cruise).max(0.0)
        };
        let t_cruise_end = t_ramp + t_cruise;
        let t_exit = if accel_end == 0.0 {
            0.0
        } else {
            cruise.abs() / accel_end
        };

        Self {
            start_time,
            start_pos,
            start_speed: v0,
            cruise_speed: cruise,
            accel_in,
            accel_out: accel_end,
            target_pos: Some(target_pos),
            t_ramp,
            t_cruise_end,
            t_end: t_cruise_end + t_exit,
        }
    }

    /// Ramp from the issue-time speed to `speed` and hold it, forever or for
    /// `duration` seconds.
    pub fn unbounded(
        start_time: Instant,
        start_pos: f32,
        start_speed: f32,
        speed: f32,
        accel: f32,
        duration: Option<f32>,
    ) -> Self {
        let accel_in = accel * if speed >= start_speed { 1.0 } else { -1.0 };
        let t_ramp = if accel_in == 0.0 {
            0.0
        } else {
            (speed - start_speed) / accel_in
        };
        let t_end = duration.unwrap_or(f32::INFINITY);

        Self {
            start_time,
            start_pos,
            start_speed,
            cruise_speed: speed,
            accel_in,
            accel_out: 0.0,
            target_pos: None,
            t_ramp,
            t_cruise_end: t_end,
            t_end,
        }
    }

    pub fn target(&self) -> Option<f32> {
        self.target_pos
    }

    /// Whether the plan ends at a fixed time rather than a position
    pub fn is_timed(&self) -> bool {
        self.target_pos.is_none() && self.t_end.is_finite()
    }

    /// Sample the reference for the given wall-clock instant
    pub fn sample(&self, now: Instant) -> Reference {
        let t = now.saturating_duration_since(self.start_time).as_secs_f32();

        let (position, speed) = if t < self.t_ramp {
            (
                self.start_pos + self.start_speed * t + 0.5 * self.accel_in * t * t,
                self.start_speed + self.accel_in * t,
            )
        } else if t < self.t_cruise_end {
            let p_ramp = self.start_pos
                + self.start_speed * self.t_ramp
                + 0.5 * self.accel_in * self.t_ramp * self.t_ramp;
            (p_ramp + self.cruise_speed * (t - self.t_ramp), self.cruise_speed)
        } else if t < self.t_end {
            // Exit ramp of a bounded profile
            let tau = t - self.t_cruise_end;
            let dir = if self.cruise_speed < 0.0 { -1.0 } else { 1.0 };
            let p_cruise_end = self.start_pos
                + self.start_speed * self.t_ramp
                + 0.5 * self.accel_in * self.t_ramp * self.t_ramp
                + self.cruise_speed * (self.t_cruise_end - self.t_ramp);
            (
                p_cruise_end + self.cruise_speed * tau - 0.5 * dir * self.accel_out * tau * tau,
                self.cruise_speed - dir * self.accel_out * tau,
            )
        } else if let Some(target) = self.target_pos {
            return Reference {
                position: target,
                speed: 0.0,
                done: true,
            };
        } else {
            // Endless or timed speed profile past its ramp
            let p_ramp = self.start_pos
                + self.start_speed * self.t_ramp
                + 0.5 * self.accel_in * self.t_ramp * self.t_ramp;
            return Reference {
                position: p_ramp + self.cruise_speed * (t - self.t_ramp),
                speed: self.cruise_speed,
                done: t >= self.t_end,
            };
        };

        Reference {
            position,
            speed,
            done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_all(traj: &Trajectory, t0: Instant, ticks: u32) -> Vec<Reference> {
        (0..=ticks)
            .map(|i| traj.sample(t0 + Duration::from_millis(5) * i))
            .collect()
    }

    #[test]
    fn test_trapezoid_reaches_target() {
        let t0 = Instant::now();
        let traj = Trajectory::bounded(t0, 0.0, 0.0, 180.0, 500.0, 2000.0, 2000.0);

        let end = traj.sample(t0 + Duration::from_secs(10));
        assert!(end.done);
        assert_eq!(end.position, 180.0);
        assert_eq!(end.speed, 0.0);
    }

    #[test]
    fn test_trapezoid_never_exceeds_cruise_speed() {
        let t0 = Instant::now();
        let traj = Trajectory::bounded(t0, 0.0, 0.0, 720.0, 500.0, 2000.0, 2000.0);

        for reference in sample_all(&traj, t0, 600) {
            assert!(
                reference.speed.abs() <= 500.0 + 1e-3,
                "sampled speed {} exceeds cruise",
                reference.speed
            );
        }
    }

    #[test]
    fn test_negative_travel_mirrors_profile() {
        let t0 = Instant::now();
        let traj = Trajectory::bounded(t0, 90.0, 0.0, -90.0, 400.0, 1500.0, 1500.0);

        let mid = traj.sample(t0 + Duration::from_millis(300));
        assert!(mid.speed < 0.0);
        let end = traj.sample(t0 + Duration::from_secs(10));
        assert!(end.done);
        assert_eq!(end.position, -90.0);
    }

    #[test]
    fn test_short_travel_degrades_to_triangle() {
        let t0 = Instant::now();
        // 10 deg of travel cannot fit 500 deg/s ramps at 2000 deg/s^2
        let traj = Trajectory::bounded(t0, 0.0, 0.0, 10.0, 500.0, 2000.0, 2000.0);

        let mut peak = 0.0f32;
        for reference in sample_all(&traj, t0, 400) {
            peak = peak.max(reference.speed.abs());
        }
        // Triangular peak: sqrt(2 * 1000 * 2000 * 10 / 4000) = sqrt(20000)
        assert!(peak < 500.0);
        assert!((peak - 20000.0f32.sqrt()).abs() < 15.0);

        let end = traj.sample(t0 + Duration::from_secs(5));
        assert!(end.done);
        assert_eq!(end.position, 10.0);
    }

    #[test]
    fn test_unbounded_ramp_then_hold() {
        let t0 = Instant::now();
        let traj = Trajectory::unbounded(t0, 0.0, 0.0, 300.0, 1500.0, None);

        // Ramp lasts 0.2 s
        let during = traj.sample(t0 + Duration::from_millis(100));
        assert!((during.speed - 150.0).abs() < 1.0);

        let after = traj.sample(t0 + Duration::from_secs(2));
        assert_eq!(after.speed, 300.0);
        assert!(!after.done);
    }

    #[test]
    fn test_timed_profile_flags_done() {
        let t0 = Instant::now();
        let traj = Trajectory::unbounded(t0, 0.0, 0.0, 300.0, 1500.0, Some(1.0));

        assert!(traj.is_timed());
        assert!(!traj.sample(t0 + Duration::from_millis(900)).done);
        assert!(traj.sample(t0 + Duration::from_millis(1100)).done);
    }

    #[test]
    fn test_zero_travel_is_immediately_done() {
        let t0 = Instant::now();
        let traj = Trajectory::bounded(t0, 45.0, 0.0, 45.0, 500.0, 2000.0, 2000.0);

        let reference = traj.sample(t0);
        assert!(reference.done);
        assert_eq!(reference.position, 45.0);
    }
}
