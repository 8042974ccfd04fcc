// Two-wheel drivebase coordinator
//
// Binds a left and right servo into one differential-drive control problem.
// Commands plan two trajectories, one for distance (average wheel angle) and
// one for heading (differential wheel angle); each tick their references are
// summed/differenced into per-wheel references and handed to the bound
// servos' normal control step. While bound, the wheels' own command surfaces
// are refused.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::battery::BatteryState;
use crate::config::{
    COMPLETION_DWELL_TICKS, COMPLETION_POLL_INTERVAL, DEFAULT_STRAIGHT_ACCEL_MM_S2,
    DEFAULT_STRAIGHT_SPEED_MM_S, DEFAULT_TURN_ACCEL_DEG_S2, DEFAULT_TURN_RATE_DEG_S,
};
use crate::error::{HubError, Result};
use crate::transport::{PassiveMode, TransportError};

use super::servo::{Completion, Servo, StopAction};
use super::trajectory::Trajectory;

/// Drivebase motion limits, validated as a unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveSettings {
    /// Straight-run cruise speed, mm/s
    pub straight_speed: f32,
    /// Straight-run acceleration, mm/s^2
    pub straight_accel: f32,
    /// Turn cruise rate, deg/s
    pub turn_rate: f32,
    /// Turn acceleration, deg/s^2
    pub turn_accel: f32,
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            straight_speed: DEFAULT_STRAIGHT_SPEED_MM_S,
            straight_accel: DEFAULT_STRAIGHT_ACCEL_MM_S2,
            turn_rate: DEFAULT_TURN_RATE_DEG_S,
            turn_accel: DEFAULT_TURN_ACCEL_DEG_S2,
        }
    }
}

impl DriveSettings {
    pub fn validate(&self) -> Result<()> {
        let ok = self.straight_speed.is_finite()
            && self.straight_speed > 0.0
            && self.straight_accel.is_finite()
            && self.straight_accel > 0.0
            && self.turn_rate.is_finite()
            && self.turn_rate > 0.0
            && self.turn_accel.is_finite()
            && self.turn_accel > 0.0;
        if ok {
            Ok(())
        } else {
            Err(HubError::InvalidArgument(
                "drivebase speeds and accelerations must be positive".to_string(),
            ))
        }
    }
}

/// Wheel rotation per millimeter of travel
pub fn wheel_degrees_per_mm(wheel_diameter_mm: f32) -> f32 {
    360.0 / (PI * wheel_diameter_mm)
}

/// Wheel rotation per degree of in-place turn (opposite signs per side)
pub fn wheel_degrees_per_turn_degree(wheel_diameter_mm: f32, axle_track_mm: f32) -> f32 {
    axle_track_mm / wheel_diameter_mm
}

/// Per-wheel angle targets for a combined distance + turn maneuver
pub fn wheel_targets(
    distance_mm: f32,
    turn_deg: f32,
    wheel_diameter_mm: f32,
    axle_track_mm: f32,
) -> (f32, f32) {
    let travel = distance_mm * wheel_degrees_per_mm(wheel_diameter_mm);
    let twist = turn_deg * wheel_degrees_per_turn_degree(wheel_diameter_mm, axle_track_mm);
    (travel + twist, travel - twist)
}

struct DriveCore {
    settings: DriveSettings,
    /// Average wheel angle plan, wheel degrees
    distance: Option<Trajectory>,
    /// Differential wheel angle plan (left positive), wheel degrees
    heading: Option<Trajectory>,
    after_stop: StopAction,
    dwell: u32,
    fault: Option<String>,
}

pub struct Drivebase {
    left: Arc<Servo>,
    right: Arc<Servo>,
    wheel_diameter_mm: f32,
    axle_track_mm: f32,
    inner: Mutex<DriveCore>,
    completion: AtomicU8,
}

impl std::fmt::Debug for Drivebase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivebase")
            .field("wheel_diameter_mm", &self.wheel_diameter_mm)
            .field("axle_track_mm", &self.axle_track_mm)
            .finish_non_exhaustive()
    }
}

impl Drivebase {
    /// Bind two servos as left/right wheels, claiming both exclusively.
    pub(crate) fn new(
        left: Arc<Servo>,
        right: Arc<Servo>,
        wheel_diameter_mm: f32,
        axle_track_mm: f32,
    ) -> Result<Arc<Self>> {
        if !wheel_diameter_mm.is_finite() || wheel_diameter_mm <= 0.0 {
            return Err(HubError::InvalidArgument(format!(
                "wheel diameter {} must be positive",
                wheel_diameter_mm
            )));
        }
        if !axle_track_mm.is_finite() || axle_track_mm <= 0.0 {
            return Err(HubError::InvalidArgument(format!(
                "axle track {} must be positive",
                axle_track_mm
            )));
        }
        if left.port_id() == right.port_id() {
            return Err(HubError::InvalidArgument(
                "left and right wheels must be different motors".to_string(),
            ));
        }

        left.claim()?;
        if let Err(e) = right.claim() {
            left.release();
            return Err(e);
        }
        info!(
            "drivebase bound: left={} right={} wheel={}mm track={}mm",
            left.port_id(),
            right.port_id(),
            wheel_diameter_mm,
            axle_track_mm
        );

        Ok(Arc::new(Self {
            left,
            right,
            wheel_diameter_mm,
            axle_track_mm,
            inner: Mutex::new(DriveCore {
                settings: DriveSettings::default(),
                distance: None,
                heading: None,
                after_stop: StopAction::Coast,
                dwell: 0,
                fault: None,
            }),
            completion: AtomicU8::new(Completion::Completed as u8),
        }))
    }

    pub fn set_settings(&self, settings: DriveSettings) -> Result<()> {
        settings.validate()?;
        self.lock_core().settings = settings;
        Ok(())
    }

    pub fn settings(&self) -> DriveSettings {
        self.lock_core().settings
    }

    /// Travel `distance_mm` while turning `turn_deg`, then apply `after_stop`
    pub fn drive(&self, distance_mm: f32, turn_deg: f32, after_stop: StopAction) -> Result<()> {
        if !distance_mm.is_finite() || !turn_deg.is_finite() {
            return Err(HubError::InvalidArgument(
                "distance and turn must be finite".to_string(),
            ));
        }

        let now = Instant::now();
        let (left_angle, left_speed) = self.left.measured()?;
        let (right_angle, right_speed) = self.right.measured()?;

        let travel_pos = (left_angle + right_angle) / 2.0;
        let travel_speed = (left_speed + right_speed) / 2.0;
        let twist_pos = (left_angle - right_angle) / 2.0;
        let twist_speed = (left_speed - right_speed) / 2.0;

        let per_mm = wheel_degrees_per_mm(self.wheel_diameter_mm);
        let per_turn = wheel_degrees_per_turn_degree(self.wheel_diameter_mm, self.axle_track_mm);

        let mut core = self.lock_core();
        core.ensure_live()?;
        let settings = core.settings;
        core.distance = Some(Trajectory::bounded(
            now,
            travel_pos,
            travel_speed,
            travel_pos + distance_mm * per_mm,
            settings.straight_speed * per_mm,
            settings.straight_accel * per_mm,
            settings.straight_accel * per_mm,
        ));
        core.heading = Some(Trajectory::bounded(
            now,
            twist_pos,
            twist_speed,
            twist_pos + turn_deg * per_turn,
            settings.turn_rate * per_turn,
            settings.turn_accel * per_turn,
            settings.turn_accel * per_turn,
        ));
        core.after_stop = after_stop;
        core.dwell = 0;
        self.completion
            .store(Completion::Running as u8, Ordering::Relaxed);
        Ok(())
    }

    /// Drive straight for `distance_mm`
    pub fn straight(&self, distance_mm: f32, after_stop: StopAction) -> Result<()> {
        self.drive(distance_mm, 0.0, after_stop)
    }

    /// Turn in place by `turn_deg` (positive is clockwise)
    pub fn turn(&self, turn_deg: f32, after_stop: StopAction) -> Result<()> {
        self.drive(0.0, turn_deg, after_stop)
    }

    /// End the current maneuver immediately
    pub fn stop(&self, action: StopAction) -> Result<()> {
        let mut core = self.lock_core();
        core.ensure_live()?;
        core.distance = None;
        core.heading = None;
        core.dwell = 0;
        drop(core);

        for wheel in [&self.left, &self.right] {
            let hold_at = match action {
                StopAction::Hold => wheel.measured()?.0,
                _ => 0.0,
            };
            wheel.apply_stop_action(action, hold_at)?;
        }
        self.completion
            .store(Completion::Completed as u8, Ordering::Relaxed);
        Ok(())
    }

    pub fn state(&self) -> Completion {
        match self.completion.load(Ordering::Relaxed) {
            0 => Completion::Running,
            1 => Completion::Completed,
            _ => Completion::Stalled,
        }
    }

    /// Poll completion at a coarse interval until the maneuver ends
    pub async fn wait(&self) -> Result<Completion> {
        loop {
            match self.state() {
                Completion::Running => tokio::time::sleep(COMPLETION_POLL_INTERVAL).await,
                done => {
                    let core = self.lock_core();
                    return match &core.fault {
                        Some(reason) => Err(TransportError::PortDown(reason.clone()).into()),
                        None => Ok(done),
                    };
                }
            }
        }
    }

    pub(crate) fn wheels(&self) -> (&Arc<Servo>, &Arc<Servo>) {
        (&self.left, &self.right)
    }

    /// Stop both wheels and return them to independent control
    pub(crate) fn release_wheels(&self) {
        self.left.halt(PassiveMode::Coast);
        self.right.halt(PassiveMode::Coast);
        self.left.release();
        self.right.release();
        info!(
            "drivebase released: left={} right={}",
            self.left.port_id(),
            self.right.port_id()
        );
    }

    /// One control tick while active; a no-op when idle or faulted.
    pub(crate) fn tick(&self, now: Instant, battery: &BatteryState) {
        let mut core = self.lock_core();
        if core.fault.is_some() {
            return;
        }
        let (Some(distance), Some(heading)) = (core.distance.clone(), core.heading.clone()) else {
            // No active plan: delegate to the wheels' own update so a Hold
            // from the last maneuver keeps servoing.
            drop(core);
            self.left.tick_unchecked(now, battery);
            self.right.tick_unchecked(now, battery);
            return;
        };

        let travel = distance.sample(now);
        let twist = heading.sample(now);

        let left_feedback = self.left.tick_with_reference(
            now,
            travel.position + twist.position,
            travel.speed + twist.speed,
            battery,
        );
        let left_feedback = match left_feedback {
            Ok(feedback) => feedback,
            Err(e) => {
                self.right.halt(PassiveMode::Coast);
                self.fault(&mut core, &e);
                return;
            }
        };
        let right_feedback = self.right.tick_with_reference(
            now,
            travel.position - twist.position,
            travel.speed - twist.speed,
            battery,
        );
        let right_feedback = match right_feedback {
            Ok(feedback) => feedback,
            Err(e) => {
                self.left.halt(PassiveMode::Coast);
                self.fault(&mut core, &e);
                return;
            }
        };

        // Completion needs both plans finished and both wheels settled, for a
        // minimum dwell.
        let settled =
            travel.done && twist.done && left_feedback.settled && right_feedback.settled;
        if !settled {
            core.dwell = 0;
            return;
        }
        core.dwell += 1;
        if core.dwell < COMPLETION_DWELL_TICKS {
            return;
        }

        let travel_end = distance.target().unwrap_or(travel.position);
        let twist_end = heading.target().unwrap_or(twist.position);
        let action = core.after_stop;
        core.distance = None;
        core.heading = None;

        let left_result = self.left.apply_stop_action(action, travel_end + twist_end);
        let right_result = self.right.apply_stop_action(action, travel_end - twist_end);
        match left_result.and(right_result) {
            Ok(()) => {
                self.completion
                    .store(Completion::Completed as u8, Ordering::Relaxed);
            }
            Err(e) => self.fault(&mut core, &e),
        }
    }

    fn fault(&self, core: &mut DriveCore, e: &HubError) {
        warn!("drivebase fault: {}; both wheels coasted", e);
        core.fault = Some(e.to_string());
        core.distance = None;
        core.heading = None;
        self.completion
            .store(Completion::Stalled as u8, Ordering::Relaxed);
    }

    fn lock_core(&self) -> MutexGuard<'_, DriveCore> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DriveCore {
    fn ensure_live(&self) -> Result<()> {
        match &self.fault {
            Some(reason) => Err(TransportError::PortDown(reason.clone()).into()),
            None => Ok(()),
        }
    }
}
