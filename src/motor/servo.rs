// Closed-loop motor controller
//
// One `Servo` per attached motor. Foreground callers issue commands that swap
// in a whole new plan under the lock; the scheduler tick reads sensors,
// evaluates the active plan and writes duty into the H-bridge. Completion is
// published through an atomic so pollers never contend with the tick.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::battery::BatteryState;
use crate::config::{
    COMPLETION_DWELL_TICKS, COMPLETION_POLL_INTERVAL, CONTROL_LOOP_PERIOD, COUNTS_PER_DEGREE,
    DEFAULT_ACCEL_END, DEFAULT_ACCEL_START, DEFAULT_MAX_SPEED, DEFAULT_PID_KD, DEFAULT_PID_KI,
    DEFAULT_PID_KP, DEFAULT_SPEED_TOLERANCE, DEFAULT_STALL_SPEED, DEFAULT_STALL_TIME,
    DEFAULT_TIGHT_LOOP_INTERVAL, DEFAULT_TOLERANCE, DEFAULT_TORQUE_LIMIT_PCT,
    DUTY_STEPS_PER_USER_STEP,
};
use crate::error::{HubError, Result};
use crate::registry::PortId;
use crate::transport::{MotorPort, PassiveMode, TransportError};

use super::hbridge::{Direction, HBridge, Passivity};
use super::pid::{Controller, PidGains};
use super::trajectory::{Reference, Trajectory};

/// Active control mode of one servo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Idle,
    OpenLoopDuty,
    SpeedHold,
    PositionTrack,
    TrajectoryFollow,
    StallSeek,
}

/// Outcome of the current maneuver, polled by foreground callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Running = 0,
    Completed = 1,
    Stalled = 2,
}

impl Completion {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Completion::Running,
            1 => Completion::Completed,
            _ => Completion::Stalled,
        }
    }
}

/// What to do with the actuator once a maneuver ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    Coast,
    Brake,
    /// Keep servoing on the final angle
    Hold,
}

/// Feedback tunables, validated as a unit and swapped in atomically
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    pub gains: PidGains,
    /// Soft limit on reference speed in all run commands, deg/s
    pub max_speed: f32,
    /// Allowed deviation from target before motion counts as complete, deg
    pub tolerance: f32,
    /// Speed band that must also hold for completion, deg/s
    pub speed_tolerance: f32,
    /// Ramp-in acceleration, deg/s^2
    pub accel_start: f32,
    /// Ramp-out deceleration, deg/s^2
    pub accel_end: f32,
    /// Two commands inside this window mean the caller paces its own loop
    pub tight_loop_interval: Duration,
    /// Speed magnitude below which a stall timer runs, deg/s
    pub stall_speed: f32,
    /// How long the speed must stay below `stall_speed` to declare a stall
    pub stall_time: Duration,
    /// Torque limit as percent of full duty
    pub torque_limit_pct: i32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            gains: PidGains {
                kp: DEFAULT_PID_KP,
                ki: DEFAULT_PID_KI,
                kd: DEFAULT_PID_KD,
            },
            max_speed: DEFAULT_MAX_SPEED,
            tolerance: DEFAULT_TOLERANCE,
            speed_tolerance: DEFAULT_SPEED_TOLERANCE,
            accel_start: DEFAULT_ACCEL_START,
            accel_end: DEFAULT_ACCEL_END,
            tight_loop_interval: DEFAULT_TIGHT_LOOP_INTERVAL,
            stall_speed: DEFAULT_STALL_SPEED,
            stall_time: DEFAULT_STALL_TIME,
            torque_limit_pct: DEFAULT_TORQUE_LIMIT_PCT,
        }
    }
}

impl ControlSettings {
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, what: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(HubError::InvalidArgument(what.to_string()))
            }
        }

        check(
            self.gains.kp.is_finite() && self.gains.kp >= 0.0,
            "kp must be finite and non-negative",
        )?;
        check(
            self.gains.ki.is_finite() && self.gains.ki >= 0.0,
            "ki must be finite and non-negative",
        )?;
        check(
            self.gains.kd.is_finite() && self.gains.kd >= 0.0,
            "kd must be finite and non-negative",
        )?;
        check(
            self.max_speed.is_finite() && self.max_speed > 0.0,
            "max speed must be positive",
        )?;
        check(
            self.tolerance.is_finite() && self.tolerance >= 0.0,
            "tolerance must be non-negative",
        )?;
        check(
            self.speed_tolerance.is_finite() && self.speed_tolerance > 0.0,
            "speed tolerance must be positive",
        )?;
        check(
            self.accel_start.is_finite() && self.accel_start > 0.0,
            "start acceleration must be positive",
        )?;
        check(
            self.accel_end.is_finite() && self.accel_end > 0.0,
            "end acceleration must be positive",
        )?;
        check(
            self.stall_speed.is_finite() && self.stall_speed > 0.0,
            "stall speed must be positive",
        )?;
        check(
            (0..=100).contains(&self.torque_limit_pct),
            "torque limit must be within 0..=100 percent",
        )?;
        Ok(())
    }
}

/// Snapshot for the binding/diagnostic surface
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServoStatus {
    pub port: PortId,
    pub mode: RunMode,
    pub state: Completion,
    pub angle: f32,
    pub speed: f32,
}

/// Per-wheel feedback handed back to a drivebase each tick
#[derive(Debug, Clone, Copy)]
pub(crate) struct WheelFeedback {
    pub angle: f32,
    pub speed: f32,
    /// Inside both the position and speed tolerances for this tick
    pub settled: bool,
}

struct ServoCore {
    hbridge: HBridge,
    settings: ControlSettings,
    /// Encoder counts per output-shaft degree (gearing folded in)
    counts_per_deg: f32,
    /// Reported angle = raw / counts_per_deg - offset
    offset_deg: f32,
    mode: RunMode,
    trajectory: Option<Trajectory>,
    after_stop: StopAction,
    hold_target: f32,
    control: Controller,
    last_command: Option<Instant>,
    last_tick: Option<Instant>,
    dwell: u32,
    stall_since: Option<Instant>,
    stall_angle: f32,
    fault: Option<String>,
}

pub struct Servo {
    port_id: PortId,
    inner: Mutex<ServoCore>,
    completion: AtomicU8,
    /// Set while a drivebase owns this servo's command surface
    claimed: AtomicBool,
}

impl Servo {
    pub(crate) fn attach(
        port_id: PortId,
        transport: Box<dyn MotorPort>,
        direction: Direction,
        gear_ratio: f32,
    ) -> Result<Arc<Self>> {
        if !gear_ratio.is_finite() || gear_ratio <= 0.0 {
            return Err(HubError::InvalidArgument(format!(
                "gear ratio {} must be positive",
                gear_ratio
            )));
        }

        let mut hbridge = HBridge::new(port_id, transport, direction);
        hbridge.coast()?;
        info!("port {}: motor attached (gear ratio {})", port_id, gear_ratio);

        Ok(Arc::new(Self {
            port_id,
            inner: Mutex::new(ServoCore {
                hbridge,
                settings: ControlSettings::default(),
                counts_per_deg: COUNTS_PER_DEGREE * gear_ratio,
                offset_deg: 0.0,
                mode: RunMode::Idle,
                trajectory: None,
                after_stop: StopAction::Coast,
                hold_target: 0.0,
                control: Controller::new(),
                last_command: None,
                last_tick: None,
                dwell: 0,
                stall_since: None,
                stall_angle: 0.0,
                fault: None,
            }),
            completion: AtomicU8::new(Completion::Completed as u8),
            claimed: AtomicBool::new(false),
        }))
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    /// Completion state of the current maneuver; never blocks on the tick
    pub fn state(&self) -> Completion {
        Completion::from_u8(self.completion.load(Ordering::Relaxed))
    }

    pub fn run_mode(&self) -> RunMode {
        self.lock_core().mode
    }

    /// Passivity state and current duty of the underlying bridge
    pub fn actuator_state(&self) -> (Passivity, i32) {
        self.lock_core().hbridge.get_state()
    }

    /// Update the bridge's direction, friction offset and duty ceiling
    pub fn configure_actuator(
        &self,
        direction: Direction,
        duty_offset_pct: i32,
        max_duty_pct: i32,
    ) -> Result<()> {
        let mut core = self.lock_core();
        core.ensure_live()?;
        core.hbridge.configure(direction, duty_offset_pct, max_duty_pct)
    }

    /// Replace the feedback tunables; validated as a unit, applied between
    /// ticks, never observed half-updated.
    pub fn set_settings(&self, settings: ControlSettings) -> Result<()> {
        settings.validate()?;
        let mut core = self.lock_core();
        core.ensure_live()?;
        core.settings = settings;
        Ok(())
    }

    pub fn settings(&self) -> ControlSettings {
        self.lock_core().settings
    }

    /// Hold a constant speed indefinitely; completes only on a new command
    pub fn run(&self, speed: f32) -> Result<()> {
        self.command(|core, now| {
            let (angle, measured_speed) = core.measured()?;
            let target = speed.clamp(-core.settings.max_speed, core.settings.max_speed);
            let trajectory = Trajectory::unbounded(
                now,
                angle,
                measured_speed,
                target,
                core.settings.accel_start,
                None,
            );
            core.arm(RunMode::SpeedHold, Some(trajectory), StopAction::Coast);
            Ok(Completion::Running)
        })
    }

    /// Hold `speed` for `duration`, then apply `after_stop`
    pub fn run_time(&self, speed: f32, duration: Duration, after_stop: StopAction) -> Result<()> {
        self.command(|core, now| {
            let (angle, measured_speed) = core.measured()?;
            let target = speed.clamp(-core.settings.max_speed, core.settings.max_speed);
            let trajectory = Trajectory::unbounded(
                now,
                angle,
                measured_speed,
                target,
                core.settings.accel_start,
                Some(duration.as_secs_f32()),
            );
            core.arm(RunMode::TrajectoryFollow, Some(trajectory), after_stop);
            Ok(Completion::Running)
        })
    }

    /// Rotate by `delta_angle` degrees from the current angle
    pub fn run_angle(&self, speed: f32, delta_angle: f32, after_stop: StopAction) -> Result<()> {
        self.command(|core, now| core.begin_target(now, speed, None, delta_angle, after_stop))
    }

    /// Run to an absolute target angle; direction follows the remaining travel
    pub fn run_target(&self, speed: f32, target_angle: f32, after_stop: StopAction) -> Result<()> {
        self.command(|core, now| core.begin_target(now, speed, Some(target_angle), 0.0, after_stop))
    }

    /// Run at `speed` until the mechanism stalls, then apply `after_stop`.
    /// The stall angle is available from `wait_stalled`.
    pub fn run_stalled(&self, speed: f32, after_stop: StopAction) -> Result<()> {
        self.command(|core, now| {
            let (angle, measured_speed) = core.measured()?;
            let target = speed.clamp(-core.settings.max_speed, core.settings.max_speed);
            let trajectory = Trajectory::unbounded(
                now,
                angle,
                measured_speed,
                target,
                core.settings.accel_start,
                None,
            );
            core.arm(RunMode::StallSeek, Some(trajectory), after_stop);
            Ok(Completion::Running)
        })
    }

    /// Pure position servo for an external control loop.
    ///
    /// Two calls inside `tight_loop_interval` mean the caller paces its own
    /// loop, so only the target moves and the controller state is kept.
    pub fn track_target(&self, target_angle: f32) -> Result<()> {
        self.command(|core, now| {
            let tight = core.mode == RunMode::PositionTrack
                && core.last_command.is_some_and(|prev| {
                    now.saturating_duration_since(prev) <= core.settings.tight_loop_interval
                });
            if tight {
                core.hold_target = target_angle;
            } else {
                core.arm(RunMode::PositionTrack, None, StopAction::Coast);
                core.hold_target = target_angle;
            }
            Ok(Completion::Running)
        })
    }

    /// End the current maneuver immediately
    pub fn stop(&self, action: StopAction) -> Result<()> {
        self.command(|core, _now| {
            let hold_at = match action {
                StopAction::Hold => core.measured()?.0,
                _ => 0.0,
            };
            core.apply_stop(action, hold_at)?;
            Ok(Completion::Completed)
        })
    }

    /// Open-loop duty command in user percent (-100.0..=100.0)
    pub fn dc(&self, duty_pct: f32) -> Result<()> {
        self.command(|core, _now| {
            core.hbridge.set_duty_user(duty_pct)?;
            core.mode = RunMode::OpenLoopDuty;
            core.trajectory = None;
            Ok(Completion::Completed)
        })
    }

    /// Reported angle in degrees
    pub fn get_angle(&self) -> Result<f32> {
        self.read(|core| core.measured().map(|(angle, _)| angle))
    }

    /// Reported speed in deg/s
    pub fn get_speed(&self) -> Result<f32> {
        self.read(|core| core.measured().map(|(_, speed)| speed))
    }

    /// Rewrite the logical zero so the current angle reads as `value`.
    /// The raw hardware counter is never touched.
    pub fn reset_angle(&self, value: f32) -> Result<()> {
        self.read(|core| {
            let raw = core.hbridge.port_mut().read_encoder_count()?;
            core.offset_deg = raw as f32 / core.counts_per_deg - value;
            Ok(())
        })
    }

    pub fn status(&self) -> Result<ServoStatus> {
        let (angle, speed) = self.read(|core| core.measured())?;
        Ok(ServoStatus {
            port: self.port_id,
            mode: self.run_mode(),
            state: self.state(),
            angle,
            speed,
        })
    }

    /// Poll completion at a coarse interval until the maneuver ends
    pub async fn wait(&self) -> Result<Completion> {
        loop {
            match self.state() {
                Completion::Running => tokio::time::sleep(COMPLETION_POLL_INTERVAL).await,
                done => {
                    let core = self.lock_core();
                    return match &core.fault {
                        Some(reason) => {
                            Err(TransportError::PortDown(reason.clone()).into())
                        }
                        None => Ok(done),
                    };
                }
            }
        }
    }

    /// Wait for a stall-seek maneuver and return the angle recorded at the
    /// moment the stall was declared
    pub async fn wait_stalled(&self) -> Result<f32> {
        self.wait().await?;
        Ok(self.lock_core().stall_angle)
    }

    // ----- scheduler and drivebase entry points -----

    /// One control tick. Skipped while a drivebase owns this servo.
    pub(crate) fn tick(&self, now: Instant, battery: &BatteryState) {
        if self.claimed.load(Ordering::Relaxed) {
            return;
        }
        self.tick_unchecked(now, battery);
    }

    /// Tick regardless of the claim flag; an idle drivebase delegates here so
    /// a held wheel keeps servoing between maneuvers.
    pub(crate) fn tick_unchecked(&self, now: Instant, battery: &BatteryState) {
        let mut core = self.lock_core();
        if core.fault.is_some() {
            return;
        }
        match core.update(now, battery) {
            Ok(Some(completion)) => {
                self.completion.store(completion as u8, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("port {}: tick failed: {}; coasting", self.port_id, e);
                core.latch(&e.to_string());
                self.completion
                    .store(Completion::Stalled as u8, Ordering::Relaxed);
            }
        }
    }

    /// Drivebase tick: run the normal control step against an externally
    /// supplied reference instead of this servo's own plan.
    pub(crate) fn tick_with_reference(
        &self,
        now: Instant,
        ref_position: f32,
        ref_speed: f32,
        battery: &BatteryState,
    ) -> Result<WheelFeedback> {
        let mut core = self.lock_core();
        core.ensure_live()?;
        match core.reference_step(now, ref_position, ref_speed, battery) {
            Ok(feedback) => Ok(feedback),
            Err(e) => {
                warn!("port {}: wheel tick failed: {}; coasting", self.port_id, e);
                core.latch(&e.to_string());
                self.completion
                    .store(Completion::Stalled as u8, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Foreground measurement used by the drivebase when planning
    pub(crate) fn measured(&self) -> Result<(f32, f32)> {
        self.read(|core| core.measured())
    }

    /// Park the wheel after a drivebase maneuver
    pub(crate) fn apply_stop_action(&self, action: StopAction, hold_at: f32) -> Result<()> {
        let mut core = self.lock_core();
        core.ensure_live()?;
        match core.apply_stop(action, hold_at) {
            Ok(()) => {
                self.completion
                    .store(Completion::Completed as u8, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!("port {}: stop failed: {}; coasting", self.port_id, e);
                core.latch(&e.to_string());
                self.completion
                    .store(Completion::Stalled as u8, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub(crate) fn claim(&self) -> Result<()> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HubError::InvalidArgument(format!(
                "motor on port {} is already bound to a drivebase",
                self.port_id
            )));
        }
        // Whatever the servo was doing is cancelled; the drivebase drives now.
        let mut core = self.lock_core();
        if core.fault.is_none() && core.mode != RunMode::Idle {
            if let Err(e) = core.apply_stop(StopAction::Coast, 0.0) {
                core.latch(&e.to_string());
            }
        }
        Ok(())
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Force the actuator into a passive mode; used at detach and teardown
    pub(crate) fn halt(&self, mode: PassiveMode) {
        let mut core = self.lock_core();
        let result = match mode {
            PassiveMode::Coast => core.hbridge.coast(),
            PassiveMode::Brake => core.hbridge.brake(),
        };
        if let Err(e) = result {
            warn!("port {}: halt failed: {}", self.port_id, e);
        }
        core.mode = RunMode::Idle;
        core.trajectory = None;
        self.completion
            .store(Completion::Completed as u8, Ordering::Relaxed);
    }

    // ----- helpers -----

    fn lock_core(&self) -> MutexGuard<'_, ServoCore> {
        // A poisoned lock only means a tick panicked; the state it left
        // behind is still internally consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn command(
        &self,
        f: impl FnOnce(&mut ServoCore, Instant) -> Result<Completion>,
    ) -> Result<()> {
        if self.is_claimed() {
            return Err(HubError::InvalidArgument(format!(
                "motor on port {} is bound to a drivebase; release it first",
                self.port_id
            )));
        }
        let now = Instant::now();
        let mut core = self.lock_core();
        core.ensure_live()?;
        let completion = match f(&mut core, now) {
            Ok(completion) => completion,
            Err(e) => {
                if matches!(e, HubError::ActuatorIo(_)) {
                    warn!("port {}: command failed: {}; coasting", self.port_id, e);
                    core.latch(&e.to_string());
                    self.completion
                        .store(Completion::Stalled as u8, Ordering::Relaxed);
                }
                return Err(e);
            }
        };
        core.last_command = Some(now);
        self.completion.store(completion as u8, Ordering::Relaxed);
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&mut ServoCore) -> Result<T>) -> Result<T> {
        let mut core = self.lock_core();
        core.ensure_live()?;
        match f(&mut core) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e, HubError::ActuatorIo(_)) {
                    warn!("port {}: read failed: {}; coasting", self.port_id, e);
                    core.latch(&e.to_string());
                    self.completion
                        .store(Completion::Stalled as u8, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }
}

impl ServoCore {
    fn ensure_live(&self) -> Result<()> {
        match &self.fault {
            Some(reason) => Err(TransportError::PortDown(reason.clone()).into()),
            None => Ok(()),
        }
    }

    /// Record a transport fault and force the safe state. Further duty
    /// commands are refused until the motor is re-attached.
    fn latch(&mut self, reason: &str) {
        self.fault = Some(reason.to_string());
        let _ = self.hbridge.coast();
        self.mode = RunMode::Idle;
        self.trajectory = None;
    }

    fn measured(&mut self) -> Result<(f32, f32)> {
        let count = self.hbridge.port_mut().read_encoder_count()?;
        let rate = self.hbridge.port_mut().read_encoder_rate()?;
        let angle = count as f32 / self.counts_per_deg - self.offset_deg;
        let speed = rate as f32 / self.counts_per_deg;
        Ok((angle, speed))
    }

    fn arm(&mut self, mode: RunMode, trajectory: Option<Trajectory>, after_stop: StopAction) {
        self.mode = mode;
        self.trajectory = trajectory;
        self.after_stop = after_stop;
        self.control.reset();
        self.dwell = 0;
        self.stall_since = None;
    }

    fn begin_target(
        &mut self,
        now: Instant,
        speed: f32,
        target: Option<f32>,
        delta: f32,
        after_stop: StopAction,
    ) -> Result<Completion> {
        if !speed.is_finite() || speed == 0.0 {
            return Err(HubError::InvalidArgument(
                "speed must be nonzero".to_string(),
            ));
        }
        let (angle, measured_speed) = self.measured()?;
        let target = target.unwrap_or(angle + delta);
        let cruise = speed.abs().min(self.settings.max_speed);
        let trajectory = Trajectory::bounded(
            now,
            angle,
            measured_speed,
            target,
            cruise,
            self.settings.accel_start,
            self.settings.accel_end,
        );
        self.arm(RunMode::TrajectoryFollow, Some(trajectory), after_stop);
        Ok(Completion::Running)
    }

    fn step_dt(&mut self, now: Instant) -> f32 {
        let dt = match self.last_tick {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f32(),
            None => CONTROL_LOOP_PERIOD.as_secs_f32(),
        };
        self.last_tick = Some(now);
        if dt > 0.0 {
            dt
        } else {
            CONTROL_LOOP_PERIOD.as_secs_f32()
        }
    }

    /// Scheduler-driven update for this servo's own plan
    fn update(&mut self, now: Instant, battery: &BatteryState) -> Result<Option<Completion>> {
        let dt = self.step_dt(now);

        if matches!(self.mode, RunMode::Idle | RunMode::OpenLoopDuty) {
            return Ok(None);
        }

        let (angle, speed) = self.measured()?;

        let reference = match self.mode {
            RunMode::PositionTrack => Reference {
                position: self.hold_target,
                speed: 0.0,
                done: false,
            },
            _ => match &self.trajectory {
                Some(trajectory) => trajectory.sample(now),
                None => return Ok(None),
            },
        };

        self.control_step(&reference, angle, speed, dt, battery)?;

        match self.mode {
            RunMode::SpeedHold | RunMode::PositionTrack => Ok(None),
            RunMode::TrajectoryFollow => self.check_trajectory_done(&reference, angle, speed),
            RunMode::StallSeek => self.check_stalled(now, angle, speed),
            RunMode::Idle | RunMode::OpenLoopDuty => Ok(None),
        }
    }

    /// Drivebase-driven update against an external reference
    fn reference_step(
        &mut self,
        now: Instant,
        ref_position: f32,
        ref_speed: f32,
        battery: &BatteryState,
    ) -> Result<WheelFeedback> {
        let dt = self.step_dt(now);
        let (angle, speed) = self.measured()?;
        let reference = Reference {
            position: ref_position,
            speed: ref_speed,
            done: false,
        };
        self.control_step(&reference, angle, speed, dt, battery)?;
        let settled = (ref_position - angle).abs() <= self.settings.tolerance
            && speed.abs() <= self.settings.speed_tolerance;
        Ok(WheelFeedback {
            angle,
            speed,
            settled,
        })
    }

    fn control_step(
        &mut self,
        reference: &Reference,
        angle: f32,
        speed: f32,
        dt: f32,
        battery: &BatteryState,
    ) -> Result<()> {
        let position_error = reference.position - angle;
        let speed_error = reference.speed - speed;

        // Torque limit, widened for supply sag, never past the bridge's own
        // ceiling.
        let torque_limit = self.settings.torque_limit_pct * DUTY_STEPS_PER_USER_STEP;
        let limit = battery.duty_limit(torque_limit).min(self.hbridge.max_duty());

        let duty = self
            .control
            .update(self.settings.gains, position_error, speed_error, dt, limit);
        self.hbridge.set_duty_claimed(duty)
    }

    fn check_trajectory_done(
        &mut self,
        reference: &Reference,
        angle: f32,
        speed: f32,
    ) -> Result<Option<Completion>> {
        let Some(trajectory) = &self.trajectory else {
            return Ok(None);
        };

        if trajectory.is_timed() {
            if reference.done {
                self.finish(reference.position)?;
                return Ok(Some(Completion::Completed));
            }
            return Ok(None);
        }

        let Some(target) = trajectory.target() else {
            return Ok(None);
        };

        // Dwell inside both tolerances before declaring completion, so an
        // overshoot oscillation cannot complete spuriously.
        let settled = reference.done
            && (target - angle).abs() <= self.settings.tolerance
            && speed.abs() <= self.settings.speed_tolerance;
        if settled {
            self.dwell += 1;
            if self.dwell >= COMPLETION_DWELL_TICKS {
                self.finish(target)?;
                return Ok(Some(Completion::Completed));
            }
        } else {
            self.dwell = 0;
        }
        Ok(None)
    }

    fn check_stalled(
        &mut self,
        now: Instant,
        angle: f32,
        speed: f32,
    ) -> Result<Option<Completion>> {
        if speed.abs() < self.settings.stall_speed {
            let since = *self.stall_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.settings.stall_time {
                self.stall_angle = angle;
                warn!(
                    "port {}: stall declared at {:.1} deg",
                    self.hbridge.port_id(),
                    angle
                );
                self.finish(angle)?;
                return Ok(Some(Completion::Stalled));
            }
        } else {
            self.stall_since = None;
        }
        Ok(None)
    }

    /// Apply the configured after-stop action at the end of a maneuver
    fn finish(&mut self, hold_at: f32) -> Result<()> {
        self.apply_stop(self.after_stop, hold_at)
    }

    fn apply_stop(&mut self, action: StopAction, hold_at: f32) -> Result<()> {
        match action {
            StopAction::Coast => {
                self.hbridge.coast()?;
                self.mode = RunMode::Idle;
                self.trajectory = None;
            }
            StopAction::Brake => {
                self.hbridge.brake()?;
                self.mode = RunMode::Idle;
                self.trajectory = None;
            }
            StopAction::Hold => {
                self.hold_target = hold_at;
                self.mode = RunMode::PositionTrack;
                self.trajectory = None;
                self.control.reset();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONTROL_LOOP_PERIOD;
    use crate::transport::MockMotor;

    fn servo_with_mock() -> (Arc<Servo>, MockMotor) {
        let mock = MockMotor::simulated();
        let servo = Servo::attach(
            PortId::new(0).unwrap(),
            Box::new(mock.port()),
            Direction::Clockwise,
            1.0,
        )
        .unwrap();
        (servo, mock)
    }

    /// Drive the control loop against the mock plant for `ticks` periods
    fn simulate(servo: &Servo, mock: &MockMotor, battery: &BatteryState, t0: Instant, ticks: u32) {
        for i in 1..=ticks {
            mock.advance(CONTROL_LOOP_PERIOD);
            servo.tick(t0 + CONTROL_LOOP_PERIOD * i, battery);
        }
    }

    #[test]
    fn test_run_target_completes_within_tolerance() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        servo.run_target(500.0, 180.0, StopAction::Hold).unwrap();
        assert_eq!(servo.state(), Completion::Running);

        let mut peak_speed = 0i32;
        for i in 1..=1200u32 {
            mock.advance(CONTROL_LOOP_PERIOD);
            servo.tick(t0 + CONTROL_LOOP_PERIOD * i, &battery);
            peak_speed = peak_speed.max(mock.rate().abs());
        }

        assert_eq!(servo.state(), Completion::Completed);
        let angle = servo.get_angle().unwrap();
        assert!(
            (angle - 180.0).abs() <= servo.settings().tolerance,
            "final angle {} outside tolerance",
            angle
        );
        // The measured speed must stay near the commanded cruise magnitude
        assert!(peak_speed <= 550, "peak speed {} exceeded cruise", peak_speed);
        // Hold keeps servoing on the final angle
        assert_eq!(servo.run_mode(), RunMode::PositionTrack);
    }

    #[test]
    fn test_run_angle_moves_relative() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        mock.set_count(90);
        servo.run_angle(400.0, -45.0, StopAction::Coast).unwrap();
        simulate(&servo, &mock, &battery, t0, 1200);

        assert_eq!(servo.state(), Completion::Completed);
        let angle = servo.get_angle().unwrap();
        assert!((angle - 45.0).abs() <= servo.settings().tolerance);
        assert_eq!(servo.actuator_state().0, Passivity::Coast);
    }

    #[test]
    fn test_run_time_ends_with_after_stop() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        servo
            .run_time(300.0, Duration::from_millis(500), StopAction::Brake)
            .unwrap();
        simulate(&servo, &mock, &battery, t0, 150);

        assert_eq!(servo.state(), Completion::Completed);
        assert_eq!(servo.actuator_state().0, Passivity::Brake);
        assert!(servo.get_angle().unwrap() > 0.0);
    }

    #[test]
    fn test_run_keeps_running() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        servo.run(300.0).unwrap();
        simulate(&servo, &mock, &battery, t0, 400);

        assert_eq!(servo.state(), Completion::Running);
        let speed = servo.get_speed().unwrap();
        assert!((speed - 300.0).abs() < 50.0, "speed {} off target", speed);
    }

    #[test]
    fn test_stall_declared_after_threshold_time() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        // Mechanism jammed: encoder pinned regardless of duty
        mock.set_count(30);
        servo.run_stalled(300.0, StopAction::Coast).unwrap();

        // Tick without advancing the plant; speed stays at zero
        let stall_ticks =
            (DEFAULT_STALL_TIME.as_millis() / CONTROL_LOOP_PERIOD.as_millis()) as u32;
        for i in 1..=stall_ticks + 2 {
            servo.tick(t0 + CONTROL_LOOP_PERIOD * i, &battery);
        }

        assert_eq!(servo.state(), Completion::Stalled);
        assert_eq!(servo.actuator_state().0, Passivity::Coast);
        // The angle recorded at the stall is the pinned position
        let core = servo.lock_core();
        assert_eq!(core.stall_angle, 30.0);
    }

    #[test]
    fn test_stall_timer_resets_when_motion_resumes() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        servo.run_stalled(300.0, StopAction::Coast).unwrap();

        // Slow for a while, but recovering before the threshold
        let half = (DEFAULT_STALL_TIME.as_millis() / CONTROL_LOOP_PERIOD.as_millis() / 2) as u32;
        for i in 1..=half {
            servo.tick(t0 + CONTROL_LOOP_PERIOD * i, &battery);
        }
        mock.set_rate(300);
        servo.tick(t0 + CONTROL_LOOP_PERIOD * (half + 1), &battery);
        mock.set_rate(0);
        for i in half + 2..=half + 2 + half {
            servo.tick(t0 + CONTROL_LOOP_PERIOD * i, &battery);
        }

        assert_eq!(servo.state(), Completion::Running);
    }

    #[test]
    fn test_reset_angle_is_idempotent() {
        let (servo, mock) = servo_with_mock();

        mock.set_count(720);
        servo.reset_angle(0.0).unwrap();
        assert_eq!(servo.get_angle().unwrap(), 0.0);
        servo.reset_angle(0.0).unwrap();
        assert_eq!(servo.get_angle().unwrap(), 0.0);
    }

    #[test]
    fn test_reset_angle_never_touches_raw_counter() {
        let (servo, mock) = servo_with_mock();

        mock.set_count(1000);
        servo.reset_angle(90.0).unwrap();
        assert_eq!(servo.get_angle().unwrap(), 90.0);
        assert_eq!(mock.count(), 1000);
    }

    #[test]
    fn test_gear_ratio_scales_reported_angle() {
        let mock = MockMotor::new();
        let servo = Servo::attach(
            PortId::new(1).unwrap(),
            Box::new(mock.port()),
            Direction::Clockwise,
            5.0,
        )
        .unwrap();

        mock.set_count(1800);
        assert_eq!(servo.get_angle().unwrap(), 360.0);
        mock.set_rate(500);
        assert_eq!(servo.get_speed().unwrap(), 100.0);
    }

    #[test]
    fn test_track_target_tight_loop_keeps_controller_state() {
        let (servo, _mock) = servo_with_mock();

        servo.track_target(10.0).unwrap();
        assert_eq!(servo.run_mode(), RunMode::PositionTrack);
        // Immediately following call is inside the tight-loop window
        servo.track_target(12.0).unwrap();
        assert_eq!(servo.run_mode(), RunMode::PositionTrack);
        assert_eq!(servo.lock_core().hold_target, 12.0);
        assert_eq!(servo.state(), Completion::Running);
    }

    #[test]
    fn test_new_command_cancels_previous_maneuver() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        servo.run_target(500.0, 1000.0, StopAction::Coast).unwrap();
        simulate(&servo, &mock, &battery, t0, 50);
        assert_eq!(servo.state(), Completion::Running);

        // The second command replaces the plan wholesale
        servo.stop(StopAction::Brake).unwrap();
        assert_eq!(servo.state(), Completion::Completed);
        assert_eq!(servo.actuator_state().0, Passivity::Brake);
    }

    #[test]
    fn test_settings_rejected_as_a_unit() {
        let (servo, _mock) = servo_with_mock();
        let before = servo.settings();

        let mut bad = before;
        bad.max_speed = -10.0;
        assert!(matches!(
            servo.set_settings(bad),
            Err(HubError::InvalidArgument(_))
        ));
        // Nothing was applied
        assert_eq!(servo.settings(), before);

        let mut good = before;
        good.tolerance = 1.5;
        servo.set_settings(good).unwrap();
        assert_eq!(servo.settings().tolerance, 1.5);
    }

    #[test]
    fn test_zero_speed_command_rejected() {
        let (servo, _mock) = servo_with_mock();
        assert!(matches!(
            servo.run_target(0.0, 90.0, StopAction::Coast),
            Err(HubError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_transport_fault_latches_and_coasts() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        servo.run(300.0).unwrap();
        simulate(&servo, &mock, &battery, t0, 10);

        mock.fail_reads(true);
        servo.tick(t0 + CONTROL_LOOP_PERIOD * 11, &battery);

        assert_eq!(servo.state(), Completion::Stalled);
        mock.fail_reads(false);
        mock.fail_writes(false);
        // The fault stays latched: getters fail, commands fail
        assert!(matches!(servo.get_angle(), Err(HubError::ActuatorIo(_))));
        assert!(matches!(servo.run(100.0), Err(HubError::ActuatorIo(_))));
        assert_eq!(servo.actuator_state().0, Passivity::Coast);
    }

    #[test]
    fn test_duty_ceiling_widens_under_voltage_sag() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        // Torque-limit hard so the controller saturates immediately
        let mut settings = servo.settings();
        settings.torque_limit_pct = 40;
        servo.set_settings(settings).unwrap();

        // Position-track a far target so the controller saturates at the clamp
        servo.track_target(100_000.0).unwrap();
        servo.tick(t0 + CONTROL_LOOP_PERIOD, &battery);
        assert_eq!(mock.last_duty(), 4000);

        // Supply sags to half nominal: the same torque needs double the duty
        battery.set_voltage_for_tests(4500);
        servo.tick(t0 + CONTROL_LOOP_PERIOD * 2, &battery);
        assert_eq!(mock.last_duty(), 8000);
    }

    #[tokio::test]
    async fn test_wait_returns_after_completion() {
        let (servo, mock) = servo_with_mock();
        let battery = BatteryState::default();
        let t0 = Instant::now();

        servo.run_time(200.0, Duration::from_millis(50), StopAction::Coast)
            .unwrap();
        simulate(&servo, &mock, &battery, t0, 30);

        assert_eq!(servo.wait().await.unwrap(), Completion::Completed);
    }
}
