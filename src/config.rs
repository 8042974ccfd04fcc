// Loop timing, duty ranges, battery calibration, default control gains
use std::time::Duration;

// Control loop period (200 Hz)
pub const CONTROL_LOOP_PERIOD: Duration = Duration::from_millis(5);

// Foreground callers poll completion at this coarse interval
pub const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(10);

// Number of physical motor ports on the hub (ports A..F)
pub const MAX_MOTOR_PORTS: u8 = 6;

// Duty cycle ranges
// Internal duty commands span +/- DUTY_STEPS; the user surface is percent.
pub const DUTY_STEPS: i32 = 10_000;
pub const DUTY_USER_STEPS: i32 = 100;
pub const DUTY_STEPS_PER_USER_STEP: i32 = DUTY_STEPS / DUTY_USER_STEPS;

// Encoder resolution at the motor output shaft, before gearing
pub const COUNTS_PER_DEGREE: f32 = 1.0;

// Battery sense calibration
// Raw ADC full scale is 4096 (12-bit); scaled maxima are the physical value
// that a full-scale raw reading corresponds to. The current correction is the
// sense-resistor drop in units of 1/16 Ohm.
pub const ADC_CHANNEL_COUNT: u8 = 4;
pub const BATTERY_VOLTAGE_CH: u8 = 0;
pub const BATTERY_CURRENT_CH: u8 = 1;
pub const BATTERY_VOLTAGE_RAW_MAX: u32 = 4096;
pub const BATTERY_VOLTAGE_SCALED_MAX: u32 = 9600; // mV
pub const BATTERY_CURRENT_RAW_OFFSET: u32 = 20;
pub const BATTERY_CURRENT_RAW_MAX: u32 = 4096;
pub const BATTERY_CURRENT_SCALED_MAX: u32 = 2000; // mA
pub const BATTERY_CURRENT_CORRECTION_SIXTEENTH_OHM: u32 = 12; // 12/16 Ohm

// Nominal supply voltages used for the voltage-sag duty ceiling
pub const BATTERY_NOMINAL_ALKALINE_MV: u32 = 9000;
pub const BATTERY_NOMINAL_RECHARGEABLE_MV: u32 = 7200;

// Default feedback control settings (degrees, seconds, duty steps)
pub const DEFAULT_PID_KP: f32 = 500.0; // steps per degree of position error
pub const DEFAULT_PID_KI: f32 = 10.0; // steps per degree-second of integrated error
pub const DEFAULT_PID_KD: f32 = 10.0; // steps per deg/s of speed error
pub const DEFAULT_MAX_SPEED: f32 = 1000.0; // deg/s
pub const DEFAULT_TOLERANCE: f32 = 3.0; // deg
pub const DEFAULT_SPEED_TOLERANCE: f32 = 50.0; // deg/s
pub const DEFAULT_ACCEL_START: f32 = 2000.0; // deg/s^2
pub const DEFAULT_ACCEL_END: f32 = 2000.0; // deg/s^2
pub const DEFAULT_TIGHT_LOOP_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STALL_SPEED: f32 = 20.0; // deg/s
pub const DEFAULT_STALL_TIME: Duration = Duration::from_millis(200);
pub const DEFAULT_TORQUE_LIMIT_PCT: i32 = 100;

// A maneuver counts as complete only after it stays inside the position and
// speed tolerances for this many consecutive ticks
pub const COMPLETION_DWELL_TICKS: u32 = 5;

// Default drivebase geometry and motion limits (teleop and demos)
pub const DEFAULT_WHEEL_DIAMETER_MM: f32 = 56.0;
pub const DEFAULT_AXLE_TRACK_MM: f32 = 120.0;
pub const DEFAULT_STRAIGHT_SPEED_MM_S: f32 = 150.0;
pub const DEFAULT_STRAIGHT_ACCEL_MM_S2: f32 = 300.0;
pub const DEFAULT_TURN_RATE_DEG_S: f32 = 90.0;
pub const DEFAULT_TURN_ACCEL_DEG_S2: f32 = 180.0;
