// Keyboard teleop: W/S straight, A/D turn, SPACE stop, R/F step size, Q quit
//
// Runs a full hub in-process: scheduler, drivebase on ports A/B, and either
// the simulated transport (default) or a real serial bus when a device path
// is given as the first argument.

use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tracing::info;

use motor_hub_runtime::battery::BatteryMonitor;
use motor_hub_runtime::config::{
    CONTROL_LOOP_PERIOD, DEFAULT_AXLE_TRACK_MM, DEFAULT_WHEEL_DIAMETER_MM,
};
use motor_hub_runtime::motor::{Direction, Drivebase, StopAction};
use motor_hub_runtime::transport::{MockAdc, MockMotor, PassiveMode, SerialBus};
use motor_hub_runtime::{Hub, PortId, runtime};

const DISTANCES: [f32; 3] = [50.0, 100.0, 200.0]; // mm per keypress
const TURNS: [f32; 3] = [15.0, 45.0, 90.0]; // deg per keypress

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let hub = Hub::new();
    let left: PortId = "A".parse()?;
    let right: PortId = "B".parse()?;

    let battery = match std::env::args().nth(1) {
        Some(bus_path) => {
            info!("Opening motor bus on {}", bus_path);
            let bus = SerialBus::open(&bus_path)?;
            hub.attach_motor(
                left,
                Box::new(bus.open_motor_port(left.index() as u8)?),
                Direction::Clockwise,
                1.0,
            )?;
            hub.attach_motor(
                right,
                Box::new(bus.open_motor_port(right.index() as u8)?),
                Direction::Counterclockwise,
                1.0,
            )?;
            BatteryMonitor::new(Box::new(bus.open_adc()), None)?
        }
        None => {
            info!("No bus path given, driving the simulated transport");
            let mocks = [MockMotor::simulated(), MockMotor::simulated()];
            hub.attach_motor(left, Box::new(mocks[0].port()), Direction::Clockwise, 1.0)?;
            hub.attach_motor(right, Box::new(mocks[1].port()), Direction::Clockwise, 1.0)?;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(CONTROL_LOOP_PERIOD);
                loop {
                    tick.tick().await;
                    for mock in &mocks {
                        mock.advance(CONTROL_LOOP_PERIOD);
                    }
                }
            });
            BatteryMonitor::new(Box::new(MockAdc::new(&[3400, 120, 0, 0], true)), None)?
        }
    };

    let drivebase =
        hub.attach_drivebase(left, right, DEFAULT_WHEEL_DIAMETER_MM, DEFAULT_AXLE_TRACK_MM)?;
    tokio::spawn(runtime::run(hub.clone(), battery));

    info!("Controls: W/S=straight, A/D=turn, SPACE=stop, R/F=step size, Q=quit");
    info!("Step: {} mm / {} deg", DISTANCES[0], TURNS[0]);

    enable_raw_mode()?;
    let result = run_teleop(&drivebase).await;
    disable_raw_mode()?;

    hub.stop_all(PassiveMode::Coast);
    result
}

async fn run_teleop(
    drivebase: &Drivebase,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 0;

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
                    continue;
                }

                match code {
                    // Each keypress replaces the current maneuver
                    KeyCode::Char('w') => drivebase.straight(DISTANCES[step_idx], StopAction::Brake)?,
                    KeyCode::Char('s') => {
                        drivebase.straight(-DISTANCES[step_idx], StopAction::Brake)?
                    }
                    KeyCode::Char('d') => drivebase.turn(TURNS[step_idx], StopAction::Brake)?,
                    KeyCode::Char('a') => drivebase.turn(-TURNS[step_idx], StopAction::Brake)?,
                    KeyCode::Char(' ') => drivebase.stop(StopAction::Brake)?,

                    KeyCode::Char('r') => {
                        step_idx = (step_idx + 1).min(DISTANCES.len() - 1);
                        info!("Step: {} mm / {} deg", DISTANCES[step_idx], TURNS[step_idx]);
                    }
                    KeyCode::Char('f') => {
                        step_idx = step_idx.saturating_sub(1);
                        info!("Step: {} mm / {} deg", DISTANCES[step_idx], TURNS[step_idx]);
                    }

                    KeyCode::Char('q') | KeyCode::Esc => break,
                    _ => {}
                }
            }
        }

        // Let the scheduler task breathe between input polls
        tokio::task::yield_now().await;
    }

    Ok(())
}
