use clap::Parser;
use tracing_subscriber::EnvFilter;

use motor_hub_runtime::battery::BatteryMonitor;
use motor_hub_runtime::config::CONTROL_LOOP_PERIOD;
use motor_hub_runtime::motor::Direction;
use motor_hub_runtime::transport::{MockAdc, MockMotor, SerialBus};
use motor_hub_runtime::{Hub, PortId, runtime};

/// Motor hub control runtime
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Serial device for the hub motor bus
    #[arg(long, default_value = "/dev/ttyACM0")]
    bus: String,

    /// Run against the in-memory simulated transport instead of hardware
    #[arg(long)]
    sim: bool,

    /// Motor ports to attach at startup
    #[arg(long = "motor", value_name = "PORT", default_values = ["A", "B"])]
    motors: Vec<PortId>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    if let Err(e) = start(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn start(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let hub = Hub::new();

    let battery = if args.sim {
        let mut mocks = Vec::new();
        for &port in &args.motors {
            let mock = MockMotor::simulated();
            hub.attach_motor(port, Box::new(mock.port()), Direction::Clockwise, 1.0)?;
            mocks.push(mock);
        }

        // Background plant: the simulated motors respond to duty commands
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
    } else {
        let bus = SerialBus::open(&args.bus)?;
        for &port in &args.motors {
            let motor_port = bus.open_motor_port(port.index() as u8)?;
            hub.attach_motor(port, Box::new(motor_port), Direction::Clockwise, 1.0)?;
        }
        BatteryMonitor::new(Box::new(bus.open_adc()), None)?
    };

    runtime::run(hub, battery).await?;
    Ok(())
}
