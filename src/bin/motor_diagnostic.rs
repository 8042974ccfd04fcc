// Motor bus diagnostic: READ-ONLY check of the hub transport
//
// This tool does not command any actuator - it probes the bus, samples the
// battery channels and prints a JSON report. Run it before trusting a new
// wiring setup.
//
// Usage: cargo run --bin motor_diagnostic -- [bus]
// Example: cargo run --bin motor_diagnostic -- /dev/ttyACM0

use std::io::{self, Write};

use serde_json::json;

use motor_hub_runtime::battery::{convert_current_ma, convert_voltage_mv};
use motor_hub_runtime::config::{BATTERY_CURRENT_CH, BATTERY_VOLTAGE_CH, MAX_MOTOR_PORTS};
use motor_hub_runtime::transport::{AdcReader, SerialBus};
use motor_hub_runtime::PortId;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    // Get bus path from args or use default
    let bus_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyACM0".to_string());

    println!("Hub Motor Bus Diagnostic (READ-ONLY)");
    println!("Bus: {}", bus_path);
    println!();

    // Step 1: open the bus
    println!("Step 1: Opening serial bus...");
    let bus = match SerialBus::open(&bus_path) {
        Ok(bus) => {
            println!("  ok: serial bus opened");
            bus
        }
        Err(e) => {
            println!("  FAILED to open serial bus: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the device path is correct");
            println!("  - Verify the USB cable is connected");
            println!("  - Check the device permissions (dialout group on Linux)");
            return Err(e.into());
        }
    };
    println!();

    // Step 2: probe every motor port
    println!("Step 2: Probing motor ports...");
    let mut motors = Vec::new();
    for index in 0..MAX_MOTOR_PORTS {
        let port = PortId::new(index)?;
        print!("  Port {}: ", port);
        io::stdout().flush()?;

        let responding = match bus.probe(index) {
            Ok(found) => {
                println!("{}", if found { "RESPONDING" } else { "no response" });
                found
            }
            Err(e) => {
                println!("ERROR: {}", e);
                false
            }
        };
        motors.push(json!({ "port": port, "responding": responding }));
    }
    println!();

    // Step 3: sample the battery channels
    println!("Step 3: Sampling battery channels...");
    let mut adc = bus.open_adc();
    let raw_current = adc.read_channel(BATTERY_CURRENT_CH)?;
    let raw_voltage = adc.read_channel(BATTERY_VOLTAGE_CH)?;
    let alkaline = adc.read_type_pin()?;

    let current_ma = convert_current_ma(raw_current);
    let voltage_mv = convert_voltage_mv(raw_voltage, current_ma);
    println!("  voltage: {} mV (raw {})", voltage_mv, raw_voltage);
    println!("  current: {} mA (raw {})", current_ma, raw_current);
    println!(
        "  chemistry pin: {}",
        if alkaline { "alkaline" } else { "rechargeable" }
    );
    println!();

    let report = json!({
        "bus": bus_path,
        "motors": motors,
        "battery": {
            "voltage_mv": voltage_mv,
            "current_ma": current_ma,
            "chemistry": if alkaline { "alkaline" } else { "rechargeable" },
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
