//! Voltage Serial Demo
//!
//! Opens an instrument link, reads a block of holding registers from a
//! Modbus RTU device and prints them.
//!
//! Usage: cargo run --features cli --bin demo <connection> [serialcomm] [address] [start] [count]
//! Example: cargo run --features cli --bin demo /dev/ttyUSB0 9600/8n1 1 0 10
//! Example: cargo run --features cli --bin demo tcp-raw/192.168.1.50/4001 - 17 100 4
//!
//! Set `RUST_LOG=voltage_serial=trace` to see every packet on the wire.

use tracing_subscriber::EnvFilter;
use voltage_serial::{
    Backends, ConnectionSpec, FrameParams, ModbusConfig, ModbusDevice, OpenMode, Resource,
};

fn parse_arg<T: std::str::FromStr>(value: Option<&String>, default: T) -> Result<T, String> {
    match value {
        None => Ok(default),
        Some(text) => text
            .parse()
            .map_err(|_| format!("invalid argument '{}'", text)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("🚀 {}", voltage_serial::info());
    println!("=============================\n");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let backends = Backends::standard();

    let Some(connection) = args.first() else {
        println!("No connection given, listing available links:");
        let resources: Vec<Resource> = backends.enumerate()?;
        if resources.is_empty() {
            println!("  (none found)");
        }
        for resource in &resources {
            println!("  [{}] {} - {}", resource.backend, resource.spec, resource.description);
        }
        println!("\nUsage: demo <connection> [serialcomm] [address] [start] [count]");
        return Ok(());
    };

    let spec = ConnectionSpec::parse(connection)?;
    let address: u8 = parse_arg(args.get(2), 1)?;
    let start: u16 = parse_arg(args.get(3), 0)?;
    let count: u16 = parse_arg(args.get(4), 10)?;

    println!("📡 Opening {} via {}", spec, spec.backend_name());
    let mut handle = backends.open(&spec, OpenMode::ReadWrite).await?;
    handle.set_packet_logging(true);

    if let Some(serialcomm) = args.get(1).filter(|s| s.as_str() != "-") {
        let params: FrameParams = serialcomm.parse()?;
        handle.set_frame_params(&params)?;
        println!("  Frame parameters: {}", params);
    }

    let mut device = ModbusDevice::new(handle, ModbusConfig::new().with_device_address(address));

    println!("\n📊 Reading {} holding registers from {} at device {}", count, start, address);
    match device.read_holding_registers(start, count).await {
        Ok(values) => {
            for (offset, value) in values.iter().enumerate() {
                println!("  [{:5}] = {:5} (0x{:04X})", start as usize + offset, value, value);
            }
        }
        Err(e) => println!("  ❌ Read failed: {}", e),
    }

    device.into_handle().close().await?;
    println!("\n✅ Demo complete");
    Ok(())
}
