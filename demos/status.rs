//! Example: Connect to a CV2 card and print one status reading.
//!
//! Usage: `cargo run --example status -- <host> <mac>`

use bluebolt_cv2::{BlueBoltDevice, DeviceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "192.168.0.162".to_string());
    let mac = args.next().unwrap_or_else(|| "1065a31b2c3d".to_string());

    let config = DeviceConfig::builder().host(host).mac(mac).build()?;

    println!("Connecting to {} (token {})...", config.address(), config.token);
    let device = BlueBoltDevice::connect(config).await?;

    let info = device.info();
    println!(
        "{} {} (class {}, firmware {})",
        info.manufacturer(),
        info.model,
        info.class,
        info.firmware.as_deref().unwrap_or("unknown")
    );

    let status = device.fetch_status().await?;

    println!("\n--- Sensors ({}) ---", status.sensor_count());
    for (field, value) in status.sensors() {
        println!("  {:15} {:>8.2} {}", field.key(), value, field.unit());
    }
    if let Some(condition) = status.power_condition {
        println!("  {:15} {:>8}", "power_condition", condition);
    }

    println!("\n--- {}s ({}) ---", device.model().control().label(), status.outlet_count());
    for (id, on) in status.outlets() {
        println!(
            "  {:15} {}",
            device.model().switch_label(id),
            if on { "on" } else { "off" }
        );
    }

    let stats = device.transport_stats();
    println!(
        "\n{} datagram(s) sent, {} response(s), {} discarded",
        stats.datagrams_sent, stats.responses, stats.discarded
    );

    device.disconnect().await?;
    Ok(())
}
