//! Example: Switch one outlet on, then off, re-polling after each change.
//!
//! Usage: `cargo run --example outlet_cycle -- <host> <mac> [outlet]`

use std::time::Duration;

use bluebolt_cv2::{BlueBoltDevice, DeviceConfig, OutletCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "192.168.0.162".to_string());
    let mac = args.next().unwrap_or_else(|| "1065a31b2c3d".to_string());
    let outlet: u8 = args.next().as_deref().unwrap_or("1").parse()?;

    let config = DeviceConfig::builder().host(host).mac(mac).build()?;
    let device = BlueBoltDevice::connect(config).await?;
    let label = device.model().switch_label(outlet);

    let status = device.fetch_status().await?;
    println!("{} is {:?}", label, status.outlet(outlet));

    for on in [true, false] {
        println!("Turning {} {}...", label, if on { "on" } else { "off" });
        device.set_outlet(OutletCommand::new(outlet, on)).await?;
        println!("  acknowledged");

        // Give the relay a moment before re-polling
        tokio::time::sleep(Duration::from_secs(2)).await;

        let status = device.fetch_status().await?;
        println!("  {} is now {:?}", label, status.outlet(outlet));
    }

    device.disconnect().await?;
    Ok(())
}
