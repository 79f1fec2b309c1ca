//! Device probe
//!
//! Loads a device config, reads every known value once and prints the
//! session counters.
//!
//! Usage:
//!   cargo run --example probe -- CONFIG.json [--async]
//!
//! Set `RUST_LOG=solarlink_core=trace` to see the raw frames.

use anyhow::{bail, Context, Result};
use solarlink_core::config::DeviceConfig;
use solarlink_core::device::{AsyncBmsDevice, AsyncInverterDevice, BmsDevice, InverterDevice};
use solarlink_core::protocol::Family;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(path) = args.iter().find(|a| !a.starts_with("--")) else {
        bail!("usage: probe CONFIG.json [--async]");
    };
    let config = DeviceConfig::from_file(path)
        .with_context(|| format!("loading device config from {path}"))?;
    println!(
        "{} ({}) over {:?}",
        config.name, config.family, config.transport
    );

    if args.iter().any(|a| a == "--async") {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(probe_async(&config))
    } else {
        probe_blocking(&config)
    }
}

fn probe_blocking(config: &DeviceConfig) -> Result<()> {
    let hid = config.transport.is_hid();
    match config.family {
        Family::Bms => {
            let bms = BmsDevice::new(config.open_transport(), config.session_config());
            match bms.basic_info()? {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => println!("basic info: no reply"),
            }
            if let Some(cells) = bms.cell_voltages()? {
                println!("cells: {:?} V (spread {} mV)", cells.volts(), cells.spread_mv());
            }
            if let Some(version) = bms.hardware_version()? {
                println!("hardware: {version}");
            }
            println!("{}", serde_json::to_string(&bms.counters())?);
            bms.dispose();
        }
        Family::Inverter => {
            let inverter =
                InverterDevice::new(config.open_transport(), hid, config.session_config());
            println!("protocol: {:?}", inverter.protocol_id()?);
            println!("serial:   {:?}", inverter.serial_number()?);
            println!("firmware: {:?}", inverter.firmware_version()?);
            println!("mode:     {:?}", inverter.device_mode()?);
            if let Some(status) = inverter.general_status()? {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            if let Some(warnings) = inverter.warning_status()? {
                println!("warnings: {:?}", warnings.active());
            }
            println!("{}", serde_json::to_string(&inverter.counters())?);
            inverter.dispose();
        }
    }
    Ok(())
}

async fn probe_async(config: &DeviceConfig) -> Result<()> {
    let hid = config.transport.is_hid();
    match config.family {
        Family::Bms => {
            let bms = AsyncBmsDevice::new(config.open_async_transport(), config.session_config());
            match bms.basic_info().await? {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => println!("basic info: no reply"),
            }
            println!("cells: {:?}", bms.cell_voltages().await?);
            println!("{}", serde_json::to_string(&bms.session().counters().await)?);
            bms.dispose().await;
        }
        Family::Inverter => {
            let inverter = AsyncInverterDevice::new(
                config.open_async_transport(),
                hid,
                config.session_config(),
            );
            println!("mode: {:?}", inverter.device_mode().await?);
            if let Some(status) = inverter.general_status().await? {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            println!(
                "{}",
                serde_json::to_string(&inverter.session().counters().await)?
            );
            inverter.dispose().await;
        }
    }
    Ok(())
}
