//! Scan and read example
//!
//! Demonstrates the basic central workflow:
//! - Scanning for nearby sensors
//! - Connecting to the device with the strongest signal
//! - Printing decoded water-level readings as they arrive
//!
//! Run with: cargo run --example scan_and_read
//!
//! To subscribe to a specific characteristic:
//!   cargo run --example scan_and_read -- --characteristic 1234

use futures::StreamExt;
use smartsleeve_ble::ble::uuids::parse_uuid;
use smartsleeve_ble::{
    format_water_level, CentralEvent, CentralManager, ConnectionState, Error, ManagerConfig,
    NumericTextDecoder, Result, ScanFilter, TargetCharacteristic,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,smartsleeve_ble=info".into()),
        )
        .init();

    println!("SmartSleeve Scan and Read");
    println!("=========================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let target = args
        .iter()
        .position(|arg| arg == "--characteristic")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| parse_uuid(s))
        .map(TargetCharacteristic::uuid)
        .unwrap_or_default();

    println!("Target: {}\n", target);

    let config = ManagerConfig::default().with_target(target);
    let platform = smartsleeve_ble::ble::BtleplugPlatform::new().await?;
    let manager =
        CentralManager::with_platform(Arc::new(platform), config, Arc::new(NumericTextDecoder))
            .await?;

    println!("Adapter: {}", manager.adapter_state());

    let _events = manager.on_event(|event| match event {
        CentralEvent::AdapterUnavailable(state) => {
            println!("\n[!] Bluetooth unavailable ({})", state)
        }
        CentralEvent::LinkLost(id) => println!("\n[!] Lost connection to {}", id),
        CentralEvent::ScanStopped { session, reason } => {
            println!("Scan {} stopped: {:?}", session, reason)
        }
    });

    println!("Scanning for 10 seconds...\n");

    let mut scan = manager
        .start_scan(ScanFilter::default(), Duration::from_secs(10))
        .await?;

    while let Some(device) = scan.next().await {
        println!(
            "  {:<24} {:<20} {:>5} dBm",
            device.id,
            device.name_or_default(),
            device
                .signal_strength
                .map(|rssi| rssi.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
    }

    let devices = manager.discovered_devices();
    let nearest = devices.first().ok_or_else(|| Error::NotConnected {
        identifier: "any".to_string(),
    })?;

    println!(
        "\nConnecting to {} ({})...",
        nearest.name_or_default(),
        nearest.id
    );

    let mut states = manager.observe_connection_state(&nearest.id);
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            if state != ConnectionState::Disconnected {
                println!("  State: {}", state);
            }
        }
    });

    let handle = manager.connect(&nearest.id).await?;
    println!(
        "Subscribed to {} in service {}\n",
        handle.characteristic().uuid,
        handle.service_uuid()
    );

    println!("Press Ctrl+C to exit\n");

    let mut readings = handle.readings();
    loop {
        tokio::select! {
            reading = readings.next() => {
                let Some(reading) = reading else {
                    println!("Reading stream ended");
                    break;
                };
                match &reading.value {
                    Ok(value) => println!(
                        "[{}] Water level: {}",
                        reading.timestamp.format("%H:%M:%S"),
                        format_water_level(value.as_number())
                    ),
                    Err(e) => println!(
                        "[{}] Malformed payload {:02X?}: {}",
                        reading.timestamp.format("%H:%M:%S"),
                        reading.raw,
                        e
                    ),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    manager.shutdown().await?;

    println!("Done!");
    Ok(())
}
