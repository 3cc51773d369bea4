use bodyscale::{EventKind, Result, ScaleEvent, ScaleManager};
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("⚖️  Bodyscale Live Monitor Example");

    let manager = ScaleManager::new();
    if let Err(e) = manager.initialize().await {
        error!("❌ Bluetooth unavailable: {}", e);
        return Err(e);
    }

    manager.on(EventKind::DeviceFound, |event| {
        if let ScaleEvent::DeviceFound(device) = event {
            println!(
                "🔍 Found {} [{}] (rssi: {})",
                device.name,
                device.id,
                device.rssi.map_or("?".to_string(), |r| r.to_string())
            );
        }
    })?;

    manager.on(EventKind::WeightData, |event| {
        if let ScaleEvent::WeightData(data) = event {
            println!(
                "⚖️  {:.1} {} {}",
                data.weight,
                data.unit,
                if data.stabilized { "(settled)" } else { "" }
            );
        }
    })?;

    manager.on(EventKind::BodyCompositionData, |event| {
        if let ScaleEvent::BodyCompositionData(data) = event {
            if let Some(composition) = &data.composition {
                println!("📊 Body Composition:");
                println!("  Weight:  {:.1} {}", data.weight, data.unit);
                println!("  Fat:     {:.1}%", composition.body_fat_pct);
                println!("  Water:   {:.1}%", composition.water_pct);
                println!("  Muscle:  {:.1} kg", composition.muscle_mass_kg);
                println!("  Bone:    {:.1} kg", composition.bone_mass_kg);
                println!("  BMI:     {:.1}", composition.bmi);
            }
        }
    })?;

    manager.on(EventKind::Error, |event| {
        if let ScaleEvent::Error { kind, message } = event {
            eprintln!("❌ {kind:?}: {message}");
        }
    })?;

    info!("🔍 Scanning for scales...");
    manager.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(12)).await;

    let devices = manager.discovered_devices().await;
    let Some(device) = devices.first() else {
        error!("❌ No scales found");
        manager.teardown().await?;
        return Ok(());
    };

    info!("🔗 Connecting to {} ({})", device.name, device.variant);
    manager.connect_to_device(&device.id).await?;

    info!("📡 Step on the scale. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.ok();

    info!("🔌 Shutting down...");
    manager.teardown().await?;
    info!("✅ Done");
    Ok(())
}
