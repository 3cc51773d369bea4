use bodyscale::{
    EventKind, MockConfig, Result, ScaleEvent, ScaleManager, Sex, UserBiometrics,
};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧪 Bodyscale Mock Session Example");
    info!("Exercising the full pipeline without hardware");

    let manager = ScaleManager::with_mock(MockConfig::default());
    manager.initialize().await?;

    // Biometrics enable the extended body-composition fields.
    manager
        .set_biometrics(Some(UserBiometrics {
            sex: Sex::Female,
            height_cm: 168.0,
            age_years: 34,
        }))
        .await;

    manager.on(EventKind::DeviceFound, |event| {
        if let ScaleEvent::DeviceFound(device) = event {
            println!("🔍 Discovered {} [{}]", device.name, device.id);
        }
    })?;

    manager.on(EventKind::Connected, |event| {
        if let ScaleEvent::Connected(device) = event {
            println!("🔗 Connected to {}", device.name);
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
                println!(
                    "📊 fat {:.1}% | water {:.1}% | muscle {:.1} kg | bone {:.1} kg | BMI {:.1}",
                    composition.body_fat_pct,
                    composition.water_pct,
                    composition.muscle_mass_kg,
                    composition.bone_mass_kg,
                    composition.bmi
                );
            }
        }
    })?;

    manager.start_scan().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let devices = manager.discovered_devices().await;
    let device = devices.first().expect("mock always discovers a device");
    manager.connect_to_device(&device.id).await?;

    // Let a few measurement cycles run.
    tokio::time::sleep(Duration::from_secs(5)).await;

    if let Some(latest) = manager.latest_data() {
        println!(
            "\n📈 Latest reading: {:.1} {} (composition: {})",
            latest.weight,
            latest.unit,
            if latest.composition.is_some() {
                "yes"
            } else {
                "no"
            }
        );
    }

    manager.teardown().await?;
    info!("✅ Mock session completed");
    Ok(())
}
