use crate::rotation::RotationEngine;
use crate::storage;
use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Device definition from JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Short immutable device key (unique identifier)
    pub key: String,
    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,
}

/// Root structure of the devices JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesFile {
    pub devices: Vec<DeviceDefinition>,
}

/// Provision devices from a JSON file (idempotent)
pub async fn sync_devices_from_file(engine: &RotationEngine, file_path: &Path) -> Result<()> {
    tracing::info!("Loading devices from {}", file_path.display());

    // Read and parse JSON file
    let content = fs::read_to_string(file_path).into_diagnostic().map_err(|e| {
        miette::miette!(
            "Failed to read devices file at '{}': {}",
            file_path.display(),
            e
        )
    })?;

    let devices_file: DevicesFile = serde_json::from_str(&content)
        .into_diagnostic()
        .map_err(|e| {
            miette::miette!(
                "Failed to parse devices JSON file: {}\n\nExpected format:\n{{\n  \"devices\": [\n    {{\n      \"key\": \"gw-0042\",\n      \"name\": \"Gateway 42\"\n    }}\n  ]\n}}",
                e
            )
        })?;

    tracing::info!("Found {} device(s) in file", devices_file.devices.len());

    let mut created = 0;
    let mut updated = 0;
    let mut unchanged = 0;

    for device_def in devices_file.devices {
        match sync_device(engine, &device_def).await? {
            SyncResult::Created => created += 1,
            SyncResult::Updated => updated += 1,
            SyncResult::Unchanged => unchanged += 1,
        }
    }

    tracing::info!(
        "Device sync complete: {} created, {} updated, {} unchanged",
        created,
        updated,
        unchanged
    );

    Ok(())
}

#[derive(Debug)]
enum SyncResult {
    Created,
    Updated,
    Unchanged,
}

/// Provision a single device (idempotent)
async fn sync_device(engine: &RotationEngine, device_def: &DeviceDefinition) -> Result<SyncResult> {
    // Check if device exists
    let existing = storage::get_device_by_key(engine.db(), &device_def.key)
        .await
        .into_diagnostic()?;

    let result = match existing {
        None => {
            // Register new device (creates the external client as well)
            tracing::info!("Registering device: {}", device_def.key);
            engine
                .register_device(&device_def.key, device_def.name.clone())
                .await
                .into_diagnostic()?;

            SyncResult::Created
        }
        Some(existing_device) => {
            // Device exists - only the display name may change; the key and
            // the derived client id are immutable
            if existing_device.name != device_def.name {
                tracing::info!("Updating device: {}", device_def.key);
                storage::update_device_name(engine.db(), &device_def.key, device_def.name.clone())
                    .await
                    .into_diagnostic()?;

                SyncResult::Updated
            } else {
                SyncResult::Unchanged
            }
        }
    };

    Ok(result)
}
