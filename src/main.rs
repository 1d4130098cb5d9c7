use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use iotp_client::management::{
    ActionResponse, AttributeActions, DeviceActions, DeviceInfo, DeviceLocation, ManagementHooks,
};
use iotp_client::{ClientSettings, Command, ManagedClient, Properties};
use serde_json::{json, Value};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const MANAGE_LIFETIME_SECS: u64 = 3600;

/// Demo hooks, every request is only logged
struct LoggingDevice;

impl DeviceActions for LoggingDevice {
    fn reboot(&self) -> ActionResponse {
        warn!("Reboot requested by the platform, ignoring");
        ActionResponse::accepted()
    }
}

impl AttributeActions for LoggingDevice {
    fn update_location(&self, location: DeviceLocation) -> bool {
        info!(
            "Platform moved device to {}, {} ({}m)",
            location.latitude, location.longitude, location.elevation
        );
        true
    }

    fn update_metadata(&self, metadata: &Value) -> bool {
        info!("Platform updated metadata: {}", metadata);
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = properties_path()?;
    info!("Using device properties from {}", path.display());
    let properties = Properties::load(&path).await?;

    let device = Arc::new(LoggingDevice);
    let hooks = ManagementHooks {
        actions: Some(device.clone()),
        firmware: None,
        attributes: Some(device),
    };

    let client = ManagedClient::connect(properties, ClientSettings::default(), hooks).await?;
    client.set_command_callback(|command: Command| {
        info!("Command received: {}", command);
    });

    if !client.properties().is_quickstart() {
        let device_info = DeviceInfo {
            description: "iotp-client demo device".to_string(),
            fw_version: env!("CARGO_PKG_VERSION").to_string(),
            ..DeviceInfo::default()
        };
        match client
            .manage(MANAGE_LIFETIME_SECS, client.supports(), &device_info)
            .await
        {
            Ok(true) => info!("Device is managed"),
            Ok(false) => warn!("Platform rejected the manage request"),
            Err(e) => error!("Manage request failed: {}", e),
        }
    }

    let status = json!({"d": {"status": "online"}});
    client
        .publish_event("status", "json", status.to_string(), 1)
        .await?;

    info!("Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if !client.properties().is_quickstart() {
        if let Err(e) = client.unmanage().await {
            warn!("Unmanage failed: {}", e);
        }
    }
    client.disconnect().await?;
    Ok(())
}

/// First argument, or `<config dir>/iotp-client/device.toml`
fn properties_path() -> Result<PathBuf> {
    if let Some(path) = std::env::args().nth(1) {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::config_dir().ok_or_else(|| eyre!("No configuration directory found"))?;
    Ok(dir.join("iotp-client").join("device.toml"))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
