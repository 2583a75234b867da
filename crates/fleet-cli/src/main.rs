//! `fleet-cli` — the device fleet manager's standalone entry point. The
//! facade is otherwise invoked via the enclosing test-invocation runner;
//! this binary exposes only the read-only `list-devices` view.

use clap::{Parser, Subcommand};
use fleet::FleetManager;
use shared::descriptor::DeviceDescriptor;
use shared::FleetConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleet-cli", about = "Inspect the device fleet manager's pool")]
struct Cli {
    /// Path to a JSON `FleetConfig` file; falls back to built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the current device table.
    ListDevices {
        /// Include the {class, DeviceState} columns.
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let manager = FleetManager::new(config);
    manager.init().await?;

    match cli.command {
        Commands::ListDevices { full } => list_devices(&manager, full),
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<FleetConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            Ok(FleetConfig::from_json(&data)?)
        }
        None => Ok(FleetConfig::default()),
    }
}

/// Columns {Serial, State, Allocation, Product, Variant, Build, Battery [,
/// class, DeviceState]}; sort order is by mode then by serial.
fn list_devices(manager: &FleetManager, full: bool) {
    let mut devices: Vec<DeviceDescriptor> = manager.registry().snapshot();
    devices.sort_by(|a, b| a.mode.to_string().cmp(&b.mode.to_string()).then_with(|| a.serial.cmp(&b.serial)));

    println!(
        "{:<20} {:<10} {:<12} {:<10} {:<12} {:<10} {:<4}{}",
        "Serial",
        "State",
        "Allocation",
        "Product",
        "Variant",
        "Build",
        "Battery",
        if full { " class     DeviceState" } else { "" }
    );
    for device in &devices {
        if full {
            println!("{}", device.full());
        } else {
            println!("{}", device.short());
        }
    }
}
