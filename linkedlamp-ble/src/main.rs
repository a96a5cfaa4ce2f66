//! BLE provisioning tool for LinkedLamp devices
//!
//! Finds a lamp waiting for setup, lists the WiFi networks it can see and
//! sends it a group name and WiFi credentials.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::warn;
use tokio_util::sync::CancellationToken;

use linkedlamp_ble_controller::{
    BtleplugAdapter, ProvisionOutcome, ProvisioningClient, ProvisioningConfig, ProvisioningError,
    RetryHint, linkedlamp_home,
};

#[derive(Parser)]
#[command(name = "linkedlamp-ble")]
#[command(about = "BLE provisioning tool for LinkedLamp devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for LinkedLamp devices
    Scan {
        /// Device name prefix ("" lists every device of the service)
        #[arg(short, long)]
        prefix: Option<String>,
        /// Scan duration in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// List the WiFi networks the nearest lamp can see
    Ssids {
        /// Device name prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },
    /// Send group and WiFi credentials to the nearest lamp
    Provision {
        /// Lamp group
        #[arg(short, long)]
        group: String,
        /// WiFi network name; read from --file when absent
        #[arg(short, long)]
        ssid: Option<String>,
        /// WiFi password, used with --ssid
        #[arg(long, default_value = "")]
        password: String,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: String,
        /// Device name prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = ProvisioningConfig::load_or_create(&linkedlamp_home()?)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let adapter = Arc::new(BtleplugAdapter::new().await?);

    match cli.command {
        Commands::Scan { prefix, timeout } => {
            if let Some(prefix) = prefix {
                config.device_name_prefix = prefix;
            }
            if let Some(timeout) = timeout {
                config.scan_timeout_ms = timeout.saturating_mul(1000);
            }
            let client = ProvisioningClient::new(adapter, config);
            scan_devices(&client, &cancel).await.map_err(explain)?;
        }
        Commands::Ssids { prefix } => {
            if let Some(prefix) = prefix {
                config.device_name_prefix = prefix;
            }
            let client = ProvisioningClient::new(adapter, config);
            list_ssids(&client, &cancel).await.map_err(explain)?;
        }
        Commands::Provision {
            group,
            ssid,
            password,
            file,
            prefix,
        } => {
            validate_group(&group)?;
            let (ssid, password) = match ssid {
                Some(ssid) => (ssid, password),
                None => read_wifi_credentials(&file)?,
            };
            let password = printable_password(&password);

            if let Some(prefix) = prefix {
                config.device_name_prefix = prefix;
            }
            let client = ProvisioningClient::new(adapter, config);
            provision_device(&client, &group, &ssid, &password, &cancel)
                .await
                .map_err(explain)?;
        }
    }

    Ok(())
}

/// Print what the user can do about a failure, then pass it on
fn explain(e: ProvisioningError) -> ProvisioningError {
    match e.retry_hint() {
        RetryHint::RetryScan => println!("Make sure the lamp is in setup mode and try again."),
        RetryHint::CheckPasswordAndRetry => println!("Check the WiFi password and try again."),
        RetryHint::None => {}
    }
    e
}

fn read_wifi_credentials(file: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines.next().unwrap_or_default().trim().to_string();
    Ok((ssid, password))
}

fn validate_group(group: &str) -> Result<(), String> {
    if group.chars().count() <= 2 {
        return Err(format!("Group {group:?} is too short, use at least 3 characters"));
    }
    Ok(())
}

/// The lamp firmware only accepts printable ASCII passwords
fn printable_password(password: &str) -> String {
    let printable: String = password.chars().filter(|c| (' '..='~').contains(c)).collect();
    if printable.len() != password.len() {
        warn!("Removed non-printable characters from the password");
    }
    printable
}

async fn scan_devices(
    client: &ProvisioningClient<BtleplugAdapter>,
    cancel: &CancellationToken,
) -> Result<(), ProvisioningError> {
    println!(
        "Scanning for LinkedLamp devices ({} seconds)...",
        client.config().scan_timeout().as_secs()
    );
    let devices = client.scan_once(cancel).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({}) RSSI: {}", device.name, device.id, rssi);
    }
    Ok(())
}

async fn list_ssids(
    client: &ProvisioningClient<BtleplugAdapter>,
    cancel: &CancellationToken,
) -> Result<(), ProvisioningError> {
    println!("Waiting for a lamp in setup mode...");
    let ssids = client.scan_connect_and_request_ssids(cancel).await;
    let disconnected = client.disconnect().await;
    let ssids = ssids?;
    disconnected?;

    println!("\n{} networks:", ssids.len());
    for ssid in ssids {
        println!("  {ssid}");
    }
    Ok(())
}

async fn provision_device(
    client: &ProvisioningClient<BtleplugAdapter>,
    group: &str,
    ssid: &str,
    password: &str,
    cancel: &CancellationToken,
) -> Result<(), ProvisioningError> {
    println!("Waiting for a lamp in setup mode...");
    let device = client.scan_until_found_and_connect(cancel).await?;
    println!("Connected to {}", device.name);

    println!("Sending credentials...");
    println!("  Group: {group}");
    println!("  SSID: {ssid}");
    let outcome = client.provision(group, ssid, password, cancel).await;
    let disconnected = client.disconnect().await;

    match outcome? {
        ProvisionOutcome::Success => println!("Lamp connected to WiFi."),
        ProvisionOutcome::WifiFailed => {
            println!("Lamp could not join {ssid}. Check the WiFi password and try again.")
        }
    }
    disconnected
}
