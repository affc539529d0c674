use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use tokio::sync::oneshot;
use tracing_subscriber::filter::LevelFilter;

use lumend::Config;
use lumend::Controller;
use lumend::Device;
use lumend::Profile;
use lumend::ScheduleEngine;
use lumend::api;
use lumend::device::DEFAULT_PORT;
use lumend::net::discovery;

#[derive(Parser)]
#[command(name = "lumend", version, about = "LAN light fixture control daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "lumend.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (the default)
    Run,
    /// Search the LAN for fixtures and print what responds
    Discover {
        /// How long to listen for responses, in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Query a fixture at a known address and print its details
    Probe {
        ip: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(config.logging.level))
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Discover { timeout } => discover(Duration::from_secs(timeout)).await,
        Command::Probe { ip, port } => probe(&ip, port).await,
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("lumend starting");

    let controller = Arc::new(Controller::new());

    if let Some(device) = &config.device {
        let device = Device::manual(&device.ip, device.port);
        // A fixture that is offline at startup should not stop the daemon;
        // the schedule and API still run, and the user can reconnect later.
        if let Err(e) = controller.connect(device).await {
            tracing::error!("initial device connection failed: {e}");
        }
    } else {
        tracing::info!("no device configured, running without a connection");
    }

    let profiles: HashMap<String, Profile> = config
        .profiles()
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let engine = ScheduleEngine::new(config.schedules.clone());
    let mut schedule_rx = engine.start();
    tracing::info!(rules = config.schedules.len(), "schedule engine started");

    let mut api_shutdown = None;
    let mut api_task = None;
    if let Some(api_config) = &config.api {
        if api_config.enabled {
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let listen = api_config.listen.clone();
            let port = api_config.port;
            let api_controller = controller.clone();
            api_shutdown = Some(shutdown_tx);
            api_task = Some(tokio::spawn(async move {
                if let Err(e) = api::serve(listen, port, api_controller, shutdown_rx).await {
                    tracing::error!("HTTP API server failed: {e}");
                }
            }));
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            event = schedule_rx.recv() => {
                let Some(event) = event else { break };
                let Some(profile) = profiles.get(&event.profile_id) else {
                    tracing::warn!(
                        rule = %event.rule_name,
                        profile = %event.profile_id,
                        "schedule references unknown profile"
                    );
                    continue;
                };
                if !controller.is_connected() {
                    tracing::warn!(
                        rule = %event.rule_name,
                        "skipping scheduled profile, no device connected"
                    );
                    continue;
                }
                if let Err(e) = controller.apply_profile(profile).await {
                    tracing::warn!(rule = %event.rule_name, "failed to apply scheduled profile: {e}");
                }
            }
        }
    }

    if let Some(shutdown_tx) = api_shutdown {
        let _ = shutdown_tx.send(());
    }
    if let Some(task) = api_task {
        let _ = task.await;
    }
    controller.disconnect().await;
    tracing::info!("lumend stopped");

    Ok(())
}

async fn discover(timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let devices = discovery::search(timeout).await?;
    if devices.is_empty() {
        println!("no devices responded");
        return Ok(());
    }

    for device in devices {
        let name = if device.name.is_empty() {
            "(unnamed)"
        } else {
            &device.name
        };
        println!(
            "{}  {}  {}  model={} fw={}",
            device.id,
            device.endpoint(),
            name,
            device.model,
            device.firmware_version
        );
    }
    Ok(())
}

async fn probe(ip: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let device = discovery::probe(ip, port).await?;
    println!("id:       {}", device.id);
    println!("address:  {}", device.endpoint());
    println!("model:    {}", device.model);
    println!("name:     {}", device.name);
    println!("firmware: {}", device.firmware_version);
    Ok(())
}
