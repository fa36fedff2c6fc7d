//! # Liaison
//!
//! Runs the WebSocket RPC server with the device manager attached.
//!
//! ```bash
//! # Serve on the configured address
//! liaison --config liaison.toml
//!
//! # Load devices at start-up, override the port, log JSON
//! liaison --devices devices.yaml --port 8100 --json
//!
//! # In-memory serial ports instead of hardware
//! liaison --simulate
//!
//! # Show the configuration after file and environment layering
//! liaison --config liaison.toml --print-config
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use liaison_core::config::{Config, ConfigBuilder};
use liaison_core::logging;
use liaison_core::runtime::build_runtime;
use liaison_devices::discovery::PortInfo;
use liaison_devices::transport::LoopbackBus;
use liaison_devices::{
    register_default_factories, spec, DeviceContext, SerialOptions, SharedDeviceRegistry, TPadOptions,
};
use liaison_server::LiaisonServer;

/// Liaison - remote control and event push server for lab response hardware
#[derive(Parser, Debug)]
#[command(name = "liaison")]
#[command(version)]
#[command(about = "Remote control and event push server for lab response hardware")]
#[command(long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to bind, overrides server.host
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Device spec file (JSON or YAML) to load at start-up
    #[arg(short, long, value_name = "FILE")]
    devices: Option<PathBuf>,

    /// Log filter, overrides logging.level
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Use in-memory serial ports instead of hardware
    #[arg(short = 's', long)]
    simulate: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("Liaison startup failed: {:#}", e);
        eprintln!("liaison: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut builder = ConfigBuilder::new().with_environment_prefix("LIAISON");
    if let Some(path) = &args.config {
        builder = builder.with_config_file(path);
    }
    let mut config = builder.build().context("loading configuration")?;

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(devices) = &args.devices {
        config.devices.spec_file = devices.to_string_lossy().to_string();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json {
        config.logging.json_format = true;
    }
    Ok(config)
}

fn device_context(config: &Config, simulate: bool) -> DeviceContext {
    let context = if simulate {
        let ports = vec![PortInfo::new("COM1")
            .with_manufacturer("FTDI")
            .with_description("Simulated TPad (COM1)")];
        DeviceContext::loopback(LoopbackBus::new(), ports)
    } else {
        DeviceContext::system()
    };
    context
        .with_tpad_options(TPadOptions::from_config(&config.devices, &config.runtime))
        .with_serial_options(SerialOptions::from_config(&config.runtime))
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    logging::init_with_config(&config.logging)?;

    info!(
        "{} v{} starting ({})",
        config.general.app_name,
        env!("CARGO_PKG_VERSION"),
        config.general.environment
    );
    liaison_devices::init()?;

    let registry = SharedDeviceRegistry::new();
    register_default_factories(registry.registry(), device_context(&config, args.simulate));
    if args.simulate {
        info!("Simulation mode enabled");
    }

    if !config.devices.spec_file.is_empty() {
        let entries = spec::load_file(&config.devices.spec_file)
            .with_context(|| format!("reading device spec {}", config.devices.spec_file))?;
        for registration in registry.registry().add_from_spec(entries)? {
            info!("Device {} registered", registration.name());
        }
    }

    let server = LiaisonServer::new(&config.server).with_device_manager(registry.clone())?;
    let runtime = build_runtime(&config.runtime)?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(server.bind_address())
            .await
            .with_context(|| format!("binding {}", server.bind_address()))?;

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        };
        server.serve_with_shutdown(listener, shutdown).await?;

        if let Err(e) = registry.registry().shutdown_all_devices().await {
            warn!("Device shutdown incomplete: {}", e);
        }
        info!("Liaison stopped");
        Ok::<_, anyhow::Error>(())
    })
}
