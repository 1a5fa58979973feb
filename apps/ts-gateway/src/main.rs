use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

use can_transport as can;
use can_transport::CanBus;
use device_registry::{self as devreg, RegistryError};

mod gateway;
mod sim;

use gateway::Gateway;

#[derive(Parser, Debug)]
#[command(
    name = "ts-gateway",
    version,
    about = "ThingSet gateway",
    disable_help_subcommand = true
)]
struct Cli {
    /// Gateway configuration (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a mock CAN bus with a simulated device, no serial port
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Log filter, overrides RUST_LOG (e.g. "debug" or "ts_link=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Time to let CAN nodes publish before they are identified
    #[arg(long, default_value_t = 300u64, global = true)]
    settle_ms: u64,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Slcan,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print connected devices as {"name": "device id"}
    Devices,
    /// Send one request, e.g. `request <device id>/meas`
    Request {
        /// Device id followed by the node path; a trailing '/' lists children
        uri: String,
        #[arg(long, value_enum, default_value_t = HttpMethod::Get)]
        method: HttpMethod,
        /// JSON payload
        #[arg(long)]
        content: Option<String>,
    },
    /// Print publications and CAN telemetry as JSON lines
    Listen {
        /// Stop after this many lines
        #[arg(long)]
        count: Option<u32>,
    },
    /// List available CAN interfaces
    CanList {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.log_level.as_deref());

    if let Commands::CanList { backend } = cli.command {
        return can_list_backend(backend);
    }

    let config = match &cli.config {
        Some(path) => devreg::load_config(path)?,
        None => devreg::GatewayConfig::default(),
    };
    let settle = Duration::from_millis(cli.settle_ms);
    let gw = Arc::new(Gateway::start(config, cli.mock)?);

    let outcome = match cli.command {
        Commands::Devices => {
            let list = gw.discover(settle);
            println!("{list}");
            Ok(())
        }
        Commands::Request {
            uri,
            method,
            content,
        } => request(&gw, settle, &uri, method, content.as_deref()),
        Commands::Listen { count } => listen(gw.clone(), count).await,
        Commands::CanList { .. } => Ok(()),
    };

    if cli.metrics {
        eprint!("{}", gw.metrics.encode_text());
    }
    if let Ok(gw) = Arc::try_unwrap(gw) {
        gw.shutdown();
    }
    outcome
}

fn setup_tracing(level: Option<&str>) {
    let filter = match level {
        Some(l) => tracing_subscriber::EnvFilter::new(l),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn can_list_backend(backend: Backend) -> Result<()> {
    match backend {
        Backend::Mock => {
            for bus in can::MockBus::list()? {
                println!("{}\t{}", bus.name, bus.driver);
            }
        }
        Backend::Slcan => slcan_list()?,
    }
    Ok(())
}

#[cfg(feature = "slcan")]
fn slcan_list() -> Result<()> {
    for bus in can::SlcanBus::list()? {
        println!("{}\t{}", bus.name, bus.driver);
    }
    Ok(())
}

#[cfg(not(feature = "slcan"))]
fn slcan_list() -> Result<()> {
    bail!("built without SLCAN support")
}

fn request(gw: &Gateway, settle: Duration, uri: &str, method: HttpMethod, content: Option<&str>) -> Result<()> {
    let device_id = uri.split('/').next().unwrap_or_default();
    if gw.registry.get(device_id).is_none() {
        gw.discover(settle);
    }
    match gw.registry.execute(Some(uri), content, method.as_str()) {
        Ok(resp) => {
            let desc = resp
                .status_code()
                .map_or("Unknown status", |s| s.description());
            println!("{} {}", resp.http_status(), desc);
            if let Some(data) = resp.data() {
                println!("{data}");
            }
            Ok(())
        }
        Err(RegistryError::DeviceNotFound(_) | RegistryError::NoDevice) => {
            bail!("device not connected: {device_id}")
        }
        Err(e) => Err(e.into()),
    }
}

async fn listen(gw: Arc<Gateway>, count: Option<u32>) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let worker = gw.clone();
    let mut task = tokio::task::spawn_blocking(move || {
        worker.listen(count, &flag, |line| println!("{line}"));
    });
    tokio::select! {
        res = &mut task => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            stop.store(true, Ordering::Relaxed);
            task.await?;
        }
    }
    Ok(())
}
