use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use benchlink_core::simulator::{Simulator, SimulatorConfig};

#[derive(Parser)]
#[command(name = "benchlink-sim")]
#[command(about = "Emulate a benchlink measurement device over UDP")]
#[command(version)]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = 8888, env = "BENCHLINK_SIM_PORT")]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: std::net::IpAddr,

    /// Model reported in ID replies
    #[arg(long, default_value = "ROCKET")]
    model: String,

    /// Serial number reported in ID replies
    #[arg(long, default_value = "888")]
    serial: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref());

    let addr = SocketAddr::new(args.bind, args.port);
    let simulator = Simulator::bind(
        addr,
        SimulatorConfig {
            model: args.model,
            serial: args.serial,
        },
    )
    .await?;
    let handle = simulator.spawn();
    info!(addr = %handle.local_addr(), "Starting benchlink-sim");

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }

    handle.stop().await?;
    Ok(())
}

fn init_logging(log_file: Option<&std::path::Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "benchlink-sim.log".into());
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
