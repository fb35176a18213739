//! Command-line controller for benchlink measurement devices.
//!
//! # Usage
//!
//! ```bash
//! # Ask the device who it is
//! benchlink identify --ip 192.168.1.50 --port 8888
//!
//! # Run a 30 second test and stream samples (Ctrl-C stops the test)
//! benchlink run --ip 192.168.1.50 --port 8888 --duration 30
//!
//! # Same, one JSON object per event
//! benchlink --format json run --ip 192.168.1.50 --port 8888 --duration 30
//!
//! # Inspect or create the config file
//! benchlink config show
//! benchlink config init
//! ```

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use benchlink_core::config::{config_path, ControllerConfig};
use benchlink_core::controller::{CommandStatus, Controller};
use benchlink_core::state::TestPhase;
use benchlink_core::event::{DeviceEvent, TITLE_DEVICE_ERROR, TITLE_ID_ERROR, TITLE_TEST_ENDED};
use benchlink_core::validation::{self, ValidationError};
use benchlink_core::ControllerError;

/// Command-line controller for benchlink measurement devices.
#[derive(Parser)]
#[command(name = "benchlink")]
#[command(about = "Discover a measurement device and run timed tests over UDP")]
#[command(version)]
struct Cli {
    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and print the device model and serial number
    Identify {
        /// Device IPv4 address
        #[arg(long, env = "BENCHLINK_IP")]
        ip: String,
        /// Device UDP port
        #[arg(long, env = "BENCHLINK_PORT")]
        port: String,
        /// How long to wait for the device to answer, in milliseconds
        #[arg(short = 't', long, default_value = "5000", env = "BENCHLINK_TIMEOUT")]
        timeout_ms: u64,
    },

    /// Run a timed test and print every event until it ends
    Run {
        /// Device IPv4 address
        #[arg(long, env = "BENCHLINK_IP")]
        ip: String,
        /// Device UDP port
        #[arg(long, env = "BENCHLINK_PORT")]
        port: String,
        /// Test duration in seconds
        #[arg(short, long)]
        duration: String,
        /// How long to wait for identification, in milliseconds
        #[arg(short = 't', long, default_value = "5000", env = "BENCHLINK_TIMEOUT")]
        timeout_ms: u64,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Write the effective configuration to disk
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    Invalid(String),
    Connection(String),
    Device(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Invalid(_) => ExitCode::from(1),
            CliError::Connection(_) => ExitCode::from(2),
            CliError::Device(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Invalid(msg) => write!(f, "Invalid input: {}", msg),
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::Device(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

impl From<ValidationError> for CliError {
    fn from(e: ValidationError) -> Self {
        CliError::Invalid(e.to_string())
    }
}

impl From<ControllerError> for CliError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::Validation(e) => CliError::Invalid(e.to_string()),
            ControllerError::Session(e) => CliError::Connection(e.to_string()),
            other => CliError::Device(other.to_string()),
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Identify {
            ref ip,
            ref port,
            timeout_ms,
        } => {
            let (ip, port) = parse_target(ip, port)?;
            identify(ip, port, Duration::from_millis(timeout_ms), &cli).await
        }
        Command::Run {
            ref ip,
            ref port,
            ref duration,
            timeout_ms,
        } => {
            let (ip, port) = parse_target(ip, port)?;
            let duration = validation::parse_duration(duration)?;
            run_test(ip, port, duration, Duration::from_millis(timeout_ms), &cli).await
        }
        Command::Config { ref action } => manage_config(action, &cli),
    }
}

fn parse_target(ip: &str, port: &str) -> Result<(Ipv4Addr, u16), CliError> {
    Ok((validation::parse_ip(ip)?, validation::parse_port(port)?))
}

// ---------------------------------------------------------------------------
// Device commands
// ---------------------------------------------------------------------------

async fn identify(ip: Ipv4Addr, port: u16, wait: Duration, cli: &Cli) -> Result<(), CliError> {
    let controller = Controller::new(ControllerConfig::load());
    let mut events = controller.subscribe();

    let result = connect_and_identify(&controller, &mut events, ip, port, wait).await;
    controller.shutdown().await;
    let (model, serial) = result?;

    if cli.format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::json!({ "model": model, "serial": serial })
        );
    } else {
        println!("{} {}", model, serial);
    }
    Ok(())
}

async fn run_test(
    ip: Ipv4Addr,
    port: u16,
    duration_secs: u32,
    wait: Duration,
    cli: &Cli,
) -> Result<(), CliError> {
    let controller = Controller::new(ControllerConfig::load());
    let mut events = controller.subscribe();

    let result = async {
        let (model, serial) = connect_and_identify(&controller, &mut events, ip, port, wait).await?;
        if cli.format == OutputFormat::Text && !cli.quiet {
            eprintln!("Connected to {} #{} at {}:{}", model, serial, ip, port);
        }

        if controller.start_test(duration_secs).await? == CommandStatus::Ignored {
            return Err(CliError::Device("device refused to start a test".to_string()));
        }
        info!(duration_secs, "test requested");
        stream_until_ended(&controller, &mut events, cli).await
    }
    .await;

    controller.shutdown().await;
    result
}

async fn connect_and_identify(
    controller: &Controller,
    events: &mut broadcast::Receiver<DeviceEvent>,
    ip: Ipv4Addr,
    port: u16,
    wait: Duration,
) -> Result<(String, String), CliError> {
    controller.connect(&ip.to_string(), port).await?;

    let identified = async {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Identified { model, serial }) => return Ok((model, serial)),
                Ok(DeviceEvent::Notice { title, message }) if title == TITLE_ID_ERROR => {
                    return Err(CliError::Device(message));
                }
                Ok(DeviceEvent::ConnectionLost { reason }) => {
                    return Err(CliError::Connection(reason));
                }
                Ok(event) => debug!(?event, "waiting for identification"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(CliError::Connection("controller closed".to_string()));
                }
            }
        }
    };

    tokio::time::timeout(wait, identified)
        .await
        .map_err(|_| {
            CliError::Connection(format!(
                "no identification from {}:{} within {}ms",
                ip,
                port,
                wait.as_millis()
            ))
        })?
}

/// Print events until the device reports the test is over. The first Ctrl-C
/// asks the device to stop; a second one gives up waiting. A device error
/// before the test is running means it was refused.
async fn stream_until_ended(
    controller: &Controller,
    events: &mut broadcast::Receiver<DeviceEvent>,
    cli: &Cli,
) -> Result<(), CliError> {
    let mut stop_requested = false;
    let mut running = false;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() || stop_requested {
                    return Err(CliError::Device("interrupted before the test ended".to_string()));
                }
                stop_requested = true;
                if !cli.quiet {
                    eprintln!("Stopping test...");
                }
                controller.stop_test().await?;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event, cli);
                    match event {
                        DeviceEvent::Notice { ref title, .. } if title == TITLE_TEST_ENDED => {
                            return Ok(());
                        }
                        DeviceEvent::Notice { title, message }
                            if title == TITLE_DEVICE_ERROR && !running =>
                        {
                            return Err(CliError::Device(message));
                        }
                        DeviceEvent::TestStateChanged { phase } => {
                            running |= phase == TestPhase::Running;
                        }
                        DeviceEvent::ConnectionLost { reason } => {
                            return Err(CliError::Connection(reason));
                        }
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    if !cli.quiet {
                        eprintln!("Warning: {} events dropped", skipped);
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(CliError::Connection("controller closed".to_string()));
                }
            }
        }
    }
}

fn print_event(event: &DeviceEvent, cli: &Cli) {
    if cli.format == OutputFormat::Json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => debug!(error = %e, "event not serializable"),
        }
        return;
    }

    match event {
        DeviceEvent::Sample(sample) => println!(
            "t={} mv={} ma={}",
            sample.time_secs, sample.millivolts, sample.milliamps
        ),
        _ if cli.quiet => {}
        DeviceEvent::Notice { title, message } => eprintln!("[{}] {}", title, message),
        DeviceEvent::TestStateChanged { phase } => eprintln!("Test {}", phase),
        DeviceEvent::UnhandledMessage { raw } => eprintln!("Unhandled: {}", raw),
        DeviceEvent::ConnectionLost { reason } => eprintln!("Connection lost: {}", reason),
        DeviceEvent::ConnectError { reason } => eprintln!("Connect failed: {}", reason),
        DeviceEvent::Identified { .. }
        | DeviceEvent::BufferClear
        | DeviceEvent::ControlsChanged(_) => {}
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn manage_config(action: &ConfigAction, cli: &Cli) -> Result<(), CliError> {
    match action {
        ConfigAction::Show => {
            let config = ControllerConfig::load();
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::Invalid(e.to_string()))?;
            println!("{}", json);
        }
        ConfigAction::Path => {
            let path = config_path();
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "path": path }));
            } else {
                println!("{}", path.display());
            }
        }
        ConfigAction::Init => {
            ControllerConfig::load()
                .save()
                .map_err(|e| CliError::Invalid(format!("cannot write config: {}", e)))?;
            if !cli.quiet {
                eprintln!("Wrote {}", config_path().display());
            }
        }
    }
    Ok(())
}
