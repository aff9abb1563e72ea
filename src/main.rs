//! Binary entrypoint for the pumpgate CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the gateway pipeline
//! - `init` - create a starter `config.toml`
//! - `status` - print transaction log and restart counter state
//! - `smoke-test --port <path> [-b <baud>] [--timeout <s>]` - probe the
//!   controller link with a startup announce
//!
//! See the library crate docs for module-level details: `pumpgate::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use pumpgate::config::Config;
use pumpgate::gateway::Gateway;
use pumpgate::logutil::hex_snippet;
use pumpgate::protocol;
use pumpgate::serial::{SerialBus, SerialLink};
use pumpgate::store::{RestartCounter, RingStore};

#[derive(Parser)]
#[command(name = "pumpgate")]
#[command(about = "Telemetry gateway for fuel-dispenser pump controllers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway pipeline
    Start {
        /// Pump controller serial port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Initialize a new gateway configuration
    Init,
    /// Show transaction log and restart counter status
    Status,
    /// Probe the controller link: announce and listen for traffic
    SmokeTest {
        /// Device serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 9600)]
        baud: u32,
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early to configure logging (except for Init which writes it)
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            info!("Starting pumpgate v{}", env!("CARGO_PKG_VERSION"));
            Gateway::run(config, port).await?;
        }
        Commands::Init => {
            info!("Initializing new gateway configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let restarts = RestartCounter::new(config.restart_counter_path())
                .load()
                .await;
            let (store, current_id) =
                RingStore::open(config.txn_log_path(), config.store.capacity).await?;
            let window_low = current_id.saturating_sub(store.capacity());
            println!("transaction log: {}", config.txn_log_path());
            println!("  capacity:      {}", store.capacity());
            println!("  next id:       {}", current_id);
            println!("  readable ids:  [{}, {})", window_low, current_id);
            println!("restart count:   {}", restarts);
        }
        Commands::SmokeTest {
            port,
            baud,
            timeout,
        } => {
            let mut link = SerialLink::open(&port, baud)?;
            link.write_frame(protocol::build_startup().as_bytes())?;
            info!("Startup announce sent on {} @ {} baud", port, baud);
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout);
            let mut scanner = protocol::RecordScanner::new();
            let mut total = 0usize;
            let mut records = 0usize;
            while tokio::time::Instant::now() < deadline {
                let mut buf = [0u8; 256];
                let n = link.read_available(&mut buf)?;
                if n > 0 {
                    total += n;
                    info!("rx {}", hex_snippet(&buf[..n], 64));
                    scanner.push(&buf[..n]);
                    while scanner.next_record().is_some() {
                        records += 1;
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
                }
            }
            let payload = serde_json::json!({
                "status": if total > 0 { "ok" } else { "silent" },
                "bytes_seen": total,
                "records_decoded": records,
                "frames_rejected": scanner.rejected(),
                "timeout_seconds": timeout,
            });
            println!("{}", payload);
            std::process::exit(if total > 0 { 0 } else { 1 });
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|c| c.logging.level.parse().unwrap_or(log::LevelFilter::Info))
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(file) = config.as_ref().and_then(|c| c.logging.file.clone()) {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When stdout is a terminal, echo log lines there as well; under
            // a supervisor stdout is redirected and the file is the record.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
