//! Binary entrypoint for the meshlink CLI.
//!
//! Commands:
//! - `init` - write a starter `meshlink.toml`
//! - `run [--tcp <addr>] [--port <path>] [--mock]` - keep a radio link up and log traffic
//! - `send --to <dest> --text <msg> [--channel <n>]` - connect, send one text, report delivery
//! - `nodes [--json]` - print the persisted node database
//!
//! See the library crate docs for module-level details: `meshlink::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use meshlink::config::{Config, RadioKind};
use meshlink::nodes::NodeDatabase;
use meshlink::protobuf::{NodeInfo, User, BROADCAST_NUM, ID_BROADCAST};
use meshlink::service::{MeshService, ServiceOptions};
use meshlink::storage::{JsonNodeStore, NodeStore};
use meshlink::transport::mock::{MockDevice, MockRadio};
use meshlink::transport::stream::TcpTransport;
use meshlink::transport::{event_channel, EventReceiver, RadioTransport};
use meshlink::ConnectionState;

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Link core for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshlink.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(clap::Args, Clone, Default)]
struct LinkArgs {
    /// Connect over TCP (host:port), overriding the configured radio
    #[arg(long)]
    tcp: Option<String>,
    /// Serial device (e.g. /dev/ttyUSB0), overriding the configured radio
    #[arg(short, long)]
    port: Option<String>,
    /// Use the built-in simulated radio
    #[arg(long)]
    mock: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Connect and keep the link up until interrupted
    Run {
        #[command(flatten)]
        link: LinkArgs,
    },
    /// Send one text message and wait for its delivery status
    Send {
        #[command(flatten)]
        link: LinkArgs,
        /// Destination: `^all`, `!1234abcd` or a decimal node number
        #[arg(long, default_value = ID_BROADCAST)]
        to: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Seconds to wait for the link to come up
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Print the persisted node database
    Nodes {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = match Config::load(&cli.config).await {
        Ok(c) => c,
        Err(e) => {
            init_logging(&None, cli.verbose);
            warn!("{}; using defaults", e);
            Config::default()
        }
    };
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Run { link } => {
            info!("Starting meshlink v{}", env!("CARGO_PKG_VERSION"));
            let service = start_service(&config, &link).await?;
            let mut state = service.connection_state();
            let mut packets = service.subscribe_packets();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("connection state: {:?}", *state.borrow_and_update());
                    }
                    packet = packets.recv() => {
                        if let Ok(p) = packet {
                            info!(
                                "heard packet id=0x{:08x} from {}",
                                p.id,
                                service.nodes().to_node_id(p.from)
                            );
                        }
                    }
                }
            }
            info!("shutting down");
            service.close();
            info!("metrics: {:?}", meshlink::metrics::snapshot());
        }
        Commands::Send {
            link,
            to,
            text,
            channel,
            timeout,
        } => {
            let service = start_service(&config, &link).await?;
            if !service
                .wait_for_state(ConnectionState::Connected, Duration::from_secs(timeout))
                .await
            {
                service.close();
                return Err(anyhow!("radio did not connect within {}s", timeout));
            }
            let dest = parse_destination(&to, service.nodes())?;
            let receipt = service.send_text(dest, channel, &text).await?;
            let id = receipt.packet_id();
            let status = receipt.await;
            println!(
                "{}",
                serde_json::json!({
                    "packet_id": format!("0x{:08x}", id),
                    "to": service.nodes().to_node_id(dest),
                    "status": format!("{:?}", status),
                })
            );
            service.close();
        }
        Commands::Nodes { json } => {
            let store = JsonNodeStore::in_dir(&config.storage.data_dir);
            let mut nodes = store.load_all().await?;
            nodes.sort_by(|a, b| b.last_heard.cmp(&a.last_heard));
            if json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else {
                for n in nodes {
                    let heard = chrono::DateTime::<chrono::Utc>::from_timestamp(
                        i64::from(n.last_heard),
                        0,
                    )
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                    println!(
                        "{:<10} {:<5} {:<30} {:>6.1} {}",
                        n.user.id, n.user.short_name, n.user.long_name, n.snr, heard
                    );
                }
            }
        }
    }

    Ok(())
}

async fn start_service(config: &Config, link: &LinkArgs) -> Result<Arc<MeshService>> {
    let (transport, events) = open_transport(config, link)?;
    let store: Arc<dyn NodeStore> = Arc::new(JsonNodeStore::in_dir(&config.storage.data_dir));
    let options = ServiceOptions::from_config(config).with_node_store(store);
    Ok(MeshService::start(transport, events, options).await)
}

fn open_transport(
    config: &Config,
    link: &LinkArgs,
) -> Result<(Arc<dyn RadioTransport>, EventReceiver)> {
    let (tx, rx) = event_channel();
    let kind = if link.mock {
        RadioKind::Mock
    } else if link.tcp.is_some() {
        RadioKind::Tcp
    } else if link.port.is_some() {
        RadioKind::Serial
    } else {
        config.radio.kind
    };
    let transport: Arc<dyn RadioTransport> = match kind {
        RadioKind::Tcp => {
            let addr = link
                .tcp
                .clone()
                .unwrap_or_else(|| config.radio.tcp_address.clone());
            info!("Connecting to {} over TCP", addr);
            Arc::new(TcpTransport::open(addr, tx))
        }
        RadioKind::Serial => open_serial(config, link, tx)?,
        RadioKind::Mock => {
            info!("Using simulated radio");
            let radio = Arc::new(MockRadio::new(demo_device(), tx));
            radio.connect();
            radio
        }
    };
    Ok((transport, rx))
}

#[cfg(feature = "serial")]
fn open_serial(
    config: &Config,
    link: &LinkArgs,
    tx: meshlink::transport::EventSender,
) -> Result<Arc<dyn RadioTransport>> {
    use meshlink::transport::serial::SerialTransport;
    let port = link.port.clone().unwrap_or_else(|| config.radio.port.clone());
    if port.is_empty() {
        return Err(anyhow!("no serial port configured; pass --port or set radio.port"));
    }
    info!("Opening {} @ {} baud", port, config.radio.baud_rate);
    let transport = SerialTransport::open(port.clone(), config.radio.baud_rate, tx)
        .map_err(|e| anyhow!("Failed to open {}: {}", port, e))?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "serial"))]
fn open_serial(
    _config: &Config,
    _link: &LinkArgs,
    _tx: meshlink::transport::EventSender,
) -> Result<Arc<dyn RadioTransport>> {
    Err(anyhow!("serial support requires the 'serial' feature"))
}

fn demo_device() -> MockDevice {
    MockDevice {
        my_node_num: 0x1000_0001,
        nodes: vec![NodeInfo {
            num: 0x1000_0002,
            user: Some(User {
                id: "!10000002".into(),
                long_name: "Simulated Peer".into(),
                short_name: "SIMP".into(),
                hw_model: 9,
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn parse_destination(to: &str, nodes: &NodeDatabase) -> Result<u32> {
    if to == ID_BROADCAST {
        return Ok(BROADCAST_NUM);
    }
    if let Some(num) = nodes.node_num_for_id(to) {
        return Ok(num);
    }
    if let Some(hex) = to.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).map_err(|_| anyhow!("bad node id '{}'", to));
    }
    to.parse::<u32>()
        .map_err(|_| anyhow!("bad destination '{}'", to))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Only echo to the console when someone is watching.
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
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
