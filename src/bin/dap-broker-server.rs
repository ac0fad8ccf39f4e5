//! CLI entry point for the broker server (see §6.3).

use std::sync::Arc;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use dap_broker::error::BrokerError;
use dap_broker::server::{Server, ServerConfig};
use dap_broker::session::Opener;
use dap_broker::transport::Address;

/// Only the real `hidapi` backend is built in, but probes are still looked
/// up by name so alternative backends can be registered without touching
/// the wire protocol.
const BACKEND_HID: &str = "hid";

#[derive(Parser)]
#[command(name = "dap-broker-server", version, about = "A multi-client broker for CMSIS-DAP debug probes")]
struct Cli {
    /// Socket address: a filesystem path for a Unix domain socket, or
    /// `host:port` for TCP. Defaults to the platform's well-known path.
    #[arg(long)]
    address: Option<String>,

    /// Address family to bind, inferred from `--address` if omitted.
    #[arg(long, value_enum)]
    socket: Option<SocketKind>,

    /// Probe backend to use. Only "hid" is built in.
    #[arg(long, default_value = BACKEND_HID)]
    interface: String,

    /// Exit once the client count returns to zero after at least one
    /// client has connected.
    #[arg(long)]
    temporary: bool,

    /// Increase log verbosity: `-v` for INFO, `-vv` for DEBUG.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SocketKind {
    Unix,
    Tcp,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.interface != BACKEND_HID {
        tracing::error!(interface = %cli.interface, "unknown probe backend");
        std::process::exit(1);
    }

    let address = match (&cli.address, cli.socket) {
        (Some(addr), Some(SocketKind::Unix)) => Address::Unix(addr.clone()),
        (Some(addr), Some(SocketKind::Tcp)) => Address::Tcp(addr.clone()),
        (Some(addr), None) => Address::parse(addr),
        (None, _) => Address::default(),
    };

    let config = ServerConfig {
        address,
        temporary: cli.temporary,
    };

    let opener: Opener<dap_broker::hid::RealHidDevice> = Arc::new(|selection, info| {
        selection.open(info).map_err(|e| BrokerError::Other(e.to_string()))
    });

    let server = Server::new(config, opener);
    if let Err(e) = server.run() {
        tracing::error!(error = %e, "broker exited with an error");
        std::process::exit(1);
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
