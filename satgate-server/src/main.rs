//! satgate-server: SAT>IP style MPEG-TS restreamer.
//!
//! Replays or tunes an MPEG transport stream and sends it to a network
//! client over RTP/RTCP, RTP-over-TCP or HTTP, optionally descrambling
//! pay-TV payload through a CSA key feed.

use clap::Parser;
use log::{error, info};

use satgate_server::config::{Args, ServerConfig};
use satgate_server::logging::init_logging;
use satgate_server::Server;

fn main() {
    let args = Args::parse();

    let config = match ServerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.log_dir, config.log_retention_days, config.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "satgate-server {} starting up...",
        env!("CARGO_PKG_VERSION")
    );

    let server = Server::new(config);
    if let Err(e) = server.run() {
        error!("Server error: {e}");
        std::process::exit(1);
    }
    info!("satgate-server shut down");
}
