//! Server configuration: CLI flags, optional TOML file, merged defaults.
//!
//! CLI flags win over config file values, which win over the built-in
//! defaults.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// satgate-server - SAT>IP style MPEG-TS restreamer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TS input file to stream (looped)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// RTP destination address, RTCP goes to port + 1
    #[arg(short, long)]
    pub dest: Option<SocketAddr>,

    /// Write the raw TS to this file instead of streaming it
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// PIDs to open at startup (e.g. "0,16,17,100" or "all")
    #[arg(short, long, default_value = "all")]
    pub pids: String,

    /// Send pacing interval in microseconds
    #[arg(long)]
    pub send_interval_us: Option<u64>,

    /// Session timeout in seconds; an idle client is torn down after this
    #[arg(long)]
    pub session_timeout_secs: Option<u64>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    pub log_retention_days: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub dest: Option<String>,
    pub session_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamSection {
    pub input: Option<String>,
    pub pids: Option<String>,
    pub send_interval_us: Option<u64>,
    pub rtcp_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// The effective configuration the server runs with.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub input: Option<PathBuf>,
    pub dest: Option<SocketAddr>,
    pub output: Option<PathBuf>,
    pub pids: String,
    /// Pacing interval between sends, in microseconds.
    pub send_interval_us: u64,
    /// RTCP compound packet cadence, in milliseconds.
    pub rtcp_interval_ms: u64,
    pub session_timeout_secs: u64,
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            input: None,
            dest: None,
            output: None,
            pids: "all".to_string(),
            send_interval_us: 100,
            rtcp_interval_ms: 200,
            session_timeout_secs: 60,
            log_dir: PathBuf::from("logs"),
            log_retention_days: 7,
            verbose: false,
        }
    }
}

impl ServerConfig {
    /// Merge CLI arguments over an optional config file over defaults.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        let mut config = ServerConfig::default();

        if let Some(input) = &file.stream.input {
            config.input = Some(PathBuf::from(input));
        }
        if let Some(dest) = &file.server.dest {
            config.dest = dest.parse().ok();
        }
        if let Some(pids) = &file.stream.pids {
            config.pids = pids.clone();
        }
        if let Some(us) = file.stream.send_interval_us {
            config.send_interval_us = us;
        }
        if let Some(ms) = file.stream.rtcp_interval_ms {
            config.rtcp_interval_ms = ms;
        }
        if let Some(secs) = file.server.session_timeout_secs {
            config.session_timeout_secs = secs;
        }
        if let Some(dir) = &file.logging.log_dir {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(days) = file.logging.retention_days {
            config.log_retention_days = days;
        }

        if let Some(input) = &args.input {
            config.input = Some(input.clone());
        }
        if let Some(dest) = args.dest {
            config.dest = Some(dest);
        }
        if let Some(output) = &args.output {
            config.output = Some(output.clone());
        }
        if args.pids != "all" || config.pids.is_empty() {
            config.pids = args.pids.clone();
        }
        if let Some(us) = args.send_interval_us {
            config.send_interval_us = us;
        }
        if let Some(secs) = args.session_timeout_secs {
            config.session_timeout_secs = secs;
        }
        if args.log_dir != PathBuf::from("logs") {
            config.log_dir = args.log_dir.clone();
        }
        if args.log_retention_days != 7 {
            config.log_retention_days = args.log_retention_days;
        }
        config.verbose = args.verbose;

        Ok(config)
    }
}
