//! Server glue: builds a stream from the effective configuration and
//! runs the session watchdog.
//!
//! The watchdog polls every active session on a fixed interval from this
//! thread; it never arms per-client timers. An expired or
//! self-destructing client has its stream paused and torn down here, by
//! join, so the packet ring is never freed under a running thread.

use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::input::{DeviceError, TsFileReader};
use crate::output::{streaming_udp_socket, OutputSink, RtcpSink};
use crate::stream::{FrontendStatus, Stream, StreamError};
use crate::sync::lock_ignore_poison;

/// Fixed poll interval of the session watchdog.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("Failed to set up output: {0}")]
    Output(#[from] std::io::Error),
    #[error("No input configured, pass --input or set [stream] input")]
    NoInput,
    #[error("No output configured, pass --dest or --output")]
    NoOutput,
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Set up the stream described by the configuration and run it until
    /// its session expires or self-destructs.
    pub fn run(&self) -> Result<(), ServerError> {
        let config = &self.config;
        let input = config.input.as_ref().ok_or(ServerError::NoInput)?;

        let session_timeout = Duration::from_secs(config.session_timeout_secs);
        let ssrc = 0x8000_0000 | (std::process::id() & 0x7FFF_FFFF);
        let mut stream = Stream::new(0, ssrc, config.dest, session_timeout);

        // replay at PCR speed, not disk speed
        let device = Box::new(TsFileReader::open(input)?.with_pcr_pacing(stream.filter()));

        stream.parse_pid_string(&config.pids, false, true)?;
        // no hardware demux on a file input, accept every open request
        stream.update_pid_filters(|_| true, |_| true)?;

        // a replayed file always has signal lock
        {
            let properties = stream.properties();
            let mut props = lock_ignore_poison(&properties);
            props.set_status(FrontendStatus {
                strength: 240,
                has_lock: true,
                quality: 15,
            });
        }

        let (sink, rtcp_sink) = match (config.dest, &config.output) {
            (Some(peer), _) => {
                let sink = OutputSink::rtp_udp(peer)?;
                let rtcp_peer = {
                    let mut addr = peer;
                    addr.set_port(addr.port() + 1);
                    addr
                };
                let rtcp = RtcpSink::Udp {
                    socket: streaming_udp_socket()?,
                    peer: rtcp_peer,
                };
                (sink, Some(rtcp))
            }
            (None, Some(path)) => (OutputSink::ts_file(path)?, None),
            (None, None) => return Err(ServerError::NoOutput),
        };

        info!(
            "Stream: 0, Start {} stream, pids={}",
            sink.protocol(),
            config.pids
        );
        stream.start_streaming(
            device,
            sink,
            rtcp_sink,
            Duration::from_micros(config.send_interval_us),
            Duration::from_millis(config.rtcp_interval_ms),
            true,
        );

        loop {
            std::thread::sleep(WATCHDOG_INTERVAL);
            if stream.check_session() {
                info!("Stream: 0, Session expired or self-destructed, tearing down");
                stream.pause_streaming();
                break;
            }
        }
        stream.stop_streaming();
        Ok(())
    }
}
