//! Per-client session state shared across threads.
//!
//! A fatal network error flags the client for self-destruction; the flag
//! is observed by the stream thread and the session watchdog, which tears
//! the session down cooperatively. Teardown is always by join, never by
//! killing a thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

pub struct StreamClient {
    /// RTP destination; RTCP goes to the port above it.
    rtp_addr: Option<SocketAddr>,
    self_destruct: AtomicBool,
    last_seen: Mutex<Instant>,
    session_timeout: Duration,
}

impl StreamClient {
    pub fn new(rtp_addr: Option<SocketAddr>, session_timeout: Duration) -> Self {
        Self {
            rtp_addr,
            self_destruct: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
            session_timeout,
        }
    }

    pub fn rtp_addr(&self) -> Option<SocketAddr> {
        self.rtp_addr
    }

    pub fn rtcp_addr(&self) -> Option<SocketAddr> {
        self.rtp_addr.map(|mut addr| {
            addr.set_port(addr.port() + 1);
            addr
        })
    }

    /// Flag this client's session for teardown.
    pub fn self_destruct(&self) {
        if !self.self_destruct.swap(true, Ordering::SeqCst) {
            info!("Client flagged for self-destruct");
        }
    }

    pub fn is_self_destructing(&self) -> bool {
        self.self_destruct.load(Ordering::SeqCst)
    }

    /// Refresh the watchdog timestamp, e.g. on a session keepalive.
    pub fn keep_alive(&self) {
        let mut last_seen = match self.last_seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last_seen = Instant::now();
    }

    /// Polled by the session watchdog: expired or self-destructing
    /// clients are torn down.
    pub fn should_disconnect(&self) -> bool {
        if self.is_self_destructing() {
            return true;
        }
        let last_seen = match self.last_seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        last_seen.elapsed() > self.session_timeout
    }
}
