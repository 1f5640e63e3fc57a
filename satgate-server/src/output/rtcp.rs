//! RTCP sender report generation.
//!
//! A compound packet is built in the order SR, SDES, APP and sent in one
//! datagram (or one interleaved TCP frame) at a fixed cadence. All
//! multi-byte fields are big-endian, every length field is encoded as
//! `(byteLength / 4) - 1` 32-bit words, and the APP description string is
//! padded to a 4-byte boundary with the padding counted in its length
//! field. Third-party SAT>IP clients parse these bytes, so the layout is
//! fixed.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|    RC   |   PT=SR=200   |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         SSRC of sender                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              NTP timestamp, most significant word             |
//! |             NTP timestamp, least significant word             |
//! |                         RTP timestamp                         |
//! |                     sender's packet count                     |
//! |                      sender's octet count                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info};
use satgate_mpegts::Filter;

use crate::output::sink::interleaved_header;
use crate::stream::client::StreamClient;
use crate::stream::properties::StreamProperties;
use crate::sync::lock_ignore_poison;

/// CNAME carried in the SDES packet.
const CNAME: &[u8] = b"satgate";

/// Sender Report, 28 bytes.
pub fn build_sr(ssrc: u32, ntp_secs: u32, rtp_timestamp: u32, spc: u32, soc: u32) -> [u8; 28] {
    let mut sr = [0u8; 28];
    sr[0] = 0x80; // version: 2, padding: 0, report blocks: 0
    sr[1] = 200; // payload type: 200 (SR)
    let sr_len = sr.len();
    sr[2..4].copy_from_slice(&word_length(sr_len).to_be_bytes());
    sr[4..8].copy_from_slice(&ssrc.to_be_bytes());
    sr[8..12].copy_from_slice(&ntp_secs.to_be_bytes());
    // NTP fractional part stays zero
    sr[16..20].copy_from_slice(&rtp_timestamp.to_be_bytes());
    sr[20..24].copy_from_slice(&spc.to_be_bytes());
    sr[24..28].copy_from_slice(&soc.to_be_bytes());
    sr
}

/// Source Description with one CNAME item, 20 bytes.
pub fn build_sdes(ssrc: u32) -> [u8; 20] {
    let mut sdes = [0u8; 20];
    sdes[0] = 0x81; // version: 2, padding: 0, source count: 1
    sdes[1] = 202; // payload type: 202 (SDES)
    let sdes_len = sdes.len();
    sdes[2..4].copy_from_slice(&word_length(sdes_len).to_be_bytes());
    sdes[4..8].copy_from_slice(&ssrc.to_be_bytes());
    sdes[8] = 1; // CNAME
    sdes[9] = CNAME.len() as u8;
    sdes[10..10 + CNAME.len()].copy_from_slice(CNAME);
    // item list terminator and padding stay zero
    sdes
}

/// Application-defined packet carrying the live SAT>IP description
/// string, padded to a 32-bit boundary.
pub fn build_app(ssrc: u32, description: &str) -> Vec<u8> {
    let mut len = 16 + description.len();
    if len % 4 != 0 {
        len += 4 - (len % 4);
    }
    let mut app = vec![0u8; len];
    app[0] = 0x80; // version: 2, padding: 0, subtype: 0
    app[1] = 204; // payload type: 204 (APP)
    app[2..4].copy_from_slice(&word_length(len).to_be_bytes());
    app[4..8].copy_from_slice(&ssrc.to_be_bytes());
    app[8..12].copy_from_slice(b"SES1");
    // identifier stays zero; string length includes the padding
    let string_length = (len - 16) as u16;
    app[14..16].copy_from_slice(&string_length.to_be_bytes());
    app[16..16 + description.len()].copy_from_slice(description.as_bytes());
    app
}

/// The compound datagram: SR, SDES, APP in that order.
pub fn build_compound(ssrc: u32, rtp_timestamp: u32, spc: u32, soc: u32, description: &str) -> Vec<u8> {
    let ntp_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let sr = build_sr(ssrc, ntp_secs, rtp_timestamp, spc, soc);
    let sdes = build_sdes(ssrc);
    let app = build_app(ssrc, description);

    let mut compound = Vec::with_capacity(sr.len() + sdes.len() + app.len());
    compound.extend_from_slice(&sr);
    compound.extend_from_slice(&sdes);
    compound.extend_from_slice(&app);
    compound
}

/// RTCP length field: total length in 32-bit words minus one.
fn word_length(bytes: usize) -> u16 {
    (bytes / 4 - 1) as u16
}

/// Where the RTCP reports go.
pub enum RtcpSink {
    Udp { socket: UdpSocket, peer: SocketAddr },
    /// Interleaved on the session TCP connection, odd channel.
    Tcp { stream: TcpStream, channel: u8 },
}

impl RtcpSink {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Udp { socket, peer } => {
                socket.send_to(data, *peer)?;
                Ok(())
            }
            Self::Tcp { stream, channel } => {
                stream.write_all(&interleaved_header(*channel, data.len()))?;
                stream.write_all(data)
            }
        }
    }
}

const STATE_RUNNING: u8 = 0;
const STATE_PAUSED: u8 = 1;

/// The per-stream RTCP generator thread.
pub struct RtcpThread {
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl RtcpThread {
    /// Spawn the generator; it reports every `interval` until stopped.
    pub fn start(
        properties: Arc<Mutex<StreamProperties>>,
        filter: Arc<Mutex<Filter>>,
        client: Arc<StreamClient>,
        mut sink: RtcpSink,
        interval: Duration,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));

        let thread_running = Arc::clone(&running);
        let thread_state = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            info!("RTCP generator started");
            while thread_running.load(Ordering::SeqCst) {
                if thread_state.load(Ordering::SeqCst) == STATE_RUNNING {
                    let (ssrc, timestamp, spc, soc, description) = {
                        let props = lock_ignore_poison(&properties);
                        let pid_csv = lock_ignore_poison(&filter).pid_csv();
                        (
                            props.ssrc(),
                            props.timestamp(),
                            props.spc(),
                            props.soc(),
                            props.attribute_describe_string(&pid_csv),
                        )
                    };
                    let compound = build_compound(ssrc, timestamp, spc, soc, &description);
                    if let Err(e) = sink.send(&compound) {
                        if !client.is_self_destructing() {
                            error!("Error sending RTCP data: {e}");
                            client.self_destruct();
                        }
                    }
                }
                std::thread::sleep(interval);
            }
            info!("RTCP generator stopped");
        });

        Self {
            running,
            state,
            handle: Some(handle),
        }
    }

    pub fn pause(&self) {
        self.state.store(STATE_PAUSED, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
    }

    /// Stop and join the generator thread.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RtcpThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_layout_is_bit_exact() {
        let sr = build_sr(0x0102_0304, 0xAABB_CCDD, 0x0000_5AA5, 1000, 1_316_000);
        assert_eq!(sr[0], 0x80);
        assert_eq!(sr[1], 200);
        // 28 bytes -> 6 words
        assert_eq!(&sr[2..4], &[0x00, 0x06]);
        assert_eq!(&sr[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&sr[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&sr[12..16], &[0, 0, 0, 0]); // NTP fraction
        assert_eq!(&sr[16..20], &[0x00, 0x00, 0x5A, 0xA5]);
        assert_eq!(&sr[20..24], &1000u32.to_be_bytes());
        assert_eq!(&sr[24..28], &1_316_000u32.to_be_bytes());
    }

    #[test]
    fn sdes_carries_the_cname() {
        let sdes = build_sdes(7);
        assert_eq!(sdes.len(), 20);
        assert_eq!(sdes[0], 0x81);
        assert_eq!(sdes[1], 202);
        assert_eq!(&sdes[2..4], &[0x00, 0x04]);
        assert_eq!(sdes[8], 1);
        assert_eq!(sdes[9], 7);
        assert_eq!(&sdes[10..17], b"satgate");
        // terminated and padded with zeros
        assert_eq!(&sdes[17..20], &[0, 0, 0]);
    }

    #[test]
    fn app_pads_to_word_boundary() {
        let description = "ver=1.0;src=1;tuner=1,240,1,15,11739.00,v,dvbs2,8psk,on,0.35,27500,34;pids=0";
        let app = build_app(0x10, description);

        assert_eq!(app.len() % 4, 0);
        assert_eq!(app[0], 0x80);
        assert_eq!(app[1], 204);
        assert_eq!(&app[8..12], b"SES1");

        let words = u16::from_be_bytes([app[2], app[3]]);
        assert_eq!(usize::from(words), app.len() / 4 - 1);

        // the string length field covers the description plus padding
        let string_length = u16::from_be_bytes([app[14], app[15]]);
        assert_eq!(usize::from(string_length), app.len() - 16);
        assert!(usize::from(string_length) >= description.len());
        assert_eq!(&app[16..16 + description.len()], description.as_bytes());
    }

    #[test]
    fn app_with_aligned_string_has_no_padding() {
        let app = build_app(1, "abcd");
        assert_eq!(app.len(), 20);
        let string_length = u16::from_be_bytes([app[14], app[15]]);
        assert_eq!(string_length, 4);
    }

    #[test]
    fn compound_order_is_sr_sdes_app() {
        let compound = build_compound(9, 0, 0, 0, "NONE");
        assert_eq!(compound[1], 200);
        assert_eq!(compound[28 + 1], 202);
        assert_eq!(compound[28 + 20 + 1], 204);
    }
}
