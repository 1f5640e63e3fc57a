//! Protocol output sinks.
//!
//! One stream writes to exactly one sink, chosen at session setup. The
//! RTP flavors stamp the mutable RTP header fields (sequence number,
//! timestamp, SSRC) immediately before each transmission; HTTP and the
//! TS writer send the bare payload.

use std::fs::File;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::path::Path;

use log::{debug, info};
use satgate_mpegts::PacketBuffer;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Send failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Grow the kernel send buffer the way the reference server does before
/// streaming starts.
const SEND_BUFFER_SCALE: usize = 20;

/// A TCP client that stops draining its socket must not stall the
/// stream thread forever.
const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Create a nonblocking UDP socket with an enlarged send buffer.
pub fn streaming_udp_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    let default_size = socket.send_buffer_size()?;
    let size = default_size * SEND_BUFFER_SCALE;
    socket.set_send_buffer_size(size)?;
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("fixed address");
    socket.bind(&bind_addr.into())?;
    info!("Set network send buffer size: {} KBytes", size / 1024);
    Ok(socket.into())
}

/// Where a stream's TS payload goes.
pub enum OutputSink {
    /// RTP over UDP towards a client address.
    RtpUdp { socket: UdpSocket, peer: SocketAddr },
    /// RTP interleaved on the session TCP connection
    /// (`$`, channel, 16-bit length framing).
    RtpTcp { stream: TcpStream, channel: u8 },
    /// Bare TS over an HTTP connection.
    Http { stream: TcpStream },
    /// Bare TS into a file.
    TsFile { file: File },
}

impl OutputSink {
    pub fn rtp_udp(peer: SocketAddr) -> std::io::Result<Self> {
        Ok(Self::RtpUdp {
            socket: streaming_udp_socket()?,
            peer,
        })
    }

    /// RTP interleaved on the session TCP connection; RTP rides the even
    /// channel, the companion RTCP sink the odd one.
    pub fn rtp_tcp(stream: TcpStream, channel: u8) -> std::io::Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self::RtpTcp { stream, channel })
    }

    pub fn http(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self::Http { stream })
    }

    pub fn ts_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::TsFile {
            file: File::create(path)?,
        })
    }

    /// Protocol tag for the startup/teardown log lines.
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::RtpUdp { .. } => "RTP/UDP",
            Self::RtpTcp { .. } => "RTP/TCP",
            Self::Http { .. } => "HTTP",
            Self::TsFile { .. } => "TS-Writer",
        }
    }

    /// Transmit one packet buffer. Returns the number of TS payload
    /// bytes handed to the network, for the sender statistics.
    pub fn send(
        &mut self,
        buffer: &mut PacketBuffer,
        ssrc: u32,
        cseq: u16,
        timestamp: u32,
    ) -> Result<usize, SendError> {
        let payload_len = buffer.current_size();
        match self {
            Self::RtpUdp { socket, peer } => {
                buffer.tag_rtp_header(ssrc, cseq, timestamp);
                socket.send_to(buffer.read_buffer(), *peer)?;
            }
            Self::RtpTcp { stream, channel } => {
                buffer.tag_rtp_header(ssrc, cseq, timestamp);
                let data = buffer.read_buffer();
                stream.write_all(&interleaved_header(*channel, data.len()))?;
                stream.write_all(data)?;
            }
            Self::Http { stream } => {
                stream.write_all(buffer.ts_read_buffer())?;
            }
            Self::TsFile { file } => {
                file.write_all(buffer.ts_read_buffer())?;
                debug!("Wrote {payload_len} TS bytes");
            }
        }
        Ok(payload_len)
    }
}

/// The 4-byte interleave header for RTP-over-TCP: `$`, channel, length.
pub fn interleaved_header(channel: u8, len: usize) -> [u8; 4] {
    [
        b'$',
        channel,
        ((len >> 8) & 0xFF) as u8,
        (len & 0xFF) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use satgate_mpegts::packet::null_packet;
    use satgate_mpegts::packet_buffer::RTP_HEADER_LEN;
    use satgate_mpegts::TS_PACKET_SIZE;

    fn buffer_with_one_packet() -> PacketBuffer {
        let mut buffer = PacketBuffer::new();
        buffer.initialize(7, 0);
        buffer.write_slot()[..TS_PACKET_SIZE].copy_from_slice(&null_packet());
        buffer.add_written(TS_PACKET_SIZE);
        buffer
    }

    #[test]
    fn interleave_framing() {
        assert_eq!(interleaved_header(0, 1328), [b'$', 0, 0x05, 0x30]);
        assert_eq!(interleaved_header(2, 200), [b'$', 2, 0x00, 0xC8]);
    }

    #[test]
    fn rtp_udp_sends_header_and_payload() {
        let receiver = UdpSocket::bind("127.0.0.1:0").expect("bind");
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .expect("timeout");
        let peer = receiver.local_addr().expect("addr");

        let mut sink = OutputSink::rtp_udp(peer).expect("sink");
        let mut buffer = buffer_with_one_packet();
        let sent = sink.send(&mut buffer, 7, 42, 90_000).expect("send");
        assert_eq!(sent, TS_PACKET_SIZE);

        let mut received = [0u8; 2048];
        let n = receiver.recv(&mut received).expect("recv");
        assert_eq!(n, RTP_HEADER_LEN + TS_PACKET_SIZE);
        assert_eq!(received[1], 33);
        assert_eq!(&received[2..4], &42u16.to_be_bytes());
        assert_eq!(&received[4..8], &90_000u32.to_be_bytes());
        assert_eq!(received[RTP_HEADER_LEN], 0x47);
    }

    #[test]
    fn ts_file_writes_payload_only() {
        let path = std::env::temp_dir().join("satgate-test-sink.ts");
        let mut sink = OutputSink::ts_file(&path).expect("sink");
        let mut buffer = buffer_with_one_packet();
        sink.send(&mut buffer, 7, 1, 0).expect("send");
        drop(sink);

        let written = std::fs::read(&path).expect("read back");
        assert_eq!(written.len(), TS_PACKET_SIZE);
        assert_eq!(written[0], 0x47);
        let _ = std::fs::remove_file(&path);
    }
}
