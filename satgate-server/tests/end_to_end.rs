//! End-to-end pacing test: synthetic TS packets go through the filter
//! into the packet ring and come out as paced RTP datagrams.

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::time::Duration;

use satgate_mpegts::psi::section::calculate_crc32;
use satgate_server::input::Device;
use satgate_server::output::OutputSink;
use satgate_server::stream::Stream;

const TS_PACKET_SIZE: usize = 188;
const RTP_HEADER_LEN: usize = 12;
const PMT_PID: u16 = 0x100;
const PCR_PID: u16 = 0x1FF;

/// Replays a prepared packet list, then reports no more data. Never has
/// signal lock, so no keepalive packets dilute the assertions.
struct ScriptedDevice {
    packets: VecDeque<[u8; TS_PACKET_SIZE]>,
}

impl Device for ScriptedDevice {
    fn is_data_available(&mut self) -> bool {
        if self.packets.is_empty() {
            // drained; idle instead of spinning the stream loop
            std::thread::sleep(Duration::from_millis(1));
            return false;
        }
        true
    }

    fn read_full_ts_packet(&mut self, packet: &mut [u8]) -> bool {
        match self.packets.pop_front() {
            Some(data) => {
                packet[..TS_PACKET_SIZE].copy_from_slice(&data);
                true
            }
            None => false,
        }
    }

    fn has_lock(&self) -> bool {
        false
    }
}

/// One TS packet carrying a complete section: pointer field, table
/// header, body, CRC32.
fn section_packet(table_id: u8, pid: u16, body: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let section_length = body.len() + 4;
    let mut section = Vec::new();
    section.push(table_id);
    section.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    section.push(section_length as u8);
    section.extend_from_slice(body);
    let crc = calculate_crc32(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    assert!(section.len() <= TS_PACKET_SIZE - 5);

    let mut packet = [0xFFu8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
    packet[2] = pid as u8;
    packet[3] = 0x10;
    packet[4] = 0x00; // pointer field
    packet[5..5 + section.len()].copy_from_slice(&section);
    packet
}

fn pat_packet() -> [u8; TS_PACKET_SIZE] {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes()); // transport stream id
    body.push(0xC1); // version 0, current
    body.push(0x00);
    body.push(0x00);
    body.extend_from_slice(&1u16.to_be_bytes()); // program 1
    body.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
    section_packet(0x00, 0, &body)
}

fn pmt_packet() -> [u8; TS_PACKET_SIZE] {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes()); // program number
    body.push(0xC1);
    body.push(0x00);
    body.push(0x00);
    body.extend_from_slice(&(0xE000 | PCR_PID).to_be_bytes());
    body.extend_from_slice(&0xF000u16.to_be_bytes()); // no program info
    body.push(0x02); // MPEG-2 video
    body.extend_from_slice(&(0xE000 | PCR_PID).to_be_bytes());
    body.extend_from_slice(&0xF000u16.to_be_bytes()); // no ES info
    section_packet(0x02, PMT_PID, &body)
}

/// Adaptation field with a PCR sample plus payload on the PCR PID.
fn pcr_packet(cc: u8, base: u32) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0x55u8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = (PCR_PID >> 8) as u8 & 0x1F;
    packet[2] = PCR_PID as u8;
    packet[3] = 0x30 | (cc & 0x0F);
    packet[4] = 7; // adaptation field length
    packet[5] = 0x10; // PCR flag
    packet[6..10].copy_from_slice(&base.to_be_bytes());
    packet[10] = 0;
    packet[11] = 0;
    packet
}

fn payload_packet(cc: u8) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0x55u8; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = (PCR_PID >> 8) as u8 & 0x1F;
    packet[2] = PCR_PID as u8;
    packet[3] = 0x10 | (cc & 0x0F);
    packet
}

#[test]
fn paced_stream_emits_one_buffer_per_seven_packets() {
    // 7 PSI/PCR packets fill the first buffer, 7 payload packets the second
    let mut packets = VecDeque::new();
    packets.push_back(pat_packet());
    packets.push_back(pmt_packet());
    let mut cc = 0u8;
    for i in 0..5 {
        packets.push_back(pcr_packet(cc, 90_000 * (i + 1)));
        cc = (cc + 1) % 0x10;
    }
    for _ in 0..7 {
        packets.push_back(payload_packet(cc));
        cc = (cc + 1) % 0x10;
    }
    assert_eq!(packets.len(), 14);

    let receiver = UdpSocket::bind("127.0.0.1:0").expect("bind receiver");
    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    let peer = receiver.local_addr().expect("addr");

    let mut stream = Stream::new(0, 0x5A7_6A7E, None, Duration::from_secs(60));
    stream.parse_pid_string("all", false, true).expect("pids");

    let sink = OutputSink::rtp_udp(peer).expect("sink");
    stream.start_streaming(
        Box::new(ScriptedDevice { packets }),
        sink,
        None,
        Duration::from_millis(100),
        Duration::from_millis(200),
        true,
    );

    let mut datagrams = Vec::new();
    let mut data = [0u8; 2048];
    for _ in 0..2 {
        let n = receiver.recv(&mut data).expect("paced RTP datagram");
        datagrams.push(data[..n].to_vec());
    }

    // no third buffer: only 14 packets were fed and lock is not signalled
    receiver
        .set_read_timeout(Some(Duration::from_millis(300)))
        .expect("timeout");
    assert!(receiver.recv(&mut data).is_err(), "unexpected third datagram");

    stream.stop_streaming();

    for datagram in &datagrams {
        assert_eq!(datagram.len(), RTP_HEADER_LEN + 7 * TS_PACKET_SIZE);
        assert_eq!(datagram[0], 0x80);
        assert_eq!(datagram[1], 33); // payload type MP2T
        // all seven TS packets aligned behind the header
        for i in 0..7 {
            assert_eq!(datagram[RTP_HEADER_LEN + i * TS_PACKET_SIZE], 0x47);
        }
    }

    let seq = |d: &[u8]| u16::from_be_bytes([d[2], d[3]]);
    let ts = |d: &[u8]| u32::from_be_bytes([d[4], d[5], d[6], d[7]]);
    assert_eq!(
        seq(&datagrams[1]),
        seq(&datagrams[0]).wrapping_add(1),
        "RTP sequence numbers must increase by exactly 1"
    );
    assert!(
        ts(&datagrams[1]) >= ts(&datagrams[0]),
        "RTP timestamps must be monotonically non-decreasing"
    );

    // the first buffer carries the PAT at the front
    assert_eq!(datagrams[0][RTP_HEADER_LEN + 1] & 0x1F, 0);
    assert_eq!(datagrams[0][RTP_HEADER_LEN + 2], 0);
}
