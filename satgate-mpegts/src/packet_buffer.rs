//! RTP send buffer holding a burst of TS packets.
//!
//! Each ring slot is one RTP datagram: a 12-byte RTP header followed by
//! up to seven 188-byte TS packets (1316 bytes of payload, bounded by the
//! network MTU). The owning stream thread is the only writer and reader.

use crate::packet::{SYNC_BYTE, TS_PACKET_SIZE};

/// Network MTU the buffer must stay under.
pub const MTU: usize = 1500;

/// Length of the fixed RTP header in front of the TS payload.
pub const RTP_HEADER_LEN: usize = 12;

/// Number of TS packets carried behind one RTP header.
pub const NUMBER_OF_TS_PACKETS: usize = 7;

/// Maximum TS payload per buffer.
pub const MAX_TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE * NUMBER_OF_TS_PACKETS;

const _: () = assert!(MAX_TS_PAYLOAD_SIZE + RTP_HEADER_LEN < MTU);

/// RTP header + TS packet burst, written front to back by the producer.
pub struct PacketBuffer {
    buffer: [u8; MTU],
    write_index: usize,
    decrypt_pending: bool,
    purge_pending: usize,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self {
            buffer: [0; MTU],
            write_index: RTP_HEADER_LEN,
            decrypt_pending: false,
            purge_pending: 0,
        }
    }

    /// Write the fixed RTP header fields once, at stream start.
    pub fn initialize(&mut self, ssrc: u32, timestamp: u32) {
        self.buffer[0] = 0x80; // version: 2, padding: 0, extension: 0, CSRC: 0
        self.buffer[1] = 33; // marker: 0, payload type: 33 (MP2T)
        self.buffer[2] = 0; // sequence number
        self.buffer[3] = 0; // sequence number
        self.buffer[4..8].copy_from_slice(&timestamp.to_be_bytes());
        self.buffer[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    /// Rewind the write cursor past the header and clear pending flags.
    pub fn reset(&mut self) {
        self.decrypt_pending = false;
        self.purge_pending = 0;
        self.write_index = RTP_HEADER_LEN;
    }

    /// Check the first three packet slots for the TS sync byte.
    pub fn is_synced(&self) -> bool {
        self.buffer[RTP_HEADER_LEN] == SYNC_BYTE
            && self.buffer[RTP_HEADER_LEN + TS_PACKET_SIZE] == SYNC_BYTE
            && self.buffer[RTP_HEADER_LEN + TS_PACKET_SIZE * 2] == SYNC_BYTE
    }

    /// Try to re-align the buffer on a TS packet boundary.
    ///
    /// Scans for three sync bytes at packet stride, moves the aligned tail
    /// to the front of the buffer and adjusts the write cursor. Returns
    /// false (and flushes the buffer) when no alignment exists; the caller
    /// must never interpret misaligned bytes as TS headers.
    pub fn try_syncing(&mut self) -> bool {
        if self.current_size() < TS_PACKET_SIZE * 3 {
            return false;
        }
        if self.is_synced() {
            return true;
        }
        let end = MAX_TS_PAYLOAD_SIZE + RTP_HEADER_LEN - TS_PACKET_SIZE * 2;
        for i in RTP_HEADER_LEN..end {
            if self.buffer[i] == SYNC_BYTE
                && self.buffer[i + TS_PACKET_SIZE] == SYNC_BYTE
                && self.buffer[i + TS_PACKET_SIZE * 2] == SYNC_BYTE
            {
                // found sync, move it to the begin of the buffer
                self.buffer
                    .copy_within(i..MAX_TS_PAYLOAD_SIZE + RTP_HEADER_LEN, RTP_HEADER_LEN);
                self.write_index -= i - RTP_HEADER_LEN;
                return true;
            }
        }
        // did not find a sync, so flush the buffer
        self.reset();
        false
    }

    /// TS payload capacity of this buffer.
    pub const fn buffer_size() -> usize {
        MAX_TS_PAYLOAD_SIZE
    }

    /// Bytes that still need to be written before the buffer is full.
    pub fn bytes_to_write(&self) -> usize {
        (MAX_TS_PAYLOAD_SIZE + RTP_HEADER_LEN) - self.write_index
    }

    /// Bytes of TS payload written so far.
    pub fn current_size(&self) -> usize {
        self.write_index - RTP_HEADER_LEN
    }

    /// Number of fully written TS packets.
    pub fn completed_packets(&self) -> usize {
        self.current_size() / TS_PACKET_SIZE
    }

    /// The producer's append window.
    pub fn write_slot(&mut self) -> &mut [u8] {
        &mut self.buffer[self.write_index..]
    }

    /// Advance the write cursor after the producer appended `count` bytes.
    pub fn add_written(&mut self, count: usize) {
        self.write_index += count;
    }

    /// All slots written.
    pub fn full(&self) -> bool {
        self.write_index == MAX_TS_PAYLOAD_SIZE + RTP_HEADER_LEN
    }

    /// The whole RTP datagram written so far, header included.
    pub fn read_buffer(&self) -> &[u8] {
        &self.buffer[..self.write_index]
    }

    /// The TS payload written so far, without the RTP header.
    pub fn ts_read_buffer(&self) -> &[u8] {
        &self.buffer[RTP_HEADER_LEN..self.write_index]
    }

    /// Mutable view of the TS payload area, for the descramble pass.
    pub fn ts_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[RTP_HEADER_LEN..self.write_index]
    }

    /// One TS packet slot, `number` in 0..NUMBER_OF_TS_PACKETS.
    pub fn ts_packet(&self, number: usize) -> &[u8] {
        let index = number * TS_PACKET_SIZE + RTP_HEADER_LEN;
        &self.buffer[index..index + TS_PACKET_SIZE]
    }

    pub fn ts_packet_mut(&mut self, number: usize) -> &mut [u8] {
        let index = number * TS_PACKET_SIZE + RTP_HEADER_LEN;
        &mut self.buffer[index..index + TS_PACKET_SIZE]
    }

    /// Flag that a descramble pass was requested for this buffer, so
    /// readiness must also check the scramble flags.
    pub fn set_decrypt_pending(&mut self) {
        self.decrypt_pending = true;
    }

    pub fn decrypt_pending(&self) -> bool {
        self.decrypt_pending
    }

    /// Check if this buffer is ready to be sent. When a decrypt pass is
    /// pending, every contained packet must have its scramble flag cleared.
    pub fn is_ready_to_send(&self) -> bool {
        let mut ready = self.full();
        if self.decrypt_pending && ready {
            for i in 0..NUMBER_OF_TS_PACKETS {
                ready &= self.ts_packet(i)[3] & 0x80 != 0x80;
            }
        }
        ready
    }

    /// Mark one TS packet for removal by [`purge`](Self::purge).
    /// Doomed packets are labeled 0xFF directly after the sync byte.
    pub fn mark_for_purging(&mut self, number: usize) {
        if number < NUMBER_OF_TS_PACKETS {
            self.ts_packet_mut(number)[1] = 0xFF;
            self.purge_pending += 1;
        }
    }

    /// Compact the buffer, dropping every packet marked for purging.
    pub fn purge(&mut self) {
        if self.purge_pending == 0 {
            return;
        }
        let completed = self.completed_packets();
        if self.purge_pending >= completed {
            self.reset();
            return;
        }
        let mut out = RTP_HEADER_LEN;
        for i in 0..completed {
            let start = RTP_HEADER_LEN + i * TS_PACKET_SIZE;
            if self.buffer[start + 1] == 0xFF {
                continue;
            }
            if out != start {
                self.buffer.copy_within(start..start + TS_PACKET_SIZE, out);
            }
            out += TS_PACKET_SIZE;
        }
        // a partially written packet at the tail moves along
        let tail_start = RTP_HEADER_LEN + completed * TS_PACKET_SIZE;
        let tail_len = self.write_index - tail_start;
        if tail_len > 0 {
            if out != tail_start {
                self.buffer.copy_within(tail_start..self.write_index, out);
            }
            out += tail_len;
        }
        self.write_index = out;
        self.purge_pending = 0;
    }

    /// Rewrite the mutable RTP header fields just before transmission.
    pub fn tag_rtp_header(&mut self, ssrc: u32, cseq: u16, timestamp: u32) {
        self.buffer[2..4].copy_from_slice(&cseq.to_be_bytes());
        self.buffer[4..8].copy_from_slice(&timestamp.to_be_bytes());
        self.buffer[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }
}
