//! The per-buffer descramble pass.
//!
//! Walks the completed packets of one ring slot, queues scrambled payload
//! into the batch and flushes it through the engine on parity change
//! (a final batch, the outgoing key's crypto period ended) or when the
//! batch is full. Packets scrambled under a parity with no queued key are
//! rewritten to null packets with the scramble bits cleared; the stream
//! keeps flowing.

use log::debug;
use satgate_mpegts::packet::{self, NULL_PID, SYNC_BYTE};
use satgate_mpegts::PacketBuffer;

use crate::batch::{BatchEntry, DescrambleBatch};
use crate::engine::CsaEngine;
use crate::keys::Keys;
use crate::{ControlWord, Parity};

pub struct Descrambler {
    engine: Box<dyn CsaEngine + Send>,
    keys: Keys,
    batch: DescrambleBatch,
}

impl Descrambler {
    pub fn new(engine: Box<dyn CsaEngine + Send>) -> Self {
        let max = engine.max_batch_size();
        Self {
            engine,
            keys: Keys::new(),
            batch: DescrambleBatch::new(max),
        }
    }

    /// Enqueue a control word delivered by the decrypt client.
    pub fn set_key(&mut self, cw: ControlWord, parity: Parity, index: usize, is_final: bool) {
        self.keys.set(cw, parity, index, is_final);
    }

    /// The active key for a parity, if any.
    pub fn has_key(&self, parity: Parity) -> bool {
        self.keys.get(parity).is_some()
    }

    /// Drop all keys and the pending batch, e.g. on channel change or
    /// decrypt client disconnect.
    pub fn stop(&mut self) {
        debug!("Clearing descrambler keys and batch");
        self.keys.clear();
        self.batch.clear();
    }

    pub fn batch_count(&self) -> usize {
        self.batch.count()
    }

    pub fn batch_parity(&self) -> Parity {
        self.batch.parity()
    }

    /// Run the descramble pass over every completed packet of `buffer`.
    pub fn process(&mut self, buffer: &mut PacketBuffer) {
        let completed = buffer.completed_packets();
        for number in 0..completed {
            let data = buffer.ts_packet(number);
            // must start with a sync byte and carry no transport error
            if data[0] != SYNC_BYTE || packet::transport_error(data) {
                continue;
            }
            let pid = packet::pid(data);
            if !packet::is_scrambled(data) || pid >= NULL_PID {
                continue;
            }
            let parity = Parity::from_odd_bit(packet::scrambling_parity(data));

            // flush on a parity change inside the batch (the outgoing key
            // will not be needed again) or when the batch is full
            if !self.batch.is_empty() && (parity != self.batch.parity() || self.batch.is_full()) {
                let rollover = parity != self.batch.parity();
                if rollover {
                    debug!(
                        "PID {pid:04}: parity changed from {} to {parity}, decrypting batch of {}",
                        self.batch.parity(),
                        self.batch.count()
                    );
                }
                self.decrypt_batch(buffer, rollover);
            }

            if self.has_key(parity) {
                let offset = packet::payload_offset(buffer.ts_packet(number));
                self.batch.push(
                    BatchEntry {
                        packet: number,
                        offset,
                        len: packet::TS_PACKET_SIZE - offset,
                    },
                    parity,
                );
                // readiness now requires the scramble bits to clear
                buffer.set_decrypt_pending();
            } else {
                // no key yet: degrade to a null packet the client ignores
                let data = buffer.ts_packet_mut(number);
                packet::set_null_pid(data);
                packet::clear_scrambled(data);
            }
        }
        if buffer.full() && !self.batch.is_empty() {
            self.decrypt_batch(buffer, false);
        }
    }

    /// Decrypt the queued batch in place.
    ///
    /// With a key queued for the batch parity the engine runs once over
    /// all queued windows and every batched packet's scramble bits are
    /// cleared; a `final` batch additionally evicts the consumed key.
    /// Without a key every queued packet is rewritten to the null PID,
    /// scramble bits cleared as well. Either way the batch resets to
    /// empty.
    pub fn decrypt_batch(&mut self, buffer: &mut PacketBuffer, is_final: bool) {
        let parity = self.batch.parity();
        if let Some(cw) = self.keys.get(parity) {
            let windows: Vec<(usize, usize)> = self
                .batch
                .entries()
                .iter()
                .map(BatchEntry::window)
                .collect();
            self.engine.decrypt(cw, buffer.ts_buffer_mut(), &windows);

            // clear the scramble flags, so the buffer can be sent
            for entry in self.batch.entries() {
                packet::clear_scrambled(buffer.ts_packet_mut(entry.packet));
            }
            if is_final {
                self.keys.remove(parity);
            }
        } else {
            for entry in self.batch.entries() {
                let data = buffer.ts_packet_mut(entry.packet);
                // mark decrypt failed by setting the null packet PID
                packet::set_null_pid(data);
                packet::clear_scrambled(data);
            }
        }
        self.batch.clear();
    }
}
