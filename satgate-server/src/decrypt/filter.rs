//! Demux section filters for the decrypt client.

use std::collections::BTreeMap;

use bytes::Bytes;
use log::debug;
use satgate_mpegts::packet;
use satgate_mpegts::psi::TableCollector;

/// Filter condition length: the decrypt protocol carries 16 bytes of
/// match data and mask.
pub const FILTER_LENGTH: usize = 16;

struct EcmFilter {
    pid: u16,
    data: [u8; FILTER_LENGTH],
    mask: [u8; FILTER_LENGTH],
    collector: TableCollector,
}

impl EcmFilter {
    /// Match the masked filter condition against the start of a section.
    /// Filter byte 0 covers the table id; the 2-byte section length field
    /// is not part of the condition and is skipped, as the decrypt
    /// protocol defines it.
    fn matches(&self, section: &[u8]) -> bool {
        if section.len() < 3 {
            return false;
        }
        let section_length =
            (((usize::from(section[1]) & 0x0F) << 8) | usize::from(section[2])) + 3;
        let mut k = 0usize;
        for i in 0..FILTER_LENGTH {
            if k == 1 {
                k += 2; // skip the section length field
            }
            let mask = self.mask[i];
            if mask != 0 {
                if k >= section_length || k >= section.len() {
                    return false;
                }
                if (self.data[i] & mask) != (section[k] & mask) {
                    return false;
                }
            }
            k += 1;
        }
        true
    }
}

/// The table of active section filters, keyed by (demux, filter).
#[derive(Default)]
pub struct SectionFilters {
    filters: BTreeMap<(u32, u32), EcmFilter>,
}

impl SectionFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or replace) the filter `(demux, filter)` on a PID.
    pub fn start(&mut self, pid: u16, demux: u32, filter: u32, data: &[u8], mask: &[u8]) {
        let mut entry = EcmFilter {
            pid,
            data: [0; FILTER_LENGTH],
            mask: [0; FILTER_LENGTH],
            collector: TableCollector::new(),
        };
        let data_len = data.len().min(FILTER_LENGTH);
        entry.data[..data_len].copy_from_slice(&data[..data_len]);
        let mask_len = mask.len().min(FILTER_LENGTH);
        entry.mask[..mask_len].copy_from_slice(&mask[..mask_len]);

        debug!("Start filter PID {pid:04} for demux {demux} filter {filter}");
        self.filters.insert((demux, filter), entry);
    }

    /// Stop the filter `(demux, filter)`.
    pub fn stop(&mut self, demux: u32, filter: u32) {
        if self.filters.remove(&(demux, filter)).is_some() {
            debug!("Stop filter demux {demux} filter {filter}");
        }
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    /// Demux indexes that currently carry at least one filter.
    pub fn active_demuxes(&self) -> Vec<u32> {
        let mut demuxes: Vec<u32> = self.filters.keys().map(|&(demux, _)| demux).collect();
        demuxes.dedup();
        demuxes
    }

    /// PIDs filtered on one demux.
    pub fn active_filter_pids(&self, demux: u32) -> Vec<u16> {
        self.filters
            .iter()
            .filter(|((d, _), _)| *d == demux)
            .map(|(_, f)| f.pid)
            .collect()
    }

    /// Check if any filter wants this PID.
    pub fn wants_pid(&self, pid: u16) -> bool {
        self.filters.values().any(|f| f.pid == pid)
    }

    /// Feed one TS packet to the matching filter; returns
    /// `(demux, filter, section)` once that filter collected a complete
    /// section. The filter's collector resets afterwards so the next
    /// crypto period collects fresh.
    pub fn collect(&mut self, pid: u16, ts_packet: &[u8]) -> Option<(u32, u32, Bytes)> {
        for (&(demux, filter), entry) in &mut self.filters {
            if entry.pid != pid {
                continue;
            }
            if packet::payload_unit_start(ts_packet) {
                // section starts right after the pointer field
                let section = &ts_packet[5..];
                if !entry.matches(section) {
                    continue;
                }
                let table_id = ts_packet[5];
                entry.collector.clear();
                // private sections carry no CRC, collect them raw
                entry.collector.collect_data_raw(table_id, ts_packet);
            } else if entry.collector.current_size() > 0 {
                let table_id = entry
                    .collector
                    .section(0)
                    .map(|s| s.table_id)
                    .unwrap_or(ts_packet[5]);
                entry.collector.collect_data_raw(table_id, ts_packet);
            } else {
                continue;
            }
            if entry.collector.is_collected() {
                let section = entry.collector.section_bytes(0);
                entry.collector.clear();
                return Some((demux, filter, section));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One payload-start TS packet carrying a 32-byte private section.
    fn ecm_packet(pid: u16, table_id: u8) -> [u8; 188] {
        let mut packet = [0xA5u8; 188];
        packet[0] = 0x47;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        packet[2] = pid as u8;
        packet[3] = 0x10;
        packet[4] = 0x00; // pointer field
        packet[5] = table_id;
        packet[6] = 0x70; // private syntax, section length 0x020
        packet[7] = 0x20;
        packet
    }

    #[test]
    fn filter_lifecycle() {
        let mut filters = SectionFilters::new();
        filters.start(0x123, 0, 1, &[0x80], &[0xFE]);
        filters.start(0x124, 1, 0, &[0x80], &[0xFF]);
        assert!(filters.wants_pid(0x123));
        assert_eq!(filters.active_demuxes(), vec![0, 1]);
        assert_eq!(filters.active_filter_pids(0), vec![0x123]);

        filters.stop(0, 1);
        assert!(!filters.wants_pid(0x123));
    }

    #[test]
    fn matching_section_is_collected_and_returned() {
        let packet = ecm_packet(0x123, 0x80);

        let mut filters = SectionFilters::new();
        filters.start(0x123, 0, 2, &[0x80], &[0xFF]);

        let collected = filters.collect(0x123, &packet);
        let (demux, filter, section) = collected.expect("section collected");
        assert_eq!((demux, filter), (0, 2));
        assert_eq!(section[5], 0x80);

        // the collector reset: the same packet collects again
        assert!(filters.collect(0x123, &packet).is_some());
    }

    #[test]
    fn either_parity_matches_through_the_mask() {
        // 0xFE mask accepts both ECM table ids, 0x80 and 0x81
        let mut filters = SectionFilters::new();
        filters.start(0x123, 0, 0, &[0x80], &[0xFE]);
        assert!(filters.collect(0x123, &ecm_packet(0x123, 0x80)).is_some());
        assert!(filters.collect(0x123, &ecm_packet(0x123, 0x81)).is_some());
    }

    #[test]
    fn mask_mismatch_is_ignored() {
        let mut filters = SectionFilters::new();
        // require an ECM table id, a PAT-shaped section cannot match
        filters.start(0x123, 0, 2, &[0x80], &[0xFF]);
        assert!(filters.collect(0x123, &ecm_packet(0x123, 0x00)).is_none());
    }

    #[test]
    fn other_pids_are_not_touched() {
        let mut filters = SectionFilters::new();
        filters.start(0x200, 0, 0, &[0x80], &[0xFF]);
        assert!(filters.collect(0x123, &ecm_packet(0x123, 0x80)).is_none());
    }
}
