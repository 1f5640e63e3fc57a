//! The PID filtering policy for one stream.
//!
//! Composes the [`PidTable`] with the PSI collectors: every received TS
//! packet runs through [`Filter::filter_data`], which accounts the PID,
//! feeds the table assemblers and, under software filtering, decides
//! whether the packet should be purged from the send buffer. The demux
//! hardware is only ever touched from [`Filter::update_pid_filters`]
//! through the supplied callbacks.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::packet;
use crate::pid_table::{PidTable, ALL_PIDS, MAX_PIDS};
use crate::psi::{Nit, Pat, Pmt, Sdt, NIT_PID, PAT_PID, SDT_PID};

/// Tracks the program clock reference of the active program; the delta
/// between consecutive PCR samples can drive the send pacing.
#[derive(Debug, Default)]
pub struct Pcr {
    prev: u64,
    delta: i64,
}

impl Pcr {
    /// Check for the adaptation field and PCR flags.
    pub fn is_pcr_packet(data: &[u8]) -> bool {
        data[3] & 0x20 == 0x20 && data[5] & 0x10 == 0x10
    }

    /// Sample the 90 kHz PCR base and update the clamped delta.
    pub fn collect_data(&mut self, data: &[u8]) {
        if !Self::is_pcr_packet(data) {
            return;
        }
        let base = (u64::from(data[6]) << 25)
            | (u64::from(data[7]) << 17)
            | (u64::from(data[8]) << 9)
            | (u64::from(data[9]) << 1)
            | (u64::from(data[10]) >> 7);
        let mut delta = base as i64 - self.prev as i64;
        self.prev = base;
        if delta < 0 {
            delta = 1;
        }
        if delta > 75_000 {
            delta = 75_000;
        }
        // PCR base runs at 90 kHz
        self.delta = delta * 11;
    }

    /// Microseconds between the last two PCR samples, clamped.
    pub fn delta(&self) -> i64 {
        self.delta
    }

    pub fn clear_delta(&mut self) {
        self.delta = 0;
    }
}

/// PID filtering state for one stream: PID table, table collectors and
/// the active-program bookkeeping.
#[derive(Default)]
pub struct Filter {
    pid_table: PidTable,
    pat: Pat,
    sdt: Sdt,
    nit: Nit,
    pcr: Pcr,
    /// PMT collectors keyed by the PMT PID the PAT announced.
    pmts: BTreeMap<u16, Pmt>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all collected tables and PID state.
    pub fn clear(&mut self) {
        info!("Clearing PAT/PMT/SDT/NIT tables...");
        self.pat.clear();
        self.sdt.clear();
        self.nit.clear();
        self.pcr.clear_delta();
        self.pmts.clear();
        self.pid_table.clear();
    }

    pub fn pid_table(&self) -> &PidTable {
        &self.pid_table
    }

    pub fn pid_table_mut(&mut self) -> &mut PidTable {
        &mut self.pid_table
    }

    /// Open or close a batch of PIDs from a client request.
    ///
    /// `all` and `none` first deselect every PID; `all` then raises the
    /// promiscuous sentinel. A normal comma separated list opens (or
    /// closes, when `add` is false) each listed PID; an add request
    /// implies PID 0 so the PAT keeps flowing.
    pub fn parse_pid_string(&mut self, pids: &str, clear_pids_first: bool, add: bool) {
        if pids == "all" || pids == "none" {
            // all/none pids requested, so remove all used PIDs
            for pid in 0..MAX_PIDS {
                self.pid_table.set_pid(pid, false);
            }
            if pids == "all" {
                self.pid_table.set_pid(ALL_PIDS, add);
            }
            return;
        }
        if clear_pids_first {
            for pid in 0..MAX_PIDS {
                self.pid_table.set_pid(pid, false);
            }
        }
        for part in pids.split(',') {
            if let Ok(pid) = part.trim().parse::<usize>() {
                if pid < MAX_PIDS {
                    self.pid_table.set_pid(pid, add);
                }
            }
        }
        // always request PID 0 - Program Association Table (PAT)
        if add && !self.pid_table.is_wanted(0) {
            self.pid_table.set_pid(0, true);
        }
    }

    /// Inspect one received TS packet.
    ///
    /// Accounts the PID, feeds the PAT/PMT/SDT/NIT/PCR assemblers, and
    /// returns whether the packet should be kept. With
    /// `software_filter_enabled` a packet whose PID is not part of the
    /// table-driven selection is reported for purging.
    pub fn filter_data(&mut self, data: &[u8], software_filter_enabled: bool) -> bool {
        let pid = packet::pid(data);
        self.pid_table.add_pid_data(pid, data[3]);

        match pid {
            PAT_PID => {
                if !self.pat.is_collected() {
                    self.pat.collect_data(data);
                    if self.pat.is_collected() {
                        // request the announced PMT PIDs so the program
                        // tables can be collected as well
                        let pmt_pids: Vec<u16> = self.pat.pmt_pids().map(|(pid, _)| pid).collect();
                        for pmt_pid in pmt_pids {
                            self.pmts.entry(pmt_pid).or_default();
                        }
                    }
                }
            }
            SDT_PID => {
                if !self.sdt.is_collected() {
                    self.sdt.collect_data(data);
                }
            }
            NIT_PID => {
                if !self.nit.is_collected() {
                    self.nit.collect_data(data);
                }
            }
            _ => {
                if let Some(pmt) = self.pmts.get_mut(&pid) {
                    if !pmt.is_collected() {
                        pmt.collect_data(data);
                    }
                } else if self.is_active_pcr_pid(pid) {
                    self.pcr.collect_data(data);
                }
            }
        }

        if software_filter_enabled && !self.wants_pid(pid) {
            debug!("PID {pid:04} not selected, marking packet for purge");
            return false;
        }
        true
    }

    /// Table-driven selection: a PID is kept when all PIDs were requested
    /// or it is anywhere on the open side of the PID lifecycle.
    fn wants_pid(&self, pid: u16) -> bool {
        self.pid_table.all_pids_wanted() || self.pid_table.is_wanted(usize::from(pid))
    }

    fn is_active_pcr_pid(&self, pid: u16) -> bool {
        self.pmts
            .values()
            .any(|pmt| pmt.is_collected() && pmt.pcr_pid() == pid)
    }

    /// Walk every PID whose state changed since the last pass and drive
    /// the hardware demultiplexer through the supplied callbacks.
    ///
    /// The change set is drained first, the callbacks run without any
    /// table borrow held (they may block on real I/O), and the results
    /// are committed afterwards. An open failure leaves the PID in
    /// ShouldOpen so the next pass retries it.
    pub fn update_pid_filters<O, C>(&mut self, mut open_pid: O, mut close_pid: C)
    where
        O: FnMut(u16) -> bool,
        C: FnMut(u16) -> bool,
    {
        if !self.pid_table.has_changed() {
            return;
        }
        self.pid_table.reset_changed();
        info!("Updating PID filters...");

        let to_close: Vec<u16> = (0..MAX_PIDS as u16)
            .filter(|&pid| self.pid_table.should_close(usize::from(pid)))
            .collect();
        let to_open: Vec<u16> = (0..MAX_PIDS as u16)
            .filter(|&pid| self.pid_table.should_open(usize::from(pid)))
            .collect();

        for pid in to_close {
            if close_pid(pid) {
                debug!(
                    "Remove filter PID: {pid:04} - Packet Count: {}",
                    self.pid_table.packet_count(pid)
                );
                self.pid_table.set_pid_closed(usize::from(pid));
            }
        }
        for pid in to_open {
            if open_pid(pid) {
                debug!(
                    "Set filter PID: {pid:04}{}",
                    if self.is_marked_as_pmt(pid) { " - PMT" } else { "" }
                );
                self.pid_table.set_pid_opened(usize::from(pid));
            } else {
                debug!("Set filter PID: {pid:04} failed, retrying on next update");
            }
        }
    }

    pub fn is_marked_as_pmt(&self, pid: u16) -> bool {
        self.pat.is_marked_as_pmt(pid)
    }

    /// Check if this PMT PID belongs to the program that is actually
    /// being streamed: its PCR PID is open and carried packets. A single
    /// transponder can multiplex several programs; only one is live.
    pub fn is_marked_as_active_pmt(&self, pid: u16) -> bool {
        self.pmts.get(&pid).is_some_and(|pmt| {
            pmt.is_collected()
                && self.pid_table.is_opened(usize::from(pmt.pcr_pid()))
                && self.pid_table.packet_count(pmt.pcr_pid()) > 0
        })
    }

    /// The PMT of the currently live program, if any.
    pub fn active_pmt(&self) -> Option<&Pmt> {
        self.pmts
            .iter()
            .find(|(&pid, _)| self.is_marked_as_active_pmt(pid))
            .map(|(_, pmt)| pmt)
    }

    /// Mutable access, e.g. for the one-shot send towards the decrypt client.
    pub fn active_pmt_mut(&mut self) -> Option<&mut Pmt> {
        let pid = self
            .pmts
            .keys()
            .copied()
            .find(|&pid| self.is_marked_as_active_pmt(pid))?;
        self.pmts.get_mut(&pid)
    }

    pub fn pat(&self) -> &Pat {
        &self.pat
    }

    pub fn sdt(&self) -> &Sdt {
        &self.sdt
    }

    pub fn nit(&self) -> &Nit {
        &self.nit
    }

    pub fn pcr(&self) -> &Pcr {
        &self.pcr
    }

    pub fn pcr_mut(&mut self) -> &mut Pcr {
        &mut self.pcr
    }

    /// The `pids=` attribute value for the SAT>IP description string.
    pub fn pid_csv(&self) -> String {
        self.pid_table.pid_csv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::test_support::{pat_body, section_packets};
    use crate::psi::pmt::test_support::pmt_body;
    use crate::psi::{PAT_TABLE_ID, PMT_TABLE_ID};

    fn collect_pat_and_pmt(filter: &mut Filter) {
        for packet in section_packets(PAT_TABLE_ID, 0, &pat_body(&[(1, 0x100)]), 0) {
            filter.filter_data(&packet, false);
        }
        for packet in section_packets(PMT_TABLE_ID, 0x100, &pmt_body(0x1FF, 0x201, None), 0) {
            filter.filter_data(&packet, false);
        }
    }

    fn pcr_packet(pid: u16, base: u32) -> [u8; 188] {
        let mut data = [0xFFu8; 188];
        data[0] = 0x47;
        data[1] = (pid >> 8) as u8 & 0x1F;
        data[2] = pid as u8;
        data[3] = 0x20; // adaptation field only
        data[4] = 183; // adaptation field length
        data[5] = 0x10; // PCR flag
        data[6..10].copy_from_slice(&base.to_be_bytes());
        data[10] = 0;
        data[11] = 0;
        data
    }

    #[test]
    fn pid_string_round_trip() {
        let mut filter = Filter::new();
        filter.parse_pid_string("0,100,200", false, true);
        assert!(filter.pid_table().is_wanted(100));
        assert!(filter.pid_table().is_wanted(200));
        assert_eq!(filter.pid_csv(), "0,100,200");

        filter.parse_pid_string("200", false, false);
        assert!(!filter.pid_table().is_wanted(200));
        assert_eq!(filter.pid_csv(), "0,100");
    }

    #[test]
    fn add_request_implies_pat() {
        let mut filter = Filter::new();
        filter.parse_pid_string("100", false, true);
        assert!(filter.pid_table().is_wanted(0));
    }

    #[test]
    fn all_token_raises_promiscuous_mode() {
        let mut filter = Filter::new();
        filter.parse_pid_string("100", false, true);
        filter.parse_pid_string("all", false, true);
        assert!(filter.pid_table().all_pids_wanted());
        assert!(!filter.pid_table().is_wanted(100));
        assert_eq!(filter.pid_csv(), "all");
    }

    #[test]
    fn software_filter_reports_unselected_pids() {
        let mut filter = Filter::new();
        filter.parse_pid_string("0", false, true);

        let mut unwanted = [0xFFu8; 188];
        unwanted[0] = 0x47;
        unwanted[1] = 0x02;
        unwanted[2] = 0x00; // PID 0x200
        unwanted[3] = 0x10;
        assert!(!filter.filter_data(&unwanted, true));
        assert!(filter.filter_data(&unwanted, false));
    }

    #[test]
    fn pat_collection_registers_pmt_collectors() {
        let mut filter = Filter::new();
        collect_pat_and_pmt(&mut filter);
        assert!(filter.pat().is_collected());
        assert!(filter.is_marked_as_pmt(0x100));
        assert!(filter.pmts.get(&0x100).is_some_and(Pmt::is_collected));
    }

    #[test]
    fn active_pmt_needs_open_pcr_pid_with_traffic() {
        let mut filter = Filter::new();
        collect_pat_and_pmt(&mut filter);
        assert!(!filter.is_marked_as_active_pmt(0x100));

        // open the PCR PID and let a packet through
        filter.pid_table_mut().set_pid(0x1FF, true);
        filter.update_pid_filters(|_| true, |_| true);
        assert!(!filter.is_marked_as_active_pmt(0x100));

        filter.filter_data(&pcr_packet(0x1FF, 100), false);
        assert!(filter.is_marked_as_active_pmt(0x100));
        assert_eq!(filter.active_pmt().map(Pmt::program_number), Some(1));
    }

    #[test]
    fn update_pid_filters_drives_callbacks() {
        let mut filter = Filter::new();
        filter.parse_pid_string("0,100", false, true);

        let mut opened = Vec::new();
        filter.update_pid_filters(
            |pid| {
                opened.push(pid);
                true
            },
            |_| true,
        );
        assert_eq!(opened, vec![0, 100]);
        assert!(filter.pid_table().is_opened(0));
        assert!(!filter.pid_table().has_changed());

        // closing runs the close callback and resets counters
        filter.parse_pid_string("100", false, false);
        let mut closed = Vec::new();
        filter.update_pid_filters(|_| true, |pid| {
            closed.push(pid);
            true
        });
        assert_eq!(closed, vec![100]);
        assert!(!filter.pid_table().is_opened(100));
    }

    #[test]
    fn failed_open_is_retried_next_pass() {
        let mut filter = Filter::new();
        filter.parse_pid_string("100", true, true);

        filter.update_pid_filters(|_| false, |_| true);
        assert!(filter.pid_table().should_open(0));
        assert!(filter.pid_table().should_open(100));

        // flag another change so the next pass runs
        filter.pid_table_mut().set_pid(101, true);
        let mut opened = Vec::new();
        filter.update_pid_filters(
            |pid| {
                opened.push(pid);
                true
            },
            |_| true,
        );
        assert_eq!(opened, vec![0, 100, 101]);
    }

    #[test]
    fn pcr_delta_is_sampled_for_collected_programs() {
        let mut filter = Filter::new();
        collect_pat_and_pmt(&mut filter);
        filter.filter_data(&pcr_packet(0x1FF, 100), false);
        filter.filter_data(&pcr_packet(0x1FF, 9100), false);
        assert_eq!(filter.pcr().delta(), 9000 * 2 * 11);
    }
}
