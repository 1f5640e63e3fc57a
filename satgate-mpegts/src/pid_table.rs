//! Per-PID state and continuity accounting.
//!
//! The table carries one entry per possible PID plus a sentinel entry
//! meaning "all PIDs" (promiscuous mode). State transitions never touch
//! hardware: the demux open/close callbacks are driven by
//! [`Filter::update_pid_filters`](crate::filter::Filter::update_pid_filters).

use log::debug;

/// Number of table entries: 8192 PIDs plus the all-PIDs sentinel.
pub const MAX_PIDS: usize = 8193;

/// Sentinel index meaning "all PIDs requested".
pub const ALL_PIDS: usize = 8192;

/// Continuity counter value meaning "no sample seen yet".
const CC_UNSET: u8 = 0x80;

/// Lifecycle of one PID against the hardware demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    /// Requested, waiting for the demux open callback to succeed.
    ShouldOpen,
    /// Open on the demultiplexer.
    Opened,
    /// Deselected, waiting for the demux close callback.
    ShouldClose,
    /// Deselected and re-requested before the close ran: close, then open.
    ShouldCloseReopen,
    /// Not requested.
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct PidEntry {
    state: PidState,
    /// continuity counter (0 - 15) of this PID, CC_UNSET until sampled
    cc: u8,
    cc_error: u32,
    count: u32,
}

impl PidEntry {
    const fn new() -> Self {
        Self {
            state: PidState::Closed,
            cc: CC_UNSET,
            cc_error: 0,
            count: 0,
        }
    }

    fn reset_counters(&mut self) {
        self.cc = CC_UNSET;
        self.cc_error = 0;
        self.count = 0;
    }
}

/// The PID and demux bookkeeping for one stream.
pub struct PidTable {
    changed: bool,
    total_cc_errors: u32,
    data: Vec<PidEntry>,
}

impl Default for PidTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PidTable {
    pub fn new() -> Self {
        Self {
            changed: false,
            total_cc_errors: 0,
            data: vec![PidEntry::new(); MAX_PIDS],
        }
    }

    /// Forget every PID and all counters.
    pub fn clear(&mut self) {
        self.changed = false;
        self.total_cc_errors = 0;
        for entry in &mut self.data {
            entry.state = PidState::Closed;
            entry.reset_counters();
        }
    }

    /// Record the desired membership of a PID. Flips the state towards
    /// open or close depending on where the PID currently is; hardware is
    /// only touched later, from the update pass.
    pub fn set_pid(&mut self, pid: usize, wanted: bool) {
        let entry = &mut self.data[pid];
        entry.state = if wanted {
            match entry.state {
                PidState::Closed => PidState::ShouldOpen,
                PidState::ShouldClose => PidState::ShouldCloseReopen,
                state => state,
            }
        } else {
            match entry.state {
                PidState::Opened => PidState::ShouldClose,
                PidState::ShouldCloseReopen => PidState::ShouldClose,
                // never hit hardware, so simply forget the request
                PidState::ShouldOpen => PidState::Closed,
                state => state,
            }
        };
        self.changed = true;
    }

    /// Request or drop promiscuous mode.
    pub fn set_all_pids(&mut self, wanted: bool) {
        self.set_pid(ALL_PIDS, wanted);
    }

    pub fn state(&self, pid: usize) -> PidState {
        self.data[pid].state
    }

    /// A PID counts as requested while it is anywhere on the open side of
    /// the lifecycle.
    pub fn is_wanted(&self, pid: usize) -> bool {
        matches!(
            self.data[pid].state,
            PidState::ShouldOpen | PidState::Opened | PidState::ShouldCloseReopen
        )
    }

    /// Check if all PIDs were requested (promiscuous mode).
    pub fn all_pids_wanted(&self) -> bool {
        self.is_wanted(ALL_PIDS)
    }

    pub fn should_open(&self, pid: usize) -> bool {
        self.data[pid].state == PidState::ShouldOpen
    }

    pub fn should_close(&self, pid: usize) -> bool {
        matches!(
            self.data[pid].state,
            PidState::ShouldClose | PidState::ShouldCloseReopen
        )
    }

    pub fn is_opened(&self, pid: usize) -> bool {
        self.data[pid].state == PidState::Opened
    }

    /// Mark a PID opened, only after the demux open callback succeeded.
    pub fn set_pid_opened(&mut self, pid: usize) {
        self.data[pid].state = PidState::Opened;
    }

    /// Mark a PID closed after the demux close callback ran. Counters are
    /// reset; a close-reopen request moves straight back to ShouldOpen.
    pub fn set_pid_closed(&mut self, pid: usize) {
        let reopen = self.data[pid].state == PidState::ShouldCloseReopen;
        self.data[pid].reset_counters();
        self.data[pid].state = if reopen {
            self.changed = true;
            PidState::ShouldOpen
        } else {
            PidState::Closed
        };
    }

    /// Check if any PID state changed since the last update pass.
    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Clear the changed flag once the update pass runs.
    pub fn reset_changed(&mut self) {
        self.changed = false;
    }

    /// Account one received packet for a PID. The continuity counter is
    /// only checked when the adaptation field control announces a payload;
    /// a gap of `d` (mod 16) adds `d` to the per-PID and stream-wide
    /// error tallies.
    pub fn add_pid_data(&mut self, pid: u16, header_flags: u8) {
        let entry = &mut self.data[usize::from(pid)];
        entry.count += 1;
        if header_flags & 0x10 != 0x10 {
            // no payload, the counter does not advance
            return;
        }
        let cc = header_flags & 0x0F;
        if entry.cc == CC_UNSET {
            entry.cc = cc;
        } else {
            let expected = (entry.cc + 1) % 0x10;
            if expected != cc {
                let diff = (i32::from(cc) - i32::from(expected)).rem_euclid(0x10) as u32;
                entry.cc_error += diff;
                self.total_cc_errors += diff;
                debug!(
                    "PID {pid}: continuity gap of {diff} (expected {expected}, got {cc})"
                );
            }
            entry.cc = cc;
        }
    }

    /// Number of packets received for this PID.
    pub fn packet_count(&self, pid: u16) -> u32 {
        self.data[usize::from(pid)].count
    }

    /// Continuity errors accumulated on this PID.
    pub fn cc_errors(&self, pid: u16) -> u32 {
        self.data[usize::from(pid)].cc_error
    }

    /// Continuity errors accumulated across the whole stream.
    pub fn total_cc_errors(&self) -> u32 {
        self.total_cc_errors
    }

    /// Render the requested PIDs for the SAT>IP attribute description
    /// string: the literal `all` in promiscuous mode, a comma separated
    /// list otherwise, a single space when nothing is requested.
    pub fn pid_csv(&self) -> String {
        if self.all_pids_wanted() {
            return "all".to_string();
        }
        let csv = (0..ALL_PIDS)
            .filter(|&pid| self.is_wanted(pid))
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        if csv.is_empty() {
            " ".to_string()
        } else {
            csv
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Payload flag plus a continuity counter, as found in TS header byte 3.
    fn payload_cc(cc: u8) -> u8 {
        0x10 | cc
    }

    #[test]
    fn first_sample_never_counts_as_error() {
        let mut table = PidTable::new();
        table.add_pid_data(100, payload_cc(9));
        assert_eq!(table.cc_errors(100), 0);
        assert_eq!(table.packet_count(100), 1);
    }

    #[test]
    fn cc_gap_accumulates_forward_distance() {
        let mut table = PidTable::new();
        for cc in [0, 1, 2] {
            table.add_pid_data(100, payload_cc(cc));
        }
        assert_eq!(table.cc_errors(100), 0);

        // skip 3 and 4
        table.add_pid_data(100, payload_cc(5));
        assert_eq!(table.cc_errors(100), 2);
        assert_eq!(table.total_cc_errors(), 2);

        // wraps around modulo 16: after 5 comes 6, getting 4 is 14 ahead
        table.add_pid_data(100, payload_cc(4));
        assert_eq!(table.cc_errors(100), 16);
    }

    #[test]
    fn cc_sequence_matches_sum_of_forward_distances() {
        let samples = [3u8, 4, 5, 9, 10, 0, 1];
        let mut expected_errors = 0u32;
        let mut prev: Option<u8> = None;
        for &cc in &samples {
            if let Some(p) = prev {
                expected_errors +=
                    u32::from((i32::from(cc) - i32::from((p + 1) % 16)).rem_euclid(16) as u8);
            }
            prev = Some(cc);
        }

        let mut table = PidTable::new();
        for &cc in &samples {
            table.add_pid_data(42, payload_cc(cc));
        }
        assert_eq!(table.cc_errors(42), expected_errors);
    }

    #[test]
    fn adaptation_only_packets_do_not_advance_cc() {
        let mut table = PidTable::new();
        table.add_pid_data(7, payload_cc(2));
        // adaptation field only, counter repeats legally
        table.add_pid_data(7, 0x20 | 2);
        table.add_pid_data(7, payload_cc(3));
        assert_eq!(table.cc_errors(7), 0);
        assert_eq!(table.packet_count(7), 3);
    }

    #[test]
    fn open_close_lifecycle() {
        let mut table = PidTable::new();
        table.set_pid(100, true);
        assert!(table.should_open(100));
        assert!(table.has_changed());

        table.set_pid_opened(100);
        assert!(table.is_opened(100));

        table.set_pid(100, false);
        assert!(table.should_close(100));

        // re-request before the close ran: close then reopen
        table.set_pid(100, true);
        assert_eq!(table.state(100), PidState::ShouldCloseReopen);

        table.add_pid_data(100, payload_cc(1));
        table.set_pid_closed(100);
        assert_eq!(table.state(100), PidState::ShouldOpen);
        assert_eq!(table.packet_count(100), 0);
    }

    #[test]
    fn deselect_before_open_skips_hardware() {
        let mut table = PidTable::new();
        table.set_pid(200, true);
        table.set_pid(200, false);
        assert_eq!(table.state(200), PidState::Closed);
    }

    #[test]
    fn csv_rendering() {
        let mut table = PidTable::new();
        assert_eq!(table.pid_csv(), " ");

        table.set_pid(0, true);
        table.set_pid(100, true);
        table.set_pid(101, true);
        assert_eq!(table.pid_csv(), "0,100,101");

        table.set_all_pids(true);
        assert_eq!(table.pid_csv(), "all");
    }
}
