//! Program Association Table.
//!
//! The PAT maps program numbers to the PIDs carrying their PMT sections;
//! program number zero points at the NIT instead.

use std::collections::BTreeMap;

use log::info;

use crate::psi::section::TableCollector;
use crate::psi::PAT_TABLE_ID;

#[derive(Debug, Default)]
pub struct Pat {
    collector: TableCollector,
    transport_stream_id: u16,
    nit_pid: Option<u16>,
    /// PMT PID -> program number
    pmt_pid_table: BTreeMap<u16, u16>,
    parsed: bool,
}

impl Pat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.transport_stream_id = 0;
        self.nit_pid = None;
        self.pmt_pid_table.clear();
        self.parsed = false;
        self.collector.clear();
    }

    /// Feed one TS packet from PID 0. Parses the table once all sections
    /// are in.
    pub fn collect_data(&mut self, packet: &[u8]) {
        if self.is_collected() {
            return;
        }
        self.collector.collect_data(PAT_TABLE_ID, packet);
        if self.collector.is_collected() {
            self.parse();
        }
    }

    pub fn is_collected(&self) -> bool {
        self.parsed
    }

    fn parse(&mut self) {
        let Some(section) = self.collector.section(0) else {
            return;
        };
        let data = &section.data;
        self.transport_stream_id = (u16::from(data[8]) << 8) | u16::from(data[9]);

        info!(
            "PAT: Section Length: {}  TSID: {}  Version: {}  secNr: {} lastSecNr: {}  CRC: {:08X}",
            section.section_length,
            self.transport_stream_id,
            section.version,
            section.sec_nr,
            section.last_sec_nr,
            section.crc
        );

        // 4 = CRC  5 = PAT table begin from section length
        let len = section.section_length.saturating_sub(4 + 5);
        let ptr = &data[13..];
        for i in (0..len).step_by(4) {
            let program = (u16::from(ptr[i]) << 8) | u16::from(ptr[i + 1]);
            let pid = ((u16::from(ptr[i + 2]) & 0x1F) << 8) | u16::from(ptr[i + 3]);
            if program == 0 {
                info!("PAT: Prog NR: {program:5}  NIT PID: {pid:04}");
                self.nit_pid = Some(pid);
            } else {
                info!("PAT: Prog NR: {program:5}  PMT PID: {pid:04}");
                self.pmt_pid_table.insert(pid, program);
            }
        }
        self.parsed = true;
    }

    /// Check if this PID was announced as a PMT PID.
    pub fn is_marked_as_pmt(&self, pid: u16) -> bool {
        self.pmt_pid_table.contains_key(&pid)
    }

    /// All announced PMT PIDs with their program numbers.
    pub fn pmt_pids(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.pmt_pid_table.iter().map(|(&pid, &program)| (pid, program))
    }

    pub fn nit_pid(&self) -> Option<u16> {
        self.nit_pid
    }

    pub fn transport_stream_id(&self) -> u16 {
        self.transport_stream_id
    }
}
