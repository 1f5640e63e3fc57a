//! Program Map Table.
//!
//! Besides the PCR PID and the elementary stream list, the parser captures
//! every CA descriptor (tag 0x09) verbatim into a program-info blob. That
//! blob is handed to the external decrypt client to build CA_PMT messages,
//! so its byte layout (tag, CAID, ECM PID with the top 3 bits masked,
//! PROVID likewise) must not be touched.

use bytes::Bytes;
use log::info;

use crate::packet::{self, TS_PACKET_SIZE};
use crate::psi::section::{calculate_crc32, TableCollector};
use crate::psi::PMT_TABLE_ID;

/// One CA descriptor found in the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcmData {
    pub caid: u16,
    pub ecm_pid: u16,
    pub provid: u16,
}

#[derive(Debug, Default)]
pub struct Pmt {
    collector: TableCollector,
    program_number: u16,
    pcr_pid: u16,
    prg_length: usize,
    elementary_pids: Vec<u16>,
    ecm_pids: Vec<EcmData>,
    prog_info: Vec<u8>,
    parsed: bool,
    sent: bool,
}

impl Pmt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.program_number = 0;
        self.pcr_pid = 0;
        self.prg_length = 0;
        self.elementary_pids.clear();
        self.ecm_pids.clear();
        self.prog_info.clear();
        self.parsed = false;
        self.sent = false;
        self.collector.clear();
    }

    /// Feed one TS packet from this program's PMT PID.
    pub fn collect_data(&mut self, packet: &[u8]) {
        if self.is_collected() {
            return;
        }
        self.collector.collect_data(PMT_TABLE_ID, packet);
        if self.collector.is_collected() {
            self.parse();
        }
    }

    pub fn is_collected(&self) -> bool {
        self.parsed
    }

    /// True exactly once, after collection: the caller forwards the PMT to
    /// the decrypt client a single time per version.
    pub fn is_ready_to_send(&mut self) -> bool {
        if self.parsed && !self.sent {
            self.sent = true;
            return true;
        }
        false
    }

    fn parse(&mut self) {
        let Some(section) = self.collector.section(0) else {
            return;
        };
        let data = &section.data;
        self.program_number = (u16::from(data[8]) << 8) | u16::from(data[9]);
        self.pcr_pid = ((u16::from(data[13]) & 0x1F) << 8) | u16::from(data[14]);
        self.prg_length = ((usize::from(data[15]) & 0x0F) << 8) | usize::from(data[16]);

        info!(
            "PMT: PID: {:04}  Section Length: {}  Prog NR: {}  Version: {}  PCR-PID: {:04}  Program Length: {}  CRC: {:08X}",
            section.pid,
            section.section_length,
            self.program_number,
            section.version,
            self.pcr_pid,
            self.prg_length,
            section.crc
        );

        // program-level descriptors
        if self.prg_length > 0 {
            self.prog_info
                .extend_from_slice(&data[17..17 + self.prg_length]);
            let mut i = 0;
            while i + 2 <= self.prg_length {
                let sub_length = usize::from(self.prog_info[i + 1]);
                // conditional access descriptor carries the ECM PID
                if self.prog_info[i] == 0x09 && sub_length >= 4 && i + 6 <= self.prg_length {
                    let caid =
                        (u16::from(self.prog_info[i + 2]) << 8) | u16::from(self.prog_info[i + 3]);
                    let ecm_pid = ((u16::from(self.prog_info[i + 4]) & 0x1F) << 8)
                        | u16::from(self.prog_info[i + 5]);
                    self.ecm_pids.push(EcmData {
                        caid,
                        ecm_pid,
                        provid: 0,
                    });
                    info!("PMT: CAID: {caid:04X}  ECM-PID: {ecm_pid:04}");
                }
                i += sub_length + 2;
            }
        }

        // 4 = CRC  9 = PMT header from section length
        let len = section.section_length.saturating_sub(4 + 9 + self.prg_length);
        let ptr = &data[17 + self.prg_length..];
        let mut i = 0;
        while i + 5 <= len {
            let stream_type = ptr[i];
            let elementary_pid = ((u16::from(ptr[i + 1]) & 0x1F) << 8) | u16::from(ptr[i + 2]);
            let es_info_length = ((usize::from(ptr[i + 3]) & 0x0F) << 8) | usize::from(ptr[i + 4]);
            self.elementary_pids.push(elementary_pid);
            info!(
                "PMT: Stream Type: {stream_type:2}  ES PID: {elementary_pid:04}  ES-Length: {es_info_length:3}"
            );
            let mut j = 0;
            while j < es_info_length {
                let sub_length = usize::from(ptr[j + i + 6]);
                // CA descriptor on the elementary stream
                if ptr[j + i + 5] == 0x09 {
                    let caid = (u16::from(ptr[j + i + 7]) << 8) | u16::from(ptr[j + i + 8]);
                    let ecm_pid =
                        ((u16::from(ptr[j + i + 9]) & 0x1F) << 8) | u16::from(ptr[j + i + 10]);
                    let provid =
                        ((u16::from(ptr[j + i + 11]) & 0x1F) << 8) | u16::from(ptr[j + i + 12]);
                    self.ecm_pids.push(EcmData {
                        caid,
                        ecm_pid,
                        provid,
                    });
                    info!("PMT: ECM-PID - CAID: {caid:04X}  ECM-PID: {ecm_pid:04}  PROVID: {provid:04X}");
                    self.prog_info
                        .extend_from_slice(&ptr[j + i + 5..j + i + 5 + sub_length + 2]);
                }
                j += sub_length + 2;
            }
            i += es_info_length + 5;
        }
        self.parsed = true;
    }

    pub fn program_number(&self) -> u16 {
        self.program_number
    }

    pub fn pcr_pid(&self) -> u16 {
        self.pcr_pid
    }

    pub fn elementary_pids(&self) -> &[u16] {
        &self.elementary_pids
    }

    pub fn ecm_pids(&self) -> &[EcmData] {
        &self.ecm_pids
    }

    /// The CA descriptor blob for the decrypt client, byte layout preserved.
    pub fn program_info(&self) -> Bytes {
        Bytes::copy_from_slice(&self.prog_info)
    }

    /// Raw bytes of the collected section, for the decrypt client boundary.
    pub fn section_bytes(&self) -> Bytes {
        self.collector.section_bytes(0)
    }

    /// Strip a PMT packet down to its ES loop for the CA_PMT handshake:
    /// program-info descriptors are dropped, section length and CRC are
    /// recomputed and the packet is stuffed with 0xFF. A packet that is
    /// not a payload-start PMT is rewritten to the null PID instead.
    pub fn clean_program_info(data: &mut [u8]) {
        debug_assert!(data.len() >= TS_PACKET_SIZE);
        let payload_start = packet::payload_unit_start(data);
        if !(payload_start && data[5] == PMT_TABLE_ID) {
            packet::set_null_pid(data);
            return;
        }
        let section_length = ((usize::from(data[6]) & 0x0F) << 8) | usize::from(data[7]);
        let prg_length = ((usize::from(data[15]) & 0x0F) << 8) | usize::from(data[16]);
        if 17 + prg_length >= TS_PACKET_SIZE {
            packet::set_null_pid(data);
            return;
        }

        let mut pmt = Vec::with_capacity(TS_PACKET_SIZE);
        pmt.extend_from_slice(&data[0..17]);

        // clear section length and program info length
        pmt[6] &= 0xF0;
        pmt[7] = 0x00;
        pmt[15] &= 0xF0;
        pmt[16] = 0x00;

        // 4 = CRC  9 = PMT header from section length
        let ptr = &data[17 + prg_length..TS_PACKET_SIZE];
        let len = section_length
            .saturating_sub(4 + 9 + prg_length)
            .min(ptr.len());
        let mut i = 0;
        while i + 5 <= len {
            let es_info_length = ((usize::from(ptr[i + 3]) & 0x0F) << 8) | usize::from(ptr[i + 4]);
            if i + es_info_length + 5 > ptr.len() {
                break;
            }
            pmt.extend_from_slice(&ptr[i..i + es_info_length + 5]);
            i += es_info_length + 5;
        }
        // adjust section length: 6 = PMT header  2 = section length  4 = CRC
        let new_section_length = pmt.len() - 6 - 2 + 4;
        pmt[6] |= ((new_section_length >> 8) & 0xFF) as u8;
        pmt[7] = (new_section_length & 0xFF) as u8;

        let crc = calculate_crc32(&pmt[5..]);
        pmt.extend_from_slice(&crc.to_be_bytes());
        pmt.resize(TS_PACKET_SIZE, 0xFF);

        data[..TS_PACKET_SIZE].copy_from_slice(&pmt);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// PMT body: program 1, PCR PID and one video ES, with an optional CA
    /// descriptor at program level.
    pub fn pmt_body(pcr_pid: u16, es_pid: u16, ca: Option<(u16, u16)>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes()); // program number
        body.push(0xC1); // version 0, current
        body.push(0x00); // section number
        body.push(0x00); // last section number
        body.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());

        let mut prog_info = Vec::new();
        if let Some((caid, ecm_pid)) = ca {
            prog_info.push(0x09);
            prog_info.push(0x04);
            prog_info.extend_from_slice(&caid.to_be_bytes());
            prog_info.extend_from_slice(&(0xE000 | ecm_pid).to_be_bytes());
        }
        body.extend_from_slice(&(0xF000 | prog_info.len() as u16).to_be_bytes());
        body.extend_from_slice(&prog_info);

        // one video elementary stream without descriptors
        body.push(0x02);
        body.extend_from_slice(&(0xE000 | es_pid).to_be_bytes());
        body.extend_from_slice(&0xF000u16.to_be_bytes());
        body
    }
}
