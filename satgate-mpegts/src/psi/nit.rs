//! Network Information Table.
//!
//! Decodes the network id and name plus the per-transport-stream delivery
//! descriptors (satellite 0x43, cable 0x44) far enough to log what the
//! network carries.

use log::info;

use crate::psi::section::TableCollector;
use crate::psi::{NIT_TABLE_ID, NIT_OTHER_TABLE_ID};

/// One transport stream announced by the NIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NitEntry {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    /// Delivery system, `dvbs2` or `dvbc`, when a descriptor was found.
    pub msys: String,
    /// Frequency and symbol rate as 4-bit BCD strings, as transmitted.
    pub frequency: String,
    pub symbol_rate: String,
}

#[derive(Debug, Default)]
pub struct Nit {
    collector: TableCollector,
    network_id: u16,
    network_name: String,
    table: Vec<NitEntry>,
    parsed: bool,
}

impl Nit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.network_id = 0;
        self.network_name.clear();
        self.table.clear();
        self.parsed = false;
        self.collector.clear();
    }

    /// Feed one TS packet from the NIT PID (16). Sections of "other
    /// network" tables are collected under the same id.
    pub fn collect_data(&mut self, packet: &[u8]) {
        if self.is_collected() {
            return;
        }
        let table_id = if packet[5] == NIT_OTHER_TABLE_ID {
            NIT_OTHER_TABLE_ID
        } else {
            NIT_TABLE_ID
        };
        self.collector.collect_data(table_id, packet);
        if self.collector.is_collected() {
            self.parse();
        }
    }

    pub fn is_collected(&self) -> bool {
        self.parsed
    }

    fn parse(&mut self) {
        for sec_nr in 0..self.collector.number_of_sections() {
            let Some(section) = self.collector.section(sec_nr) else {
                continue;
            };
            let data = &section.data;
            self.network_id = (u16::from(data[8]) << 8) | u16::from(data[9]);

            info!(
                "NIT: Section Length: {}  NID: {}  Version: {}",
                section.section_length, self.network_id, section.version
            );

            // network descriptors
            let mut index = 13;
            let net_desc_end =
                (((usize::from(data[index]) << 8) | usize::from(data[index + 1])) & 0xFFF) + index + 2;
            index += 2;
            while index < net_desc_end {
                let tag = data[index];
                let desc_end = usize::from(data[index + 1]) + index + 2;
                index += 2;
                match tag {
                    0x40 => {
                        // network name descriptor
                        while index < desc_end {
                            let c = data[index];
                            if c >= 0x20 && c < 0x80 {
                                self.network_name.push(char::from(c));
                            }
                            index += 1;
                        }
                        info!("NIT: Network Name Descriptor: {}", self.network_name);
                    }
                    _ => index = desc_end,
                }
            }

            // transport stream descriptors
            let stream_desc_end =
                (((usize::from(data[index]) << 8) | usize::from(data[index + 1])) & 0xFFF) + index + 2;
            index += 2;
            while index < stream_desc_end {
                let mut entry = NitEntry {
                    transport_stream_id: (u16::from(data[index]) << 8) | u16::from(data[index + 1]),
                    original_network_id: (u16::from(data[index + 2]) << 8)
                        | u16::from(data[index + 3]),
                    ..Default::default()
                };
                let transport_desc_end = (((usize::from(data[index + 4]) << 8)
                    | usize::from(data[index + 5]))
                    & 0xFFF)
                    + index
                    + 6;
                index += 6;
                while index < transport_desc_end {
                    let tag = data[index];
                    let desc_end = usize::from(data[index + 1]) + index + 2;
                    index += 2;
                    match tag {
                        0x43 => {
                            // satellite delivery system descriptor
                            entry.msys = "dvbs2".to_string();
                            entry.frequency = bcd_string(&data[index..index + 4]);
                            entry.symbol_rate = bcd_string(&data[index + 7..index + 11]);
                            let sr = &mut entry.symbol_rate;
                            sr.truncate(7);
                            info!(
                                "NIT: TSID: {}  ONID: {:04X}  Freq: {}  SymbolRate: {}  msys: {}",
                                entry.transport_stream_id,
                                entry.original_network_id,
                                entry.frequency,
                                entry.symbol_rate,
                                entry.msys
                            );
                            index = desc_end;
                        }
                        0x44 => {
                            // cable delivery system descriptor
                            entry.msys = "dvbc".to_string();
                            entry.frequency = bcd_string(&data[index..index + 4]);
                            entry.symbol_rate = bcd_string(&data[index + 7..index + 11]);
                            entry.symbol_rate.truncate(7);
                            info!(
                                "NIT: TSID: {}  ONID: {:04X}  Freq: {}  SymbolRate: {}  msys: {}",
                                entry.transport_stream_id,
                                entry.original_network_id,
                                entry.frequency,
                                entry.symbol_rate,
                                entry.msys
                            );
                            index = desc_end;
                        }
                        _ => index = desc_end,
                    }
                }
                self.table.push(entry);
            }
        }
        self.parsed = true;
    }

    pub fn network_id(&self) -> u16 {
        self.network_id
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn entries(&self) -> &[NitEntry] {
        &self.table
    }
}

/// Render 4-bit BCD digits the way they arrive on the wire.
fn bcd_string(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for &b in data {
        out.push(char::from(b'0' + (b >> 4)));
        out.push(char::from(b'0' + (b & 0x0F)));
    }
    out
}
