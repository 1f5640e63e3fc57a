//! Service Description Table.
//!
//! Only the service descriptor (tag 0x48) is decoded: provider and
//! service name per service id, with the DVB extended-ASCII bytes
//! widened to two-byte UTF-8 sequences.

use std::collections::BTreeMap;

use log::info;

use crate::psi::section::TableCollector;
use crate::psi::SDT_TABLE_ID;

/// Names attached to one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdtData {
    pub provider_name: String,
    pub service_name: String,
}

#[derive(Debug, Default)]
pub struct Sdt {
    collector: TableCollector,
    transport_stream_id: u16,
    network_id: u16,
    services: BTreeMap<u16, SdtData>,
    parsed: bool,
}

impl Sdt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.transport_stream_id = 0;
        self.network_id = 0;
        self.services.clear();
        self.parsed = false;
        self.collector.clear();
    }

    /// Feed one TS packet from the SDT PID (17).
    pub fn collect_data(&mut self, packet: &[u8]) {
        if self.is_collected() {
            return;
        }
        self.collector.collect_data(SDT_TABLE_ID, packet);
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
            self.transport_stream_id = (u16::from(data[8]) << 8) | u16::from(data[9]);
            self.network_id = (u16::from(data[13]) << 8) | u16::from(data[14]);

            info!(
                "SDT: Section Length: {}  TSID: {}  Version: {}  NetworkID: {}",
                section.section_length, self.transport_stream_id, section.version, self.network_id
            );

            // 4 = CRC  9 = SDT header from section length
            let len = section.section_length.saturating_sub(4 + 9);
            let ptr = &data[16..];
            let mut i = 0;
            while i < len {
                let service_id = (u16::from(ptr[i]) << 8) | u16::from(ptr[i + 1]);
                let desc_length = ((usize::from(ptr[i + 3]) & 0x0F) << 8) | usize::from(ptr[i + 4]);
                let mut j = 5;
                while j < desc_length {
                    match ptr[j + i] {
                        0x48 => {
                            // service descriptor: type, provider, name
                            let mut entry = SdtData::default();
                            j += 3;
                            let mut sub_length = usize::from(ptr[j + i]);
                            entry.provider_name = copy_to_utf8(&ptr[j + i + 1..j + i + 1 + sub_length]);
                            j += sub_length + 1;
                            sub_length = usize::from(ptr[j + i]);
                            entry.service_name = copy_to_utf8(&ptr[j + i + 1..j + i + 1 + sub_length]);
                            j += sub_length + 1;
                            info!(
                                "SDT: serviceID: {service_id:5}  Provider: {}  ChannelName: {}",
                                entry.provider_name, entry.service_name
                            );
                            self.services.insert(service_id, entry);
                        }
                        _ => {
                            j += desc_length;
                        }
                    }
                }
                i += desc_length + 5;
            }
        }
        self.parsed = true;
    }

    pub fn service(&self, service_id: u16) -> Option<&SdtData> {
        self.services.get(&service_id)
    }

    pub fn transport_stream_id(&self) -> u16 {
        self.transport_stream_id
    }

    pub fn network_id(&self) -> u16 {
        self.network_id
    }
}

/// Widen DVB extended ASCII to UTF-8, skipping a leading character-set
/// selector byte when present.
fn copy_to_utf8(ptr: &[u8]) -> String {
    let offset = match ptr.first() {
        Some(&b) if b < 0x20 => {
            if b == 0x10 {
                2
            } else {
                1
            }
        }
        _ => 0,
    };
    let mut out = String::new();
    for &b in ptr.iter().skip(offset) {
        if b & 0x80 == 0x80 {
            out.push(char::from_u32(u32::from(b)).unwrap_or('?'));
        } else {
            out.push(char::from(b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::test_support::section_packets;
    use crate::psi::SDT_PID;

    fn sdt_body(service_id: u16, provider: &str, name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&7u16.to_be_bytes()); // transport stream id
        body.push(0xC1); // version 0, current
        body.push(0x00); // section number
        body.push(0x00); // last section number
        body.extend_from_slice(&0x1234u16.to_be_bytes()); // original network id
        body.push(0xFF); // reserved

        let mut descriptor = Vec::new();
        descriptor.push(0x48);
        descriptor.push((3 + provider.len() + name.len()) as u8);
        descriptor.push(0x01); // digital television service
        descriptor.push(provider.len() as u8);
        descriptor.extend_from_slice(provider.as_bytes());
        descriptor.push(name.len() as u8);
        descriptor.extend_from_slice(name.as_bytes());

        body.extend_from_slice(&service_id.to_be_bytes());
        body.push(0xFC); // EIT flags
        body.extend_from_slice(&(0x8000 | descriptor.len() as u16).to_be_bytes());
        body.extend_from_slice(&descriptor);
        body
    }

    #[test]
    fn sdt_decodes_service_names() {
        let body = sdt_body(0x0065, "Provider", "Channel One");
        let packets = section_packets(SDT_TABLE_ID, SDT_PID, &body, 0);

        let mut sdt = Sdt::new();
        for packet in &packets {
            sdt.collect_data(packet);
        }
        assert!(sdt.is_collected());
        assert_eq!(sdt.transport_stream_id(), 7);
        assert_eq!(sdt.network_id(), 0x1234);
        let service = sdt.service(0x0065).expect("service 0x65");
        assert_eq!(service.provider_name, "Provider");
        assert_eq!(service.service_name, "Channel One");
    }

    #[test]
    fn unknown_service_is_absent() {
        let sdt = Sdt::new();
        assert!(sdt.service(42).is_none());
    }
}
