//! PSI/SI section collection and table parsing.
//!
//! Sections can span several TS packets; [`section::TableCollector`] glues
//! the fragments back together and the per-table modules extract the
//! fields the streaming pipeline needs.

pub mod nit;
pub mod pat;
pub mod pmt;
pub mod sdt;
pub mod section;

pub use nit::Nit;
pub use pat::Pat;
pub use pmt::Pmt;
pub use sdt::Sdt;
pub use section::TableCollector;

/// Program Association Table.
pub const PAT_TABLE_ID: u8 = 0x00;
/// Conditional Access Table.
pub const CAT_TABLE_ID: u8 = 0x01;
/// Program Map Table.
pub const PMT_TABLE_ID: u8 = 0x02;
/// Network Information Table (actual network).
pub const NIT_TABLE_ID: u8 = 0x40;
/// Network Information Table (other network).
pub const NIT_OTHER_TABLE_ID: u8 = 0x41;
/// Service Description Table.
pub const SDT_TABLE_ID: u8 = 0x42;
/// Entitlement Control Messages, even and odd crypto period.
pub const ECM0_TABLE_ID: u8 = 0x80;
pub const ECM1_TABLE_ID: u8 = 0x81;
/// Entitlement Management Messages.
pub const EMM1_TABLE_ID: u8 = 0x82;
pub const EMM2_TABLE_ID: u8 = 0x83;
pub const EMM3_TABLE_ID: u8 = 0x84;

/// Well known PIDs carrying the tables above.
pub const PAT_PID: u16 = 0;
pub const CAT_PID: u16 = 1;
pub const NIT_PID: u16 = 16;
pub const SDT_PID: u16 = 17;

/// Human readable table name for the log.
pub fn table_name(table_id: u8) -> &'static str {
    match table_id {
        PAT_TABLE_ID => "PAT",
        CAT_TABLE_ID => "CAT",
        PMT_TABLE_ID => "PMT",
        NIT_TABLE_ID | NIT_OTHER_TABLE_ID => "NIT",
        SDT_TABLE_ID => "SDT",
        ECM0_TABLE_ID | ECM1_TABLE_ID => "ECM",
        EMM1_TABLE_ID | EMM2_TABLE_ID | EMM3_TABLE_ID => "EMM",
        _ => "Unknown Table ID",
    }
}
