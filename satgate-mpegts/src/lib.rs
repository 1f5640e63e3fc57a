//! MPEG-TS data plane for the satgate SAT>IP server.
//!
//! This crate carries the per-tuner packet pipeline:
//! - [`packet`]: raw 188-byte TS packet header accessors
//! - [`PacketBuffer`]: RTP header + TS packet burst send buffer
//! - [`PidTable`]: per-PID open/close state and continuity accounting
//! - [`psi`]: cross-packet PAT/PMT/SDT/NIT section collection
//! - [`Filter`]: the PID filtering policy composed from the above

pub mod filter;
pub mod packet;
pub mod packet_buffer;
pub mod pid_table;
pub mod psi;

pub use filter::Filter;
pub use packet::{NULL_PID, SYNC_BYTE, TS_PACKET_SIZE};
pub use packet_buffer::PacketBuffer;
pub use pid_table::PidTable;
