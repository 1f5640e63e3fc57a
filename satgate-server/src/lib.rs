//! satgate-server: the streaming side of a SAT>IP style server.
//!
//! An input device delivers raw TS packets into a per-stream ring of
//! [`satgate_mpegts::PacketBuffer`]s; the filter layer maintains PID
//! selection and PSI assembly, scrambled payload runs through the CSA
//! batch descrambler, and a pacing loop hands finished buffers to the
//! session's output sink with companion RTCP sender reports.

pub mod config;
pub mod decrypt;
pub mod input;
pub mod logging;
pub mod output;
pub mod server;
pub mod stream;
pub mod sync;

pub use server::Server;
