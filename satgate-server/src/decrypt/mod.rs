//! The boundary towards the external decrypt client.
//!
//! An OSCam-style client asks the server to run section filters on ECM
//! and EMM PIDs and feeds control words back per parity. This module
//! carries the demux/filter table: mask-matched section collection per
//! active filter, handed out once a section is complete.

pub mod filter;

pub use filter::SectionFilters;
