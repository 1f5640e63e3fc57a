//! Output side: protocol sinks and the RTCP generator.

pub mod rtcp;
pub mod sink;

pub use rtcp::{RtcpSink, RtcpThread};
pub use sink::{streaming_udp_socket, OutputSink, SendError};
