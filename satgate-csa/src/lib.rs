//! CSA descrambling support for the satgate SAT>IP server.
//!
//! The external decrypt client feeds control words per parity; this crate
//! queues them ([`Keys`]), batches scrambled payload out of the packet
//! ring ([`DescrambleBatch`]) and runs the bulk decrypt through the
//! [`CsaEngine`] seam. Key absence degrades to null-packet substitution,
//! never to a stalled stream.

pub mod batch;
pub mod descrambler;
pub mod engine;
pub mod keys;

pub use batch::{BatchEntry, DescrambleBatch};
pub use descrambler::Descrambler;
pub use engine::{ControlWord, CsaEngine};
pub use keys::Keys;

/// CSA parity of a control word or scrambled packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Even = 0,
    Odd = 1,
}

impl Parity {
    /// Parity from the transport scrambling control odd bit.
    pub fn from_odd_bit(odd: bool) -> Self {
        if odd {
            Parity::Odd
        } else {
            Parity::Even
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parity::Even => write!(f, "even"),
            Parity::Odd => write!(f, "odd"),
        }
    }
}
