//! Input devices delivering raw TS packets to the stream thread.

use thiserror::Error;

pub mod file;

pub use file::TsFileReader;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to open input {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
}

/// The contract every input device satisfies.
///
/// The stream thread polls [`is_data_available`](Device::is_data_available)
/// every loop iteration and on success reads exactly one 188-byte aligned
/// TS packet into the supplied buffer. A returned packet not starting
/// with the sync byte invalidates the ring slot's alignment; the caller
/// re-syncs or drops the slot.
pub trait Device: Send {
    /// Check if a packet can be read without blocking.
    fn is_data_available(&mut self) -> bool;

    /// Read one full 188-byte TS packet into `packet`. Returns false on a
    /// transient failure (device not ready); the caller retries on the
    /// next loop iteration.
    fn read_full_ts_packet(&mut self, packet: &mut [u8]) -> bool;

    /// Check whether the frontend currently has signal lock.
    fn has_lock(&self) -> bool;
}
