//! The seam towards the bulk CSA decrypt primitive.
//!
//! A libdvbcsa-style implementation sits behind this trait; the batch it
//! receives is a list of (offset, length) windows into the TS payload
//! area of one packet buffer, built immediately before the call and never
//! held across loop iterations.

/// An 8-byte CSA control word as delivered by the decrypt client.
pub type ControlWord = [u8; 8];

/// Bulk CSA descrambler.
pub trait CsaEngine {
    /// Largest number of payloads one decrypt call accepts.
    fn max_batch_size(&self) -> usize;

    /// Decrypt every `(offset, len)` window of `ts_area` in place with
    /// `cw`. Windows never overlap and cover at most 184 bytes each (the
    /// TS payload past the header and adaptation field).
    fn decrypt(&mut self, cw: &ControlWord, ts_area: &mut [u8], windows: &[(usize, usize)]);
}
