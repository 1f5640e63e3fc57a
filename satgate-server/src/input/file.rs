//! File-backed TS input.
//!
//! Replays a TS capture as if it were a tuner: one packet per read,
//! rewinding to the start of the file at EOF so the stream loops. A file
//! always has "signal lock". Read pacing follows the program clock:
//! when the stream's filter has sampled a PCR delta the reader sleeps it
//! off before announcing data, so the replay runs at roughly real-time
//! speed instead of the disk's.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use satgate_mpegts::{Filter, TS_PACKET_SIZE};

use crate::input::{Device, DeviceError};
use crate::sync::lock_ignore_poison;

pub struct TsFileReader {
    file: File,
    path: String,
    /// Filter owning the PCR samples that drive the replay speed.
    pacing: Option<Arc<Mutex<Filter>>>,
    last_read: Instant,
}

impl TsFileReader {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let file = File::open(path).map_err(|source| DeviceError::Open {
            path: path.display().to_string(),
            source,
        })?;
        info!("Opened TS input file: {}", path.display());
        Ok(Self {
            file,
            path: path.display().to_string(),
            pacing: None,
            last_read: Instant::now(),
        })
    }

    /// Pace reads off the PCR deltas this filter collects.
    pub fn with_pcr_pacing(mut self, filter: Arc<Mutex<Filter>>) -> Self {
        self.pacing = Some(filter);
        self
    }
}

impl Device for TsFileReader {
    fn is_data_available(&mut self) -> bool {
        let pcr_delta = self
            .pacing
            .as_ref()
            .map(|filter| lock_ignore_poison(filter).pcr().delta())
            .unwrap_or(0);
        if pcr_delta != 0 {
            let elapsed = self.last_read.elapsed().as_micros() as i64;
            let interval = pcr_delta - elapsed;
            if interval > 0 {
                std::thread::sleep(Duration::from_micros(interval as u64));
            }
            self.last_read = Instant::now();
            if let Some(filter) = &self.pacing {
                lock_ignore_poison(filter).pcr_mut().clear_delta();
            }
        } else {
            std::thread::sleep(Duration::from_micros(1000));
        }
        true
    }

    fn read_full_ts_packet(&mut self, packet: &mut [u8]) -> bool {
        debug_assert!(packet.len() >= TS_PACKET_SIZE);
        match self.file.read(&mut packet[..TS_PACKET_SIZE]) {
            Ok(0) => {
                // EOF, rewind for looped playback
                debug!("EOF on {}, rewinding", self.path);
                if let Err(e) = self.file.seek(SeekFrom::Start(0)) {
                    warn!("Failed to rewind {}: {e}", self.path);
                    return false;
                }
                false
            }
            Ok(n) if n < TS_PACKET_SIZE => {
                // trailing partial packet, drop it and rewind
                debug!("Short read of {n} bytes on {}, rewinding", self.path);
                let _ = self.file.seek(SeekFrom::Start(0));
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!("Read error on {}: {e}", self.path);
                false
            }
        }
    }

    fn has_lock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satgate_mpegts::packet::null_packet;
    use std::io::Write;

    #[test]
    fn reads_packets_and_loops_at_eof() {
        let dir = std::env::temp_dir();
        let path = dir.join("satgate-test-input.ts");
        {
            let mut file = File::create(&path).expect("create test file");
            file.write_all(&null_packet()).expect("write");
            file.write_all(&null_packet()).expect("write");
        }

        let mut reader = TsFileReader::open(&path).expect("open");
        let mut packet = [0u8; TS_PACKET_SIZE];
        assert!(reader.read_full_ts_packet(&mut packet));
        assert_eq!(packet[0], 0x47);
        assert!(reader.read_full_ts_packet(&mut packet));

        // EOF: one failed read, then the file starts over
        assert!(!reader.read_full_ts_packet(&mut packet));
        assert!(reader.read_full_ts_packet(&mut packet));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_reports_its_path() {
        let error = TsFileReader::open(Path::new("/nonexistent/capture.ts"))
            .err()
            .expect("open must fail");
        assert!(error.to_string().contains("/nonexistent/capture.ts"));
    }
}
