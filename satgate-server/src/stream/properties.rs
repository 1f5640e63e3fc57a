//! Per-stream properties: tuning state, RTP counters and the SAT>IP
//! attribute description string.
//!
//! The description string is part of the public SAT>IP protocol (it is
//! returned on RTSP DESCRIBE and carried live in the RTCP APP packet);
//! field order and separators must not change.

use std::time::Instant;

/// Frontend signal readings as reported towards clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontendStatus {
    /// Signal strength, 0..=255.
    pub strength: u32,
    pub has_lock: bool,
    /// Signal quality, 0..=15.
    pub quality: u32,
}

/// Tuning parameters per delivery system. The string fields hold the
/// SAT>IP token values as they appear on the wire (`dvbs2`, `8psk`,
/// `0.35`, `34`, ...).
#[derive(Debug, Clone)]
pub enum DeliverySystem {
    /// Not tuned yet.
    Undefined,
    DvbS {
        /// DiSEqC source, 1-based.
        src: u32,
        freq_khz: u32,
        polarization: char,
        msys: String,
        mtype: String,
        pilots: String,
        rolloff: String,
        /// Symbol rate in kSym/s.
        srate: u32,
        fec: String,
    },
    DvbT {
        freq_khz: u32,
        bandwidth_hz: u32,
        msys: String,
        transmission_mode: String,
        mtype: String,
        guard_interval: String,
        fec: String,
        plp_id: u32,
        t2_system_id: u32,
        siso_miso: u32,
    },
    DvbC {
        freq_khz: u32,
        bandwidth_hz: u32,
        msys: String,
        mtype: String,
        /// Symbol rate in kSym/s.
        srate: u32,
        c2_tuning_frequency_type: u32,
        data_slice: u32,
        plp_id: u32,
        spectral_inversion: u32,
    },
}

/// The mutable per-stream state shared between the stream thread, the
/// RTCP generator and the session control plane.
pub struct StreamProperties {
    stream_id: usize,
    ssrc: u32,
    delivery: DeliverySystem,
    status: FrontendStatus,
    /// Sender packet count since stream start.
    spc: u32,
    /// Sender octet count since stream start.
    soc: u32,
    /// Total RTP payload bytes, for the teardown log.
    rtp_payload: u64,
    /// Last RTP timestamp handed to a sink.
    timestamp: u32,
    started: Instant,
}

impl StreamProperties {
    pub fn new(stream_id: usize, ssrc: u32) -> Self {
        Self {
            stream_id,
            ssrc,
            delivery: DeliverySystem::Undefined,
            status: FrontendStatus::default(),
            spc: 0,
            soc: 0,
            rtp_payload: 0,
            timestamp: 0,
            started: Instant::now(),
        }
    }

    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_delivery_system(&mut self, delivery: DeliverySystem) {
        self.delivery = delivery;
    }

    pub fn delivery_system(&self) -> &DeliverySystem {
        &self.delivery
    }

    pub fn set_status(&mut self, status: FrontendStatus) {
        self.status = status;
    }

    pub fn status(&self) -> FrontendStatus {
        self.status
    }

    /// The 90 kHz RTP clock for this stream.
    pub fn rtp_timestamp(&self) -> u32 {
        (self.started.elapsed().as_millis() as u64)
            .wrapping_mul(90) as u32
    }

    /// Account one sent RTP packet of `bytes` payload.
    pub fn add_rtp_data(&mut self, bytes: u32, timestamp: u32) {
        self.spc = self.spc.wrapping_add(1);
        self.soc = self.soc.wrapping_add(bytes);
        self.rtp_payload += u64::from(bytes);
        self.timestamp = timestamp;
    }

    /// Cumulative sender packet count, for the RTCP SR.
    pub fn spc(&self) -> u32 {
        self.spc
    }

    /// Cumulative sender octet count, for the RTCP SR.
    pub fn soc(&self) -> u32 {
        self.soc
    }

    pub fn rtp_payload(&self) -> u64 {
        self.rtp_payload
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Render the SAT>IP attribute description string with the current
    /// signal readings and the given `pids=` value.
    pub fn attribute_describe_string(&self, pid_csv: &str) -> String {
        let fe_id = self.stream_id + 1;
        let FrontendStatus {
            strength,
            has_lock,
            quality,
        } = self.status;
        let lock = u32::from(has_lock);
        match &self.delivery {
            DeliverySystem::DvbS {
                src,
                freq_khz,
                polarization,
                msys,
                mtype,
                pilots,
                rolloff,
                srate,
                fec,
            } => format!(
                "ver=1.0;src={src};tuner={fe_id},{strength},{lock},{quality},{:.2},{polarization},{msys},{mtype},{pilots},{rolloff},{srate},{fec};pids={pid_csv}",
                f64::from(*freq_khz) / 1000.0
            ),
            DeliverySystem::DvbT {
                freq_khz,
                bandwidth_hz,
                msys,
                transmission_mode,
                mtype,
                guard_interval,
                fec,
                plp_id,
                t2_system_id,
                siso_miso,
            } => format!(
                "ver=1.1;tuner={fe_id},{strength},{lock},{quality},{:.2},{:.3},{msys},{transmission_mode},{mtype},{guard_interval},{fec},{plp_id},{t2_system_id},{siso_miso};pids={pid_csv}",
                f64::from(*freq_khz) / 1000.0,
                f64::from(*bandwidth_hz) / 1_000_000.0
            ),
            DeliverySystem::DvbC {
                freq_khz,
                bandwidth_hz,
                msys,
                mtype,
                srate,
                c2_tuning_frequency_type,
                data_slice,
                plp_id,
                spectral_inversion,
            } => format!(
                "ver=1.2;tuner={fe_id},{strength},{lock},{quality},{:.2},{:.3},{msys},{mtype},{srate},{c2_tuning_frequency_type},{data_slice},{plp_id},{spectral_inversion};pids={pid_csv}",
                f64::from(*freq_khz) / 1000.0,
                f64::from(*bandwidth_hz) / 1_000_000.0
            ),
            DeliverySystem::Undefined => "NONE".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dvbs2_delivery() -> DeliverySystem {
        DeliverySystem::DvbS {
            src: 1,
            freq_khz: 11_739_000,
            polarization: 'v',
            msys: "dvbs2".to_string(),
            mtype: "8psk".to_string(),
            pilots: "on".to_string(),
            rolloff: "0.35".to_string(),
            srate: 27_500,
            fec: "34".to_string(),
        }
    }

    #[test]
    fn dvbs2_describe_string_is_byte_exact() {
        let mut props = StreamProperties::new(0, 0x1234);
        props.set_delivery_system(dvbs2_delivery());
        props.set_status(FrontendStatus {
            strength: 240,
            has_lock: true,
            quality: 15,
        });

        assert_eq!(
            props.attribute_describe_string("0,17,100"),
            "ver=1.0;src=1;tuner=1,240,1,15,11739.00,v,dvbs2,8psk,on,0.35,27500,34;pids=0,17,100"
        );
    }

    #[test]
    fn undefined_delivery_describes_as_none() {
        let props = StreamProperties::new(0, 1);
        assert_eq!(props.attribute_describe_string(" "), "NONE");
    }

    #[test]
    fn dvbt_describe_string_variant() {
        let mut props = StreamProperties::new(2, 1);
        props.set_delivery_system(DeliverySystem::DvbT {
            freq_khz: 474_000,
            bandwidth_hz: 8_000_000,
            msys: "dvbt".to_string(),
            transmission_mode: "8k".to_string(),
            mtype: "64qam".to_string(),
            guard_interval: "14".to_string(),
            fec: "23".to_string(),
            plp_id: 0,
            t2_system_id: 0,
            siso_miso: 0,
        });
        assert_eq!(
            props.attribute_describe_string("all"),
            "ver=1.1;tuner=3,0,0,0,474.00,8.000,dvbt,8k,64qam,14,23,0,0,0;pids=all"
        );
    }

    #[test]
    fn rtp_counters_accumulate() {
        let mut props = StreamProperties::new(0, 1);
        props.add_rtp_data(1316, 90_000);
        props.add_rtp_data(1316, 180_000);
        assert_eq!(props.spc(), 2);
        assert_eq!(props.soc(), 2632);
        assert_eq!(props.timestamp(), 180_000);
    }
}
