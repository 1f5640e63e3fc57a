//! One stream: the state shared by its two threads plus the control
//! plane the session and decrypt-client sides call into.
//!
//! The stream thread owns the packet ring; everything else (PID table,
//! table collectors, properties, descrambler, section filters) sits
//! behind per-object mutexes. Control-plane entry points take those locks
//! through a bounded helper and fail the operation on timeout instead of
//! touching shared state unlocked.

pub mod client;
pub mod properties;
pub mod thread;

pub use client::StreamClient;
pub use properties::{DeliverySystem, FrontendStatus, StreamProperties};
pub use thread::{StreamThread, StreamThreadParams, MAX_BUF};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use satgate_csa::{ControlWord, CsaEngine, Descrambler, Parity};
use satgate_mpegts::packet::TS_PACKET_SIZE;
use satgate_mpegts::pid_table::MAX_PIDS;
use satgate_mpegts::psi::{Pmt, PAT_TABLE_ID, PMT_TABLE_ID};
use satgate_mpegts::Filter;
use thiserror::Error;

use crate::decrypt::SectionFilters;
use crate::input::Device;
use crate::output::{OutputSink, RtcpSink, RtcpThread};
use crate::sync::{lock_ignore_poison, lock_or_give_up};

#[derive(Debug, Error)]
pub enum StreamError {
    /// A control-plane lock could not be taken in time; the operation was
    /// aborted rather than run unlocked.
    #[error("Lock timeout on {0}, operation aborted")]
    LockTimeout(&'static str),
}

pub struct Stream {
    stream_id: usize,
    properties: Arc<Mutex<StreamProperties>>,
    filter: Arc<Mutex<Filter>>,
    descrambler: Arc<Mutex<Option<Descrambler>>>,
    section_filters: Arc<Mutex<SectionFilters>>,
    client: Arc<StreamClient>,
    stream_thread: Option<StreamThread>,
    rtcp_thread: Option<RtcpThread>,
}

impl Stream {
    pub fn new(
        stream_id: usize,
        ssrc: u32,
        rtp_addr: Option<SocketAddr>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            stream_id,
            properties: Arc::new(Mutex::new(StreamProperties::new(stream_id, ssrc))),
            filter: Arc::new(Mutex::new(Filter::new())),
            descrambler: Arc::new(Mutex::new(None)),
            section_filters: Arc::new(Mutex::new(SectionFilters::new())),
            client: Arc::new(StreamClient::new(rtp_addr, session_timeout)),
            stream_thread: None,
            rtcp_thread: None,
        }
    }

    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    pub fn properties(&self) -> Arc<Mutex<StreamProperties>> {
        Arc::clone(&self.properties)
    }

    pub fn filter(&self) -> Arc<Mutex<Filter>> {
        Arc::clone(&self.filter)
    }

    pub fn client(&self) -> Arc<StreamClient> {
        Arc::clone(&self.client)
    }

    /// Install the CSA engine; scrambled packets are batched through it
    /// from the stream thread once keys arrive.
    pub fn set_descramble_engine(&self, engine: Box<dyn CsaEngine + Send>) {
        *lock_ignore_poison(&self.descrambler) = Some(Descrambler::new(engine));
    }

    // =========================================================================
    //  -- Session control -----------------------------------------------------
    // =========================================================================

    /// Open or close a batch of PIDs from a client request.
    pub fn parse_pid_string(
        &self,
        pids: &str,
        clear_pids_first: bool,
        add: bool,
    ) -> Result<(), StreamError> {
        let mut filter =
            lock_or_give_up(&self.filter, "filter").ok_or(StreamError::LockTimeout("filter"))?;
        filter.parse_pid_string(pids, clear_pids_first, add);
        Ok(())
    }

    /// Drive the hardware demultiplexer for every PID whose state changed.
    ///
    /// The changed set is drained under the filter lock, the callbacks run
    /// with no lock held (they may block on real I/O), and the outcomes
    /// are committed in a second locked pass. A `set_pid` racing with the
    /// callbacks is not lost: it re-raises the changed flag and the next
    /// pass picks it up.
    pub fn update_pid_filters<O, C>(
        &self,
        mut open_pid: O,
        mut close_pid: C,
    ) -> Result<(), StreamError>
    where
        O: FnMut(u16) -> bool,
        C: FnMut(u16) -> bool,
    {
        let (to_open, to_close) = {
            let mut filter = lock_or_give_up(&self.filter, "filter")
                .ok_or(StreamError::LockTimeout("filter"))?;
            if !filter.pid_table().has_changed() {
                return Ok(());
            }
            filter.pid_table_mut().reset_changed();
            let to_close: Vec<u16> = (0..MAX_PIDS as u16)
                .filter(|&pid| filter.pid_table().should_close(usize::from(pid)))
                .collect();
            let to_open: Vec<u16> = (0..MAX_PIDS as u16)
                .filter(|&pid| filter.pid_table().should_open(usize::from(pid)))
                .collect();
            (to_open, to_close)
        };
        info!("Stream: {}, Updating PID filters...", self.stream_id);

        // hardware callbacks, lock released
        let closed: Vec<(u16, bool)> = to_close.into_iter().map(|pid| (pid, close_pid(pid))).collect();
        let opened: Vec<(u16, bool)> = to_open.into_iter().map(|pid| (pid, open_pid(pid))).collect();

        let mut filter =
            lock_or_give_up(&self.filter, "filter").ok_or(StreamError::LockTimeout("filter"))?;
        for (pid, ok) in closed {
            if ok {
                filter.pid_table_mut().set_pid_closed(usize::from(pid));
            }
        }
        for (pid, ok) in opened {
            if ok {
                filter.pid_table_mut().set_pid_opened(usize::from(pid));
            }
            // a failed open stays in ShouldOpen for the next pass
        }
        Ok(())
    }

    /// The SAT>IP attribute description string with live signal readings.
    pub fn attribute_describe_string(&self) -> Result<String, StreamError> {
        let pid_csv = lock_or_give_up(&self.filter, "filter")
            .ok_or(StreamError::LockTimeout("filter"))?
            .pid_csv();
        let props = lock_or_give_up(&self.properties, "properties")
            .ok_or(StreamError::LockTimeout("properties"))?;
        Ok(props.attribute_describe_string(&pid_csv))
    }

    /// Spawn the stream and RTCP threads in Running state.
    pub fn start_streaming(
        &mut self,
        device: Box<dyn Device>,
        sink: OutputSink,
        rtcp_sink: Option<RtcpSink>,
        send_interval: Duration,
        rtcp_interval: Duration,
        software_filter: bool,
    ) {
        let params = StreamThreadParams {
            device,
            sink,
            properties: Arc::clone(&self.properties),
            filter: Arc::clone(&self.filter),
            descrambler: Arc::clone(&self.descrambler),
            client: Arc::clone(&self.client),
            send_interval,
            software_filter,
        };
        self.stream_thread = Some(StreamThread::start(params));
        if let Some(sink) = rtcp_sink {
            self.rtcp_thread = Some(RtcpThread::start(
                Arc::clone(&self.properties),
                Arc::clone(&self.filter),
                Arc::clone(&self.client),
                sink,
                rtcp_interval,
            ));
        }
    }

    /// Pause both threads; the stream loop yields cooperatively, so the
    /// in-flight buffer write completes first.
    pub fn pause_streaming(&self) -> bool {
        if let Some(rtcp) = &self.rtcp_thread {
            rtcp.pause();
        }
        let paused = match &self.stream_thread {
            Some(thread) => thread.pause(),
            None => true,
        };
        if paused {
            let payload = lock_ignore_poison(&self.properties).rtp_payload();
            info!(
                "Stream: {}, Paused (streamed {:.3} MBytes)",
                self.stream_id,
                payload as f64 / (1024.0 * 1024.0)
            );
        }
        if let Some(descrambler) = lock_ignore_poison(&self.descrambler).as_mut() {
            descrambler.stop();
        }
        paused
    }

    /// Resume from Paused; the packet ring restarts empty.
    pub fn restart_streaming(&self) {
        if let Some(thread) = &self.stream_thread {
            thread.restart();
        }
        if let Some(rtcp) = &self.rtcp_thread {
            rtcp.restart();
        }
    }

    /// Tear both threads down by join and drop the sockets with them.
    pub fn stop_streaming(&mut self) {
        if let Some(thread) = self.stream_thread.take() {
            thread.stop();
        }
        if let Some(rtcp) = self.rtcp_thread.take() {
            rtcp.stop();
        }
        if let Some(descrambler) = lock_ignore_poison(&self.descrambler).as_mut() {
            descrambler.stop();
        }
        info!("Stream: {}, Stopped", self.stream_id);
    }

    /// Polled on a fixed interval by the server thread: an expired or
    /// self-destructing client means this session must be torn down.
    pub fn check_session(&self) -> bool {
        self.client.should_disconnect()
    }

    // =========================================================================
    //  -- Decrypt client boundary ---------------------------------------------
    // =========================================================================

    /// Feed one TS packet into the PSI collectors on behalf of the
    /// decrypt client (it needs the PAT and PMT to build CA_PMT messages).
    pub fn collect_table_data(&self, packet: &[u8]) {
        lock_ignore_poison(&self.filter).filter_data(packet, false);
    }

    /// Raw section bytes of a collected table, if any.
    pub fn table_data(&self, table_id: u8) -> Option<Bytes> {
        let filter = lock_ignore_poison(&self.filter);
        match table_id {
            PAT_TABLE_ID => None, // the PAT is not replayed to the client
            PMT_TABLE_ID => filter.active_pmt().map(|pmt| pmt.section_bytes()),
            _ => None,
        }
    }

    /// The live program's PMT section, handed out exactly once per
    /// collected version for the CA_PMT handshake.
    pub fn pmt_ready_to_send(&self) -> Option<Bytes> {
        let mut filter = lock_ignore_poison(&self.filter);
        let pmt = filter.active_pmt_mut()?;
        if pmt.is_ready_to_send() {
            Some(pmt.section_bytes())
        } else {
            None
        }
    }

    /// The live program's PMT as one TS packet stripped down for the
    /// CA_PMT handshake: program-info descriptors removed, section length
    /// and CRC recomputed, stuffed with 0xFF.
    pub fn ca_pmt_packet(&self) -> Option<[u8; TS_PACKET_SIZE]> {
        let section = self.table_data(PMT_TABLE_ID)?;
        if section.len() < TS_PACKET_SIZE {
            return None;
        }
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet.copy_from_slice(&section[..TS_PACKET_SIZE]);
        Pmt::clean_program_info(&mut packet);
        Some(packet)
    }

    /// Enqueue a control word delivered by the decrypt client.
    pub fn set_key(&self, cw: ControlWord, parity: Parity, index: usize, is_final: bool) {
        match lock_ignore_poison(&self.descrambler).as_mut() {
            Some(descrambler) => descrambler.set_key(cw, parity, index, is_final),
            None => warn!(
                "Stream: {}, Key for {parity} parity dropped, no descramble engine",
                self.stream_id
            ),
        }
    }

    /// Start the section filter `(demux, filter)` on a PID.
    pub fn start_ecm_filter(&self, pid: u16, demux: u32, filter: u32, data: &[u8], mask: &[u8]) {
        lock_ignore_poison(&self.section_filters).start(pid, demux, filter, data, mask);
    }

    pub fn stop_ecm_filter(&self, demux: u32, filter: u32) {
        lock_ignore_poison(&self.section_filters).stop(demux, filter);
    }

    /// The demuxes with running filters and the PIDs they watch, for the
    /// decrypt client's bookkeeping.
    pub fn active_ecm_filter_data(&self) -> Vec<(u32, Vec<u16>)> {
        let filters = lock_ignore_poison(&self.section_filters);
        filters
            .active_demuxes()
            .into_iter()
            .map(|demux| (demux, filters.active_filter_pids(demux)))
            .collect()
    }

    /// Feed one TS packet to the section filters; a completed section is
    /// returned with the demux and filter that collected it.
    pub fn collect_filter_data(&self, pid: u16, packet: &[u8]) -> Option<(u32, u32, Bytes)> {
        lock_ignore_poison(&self.section_filters).collect(pid, packet)
    }

    /// Drop keys, pending batches and section filters, e.g. when the
    /// decrypt client disconnects or the channel changes.
    pub fn stop_decrypt(&self) {
        if let Some(descrambler) = lock_ignore_poison(&self.descrambler).as_mut() {
            descrambler.stop();
        }
        lock_ignore_poison(&self.section_filters).clear();
    }
}
