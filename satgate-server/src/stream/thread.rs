//! The per-stream producer/consumer loop.
//!
//! One dedicated OS thread reads TS packets from the input device into a
//! fixed ring of packet buffers and, paced by the send interval, hands
//! ready buffers to the session's output sink. The Running/Pause/Paused
//! state machine is cooperative: transitions only happen between loop
//! iterations, so an in-flight write to the current slot always completes
//! before a pause takes effect. Teardown joins the thread, it never
//! cancels it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use satgate_csa::Descrambler;
use satgate_mpegts::packet::{null_packet, SYNC_BYTE, TS_PACKET_SIZE};
use satgate_mpegts::{Filter, PacketBuffer};

use crate::input::Device;
use crate::output::OutputSink;
use crate::stream::client::StreamClient;
use crate::stream::properties::StreamProperties;
use crate::sync::lock_ignore_poison;

/// Ring depth; sized to absorb device jitter.
pub const MAX_BUF: usize = 100;

const STATE_RUNNING: u8 = 0;
const STATE_PAUSE: u8 = 1;
const STATE_PAUSED: u8 = 2;

/// Control block shared between the loop and the session side.
struct Control {
    running: AtomicBool,
    state: AtomicU8,
    reset_requested: AtomicBool,
}

/// Everything the stream loop needs, moved into its thread.
pub struct StreamThreadParams {
    pub device: Box<dyn Device>,
    pub sink: OutputSink,
    pub properties: Arc<Mutex<StreamProperties>>,
    pub filter: Arc<Mutex<Filter>>,
    pub descrambler: Arc<Mutex<Option<Descrambler>>>,
    pub client: Arc<StreamClient>,
    pub send_interval: Duration,
    pub software_filter: bool,
}

/// Handle to a running stream thread.
pub struct StreamThread {
    control: Arc<Control>,
    handle: Option<JoinHandle<()>>,
    protocol: &'static str,
}

impl StreamThread {
    /// Spawn the loop in Running state.
    pub fn start(params: StreamThreadParams) -> Self {
        let protocol = params.sink.protocol();
        let control = Arc::new(Control {
            running: AtomicBool::new(true),
            state: AtomicU8::new(STATE_RUNNING),
            reset_requested: AtomicBool::new(false),
        });
        let thread_control = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name("streaming".to_string())
            .spawn(move || stream_loop(params, thread_control))
            .expect("spawn stream thread");
        info!("Start {protocol} stream");
        Self {
            control,
            handle: Some(handle),
            protocol,
        }
    }

    /// Ask the loop to pause and wait for the cooperative transition.
    /// Returns false when the loop did not reach Paused in time.
    pub fn pause(&self) -> bool {
        self.control.state.store(STATE_PAUSE, Ordering::SeqCst);
        let mut timeout = 0;
        while self.control.state.load(Ordering::SeqCst) != STATE_PAUSED {
            std::thread::sleep(Duration::from_millis(50));
            timeout += 1;
            if timeout > 50 {
                error!("Pause {} stream TIMEOUT", self.protocol);
                return false;
            }
        }
        info!("Pause {} stream", self.protocol);
        true
    }

    /// Resume from Paused; the ring restarts empty.
    pub fn restart(&self) {
        self.control.reset_requested.store(true, Ordering::SeqCst);
        self.control.state.store(STATE_RUNNING, Ordering::SeqCst);
        info!("Restart {} stream", self.protocol);
    }

    pub fn is_paused(&self) -> bool {
        self.control.state.load(Ordering::SeqCst) == STATE_PAUSED
    }

    /// Stop the loop and join the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.control.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The loop state living on the stream thread's stack.
struct LoopState {
    ring: Vec<PacketBuffer>,
    ts_empty: PacketBuffer,
    write_index: usize,
    read_index: usize,
    cseq: u16,
    last_send: Instant,
}

fn stream_loop(mut params: StreamThreadParams, control: Arc<Control>) {
    let ssrc = lock_ignore_poison(&params.properties).ssrc();

    let mut state = LoopState {
        ring: Vec::with_capacity(MAX_BUF),
        ts_empty: PacketBuffer::new(),
        write_index: 0,
        read_index: 0,
        cseq: 0,
        last_send: Instant::now(),
    };
    for _ in 0..MAX_BUF {
        let mut buffer = PacketBuffer::new();
        buffer.initialize(ssrc, 0);
        state.ring.push(buffer);
    }
    // keepalive buffer holding a single TS null packet
    state.ts_empty.initialize(ssrc, 0);
    state.ts_empty.write_slot()[..TS_PACKET_SIZE].copy_from_slice(&null_packet());
    state.ts_empty.add_written(TS_PACKET_SIZE);

    while control.running.load(Ordering::SeqCst) {
        match control.state.load(Ordering::SeqCst) {
            STATE_PAUSE => control.state.store(STATE_PAUSED, Ordering::SeqCst),
            STATE_PAUSED => std::thread::sleep(Duration::from_millis(50)),
            _ => {
                if control.reset_requested.swap(false, Ordering::SeqCst) {
                    state.write_index = 0;
                    state.read_index = 0;
                    state.cseq = 0;
                    for buffer in &mut state.ring {
                        buffer.reset();
                    }
                }
                read_data_from_input_device(&mut params, &mut state);
            }
        }
    }
    debug!("Stream loop terminated");
}

/// One Running-state iteration: poll the device, fill the write slot,
/// and release a ready buffer to the sink once the pacing interval is up.
fn read_data_from_input_device(params: &mut StreamThreadParams, state: &mut LoopState) {
    let now = Instant::now();
    let interval_exceeded = now.duration_since(state.last_send) >= params.send_interval;

    if params.device.is_data_available() {
        let buffer = &mut state.ring[state.write_index];
        let slot = buffer.write_slot();
        if params.device.read_full_ts_packet(&mut slot[..TS_PACKET_SIZE]) {
            buffer.add_written(TS_PACKET_SIZE);
            let number = buffer.completed_packets() - 1;

            if buffer.ts_packet(number)[0] != SYNC_BYTE {
                // upstream desync, e.g. dropped bytes from the driver
                if !buffer.try_syncing() {
                    warn!("Lost sync, buffer flushed");
                }
            } else {
                let keep = lock_ignore_poison(&params.filter)
                    .filter_data(buffer.ts_packet(number), params.software_filter);
                if !keep {
                    buffer.mark_for_purging(number);
                }
            }

            if buffer.full() {
                buffer.purge();
            }
            if buffer.full() {
                if let Some(descrambler) = lock_ignore_poison(&params.descrambler).as_mut() {
                    descrambler.process(buffer);
                }
                // advance the write index; when the reader fell behind the
                // oldest unread slot is overwritten, never the tuner stalled
                state.write_index = (state.write_index + 1) % MAX_BUF;
                if state.write_index == state.read_index {
                    state.read_index = (state.read_index + 1) % MAX_BUF;
                }
                state.ring[state.write_index].reset();
            }
        }
    }

    if interval_exceeded {
        state.last_send = now;
        let read_index = state.read_index;
        if state.ring[read_index].is_ready_to_send() {
            if send_buffer(params, state, read_index) {
                state.read_index = (read_index + 1) % MAX_BUF;
            }
        } else if params.device.has_lock() {
            // keep the client fed while the frontend has lock
            send_keepalive(params, state);
        }
    }
}

fn send_buffer(params: &mut StreamThreadParams, state: &mut LoopState, index: usize) -> bool {
    let ssrc;
    let timestamp;
    {
        let props = lock_ignore_poison(&params.properties);
        ssrc = props.ssrc();
        timestamp = props.rtp_timestamp();
    }
    state.cseq = state.cseq.wrapping_add(1);
    match params
        .sink
        .send(&mut state.ring[index], ssrc, state.cseq, timestamp)
    {
        Ok(bytes) => {
            lock_ignore_poison(&params.properties).add_rtp_data(bytes as u32, timestamp);
            // data is flowing, the session watchdog stays quiet
            params.client.keep_alive();
            true
        }
        Err(e) => {
            if !params.client.is_self_destructing() {
                error!("Error sending {} data: {e}", params.sink.protocol());
                params.client.self_destruct();
            }
            // the read index stays put, teardown is on its way
            false
        }
    }
}

fn send_keepalive(params: &mut StreamThreadParams, state: &mut LoopState) {
    let ssrc;
    let timestamp;
    {
        let props = lock_ignore_poison(&params.properties);
        ssrc = props.ssrc();
        timestamp = props.rtp_timestamp();
    }
    state.cseq = state.cseq.wrapping_add(1);
    match params
        .sink
        .send(&mut state.ts_empty, ssrc, state.cseq, timestamp)
    {
        Ok(bytes) => {
            lock_ignore_poison(&params.properties).add_rtp_data(bytes as u32, timestamp);
        }
        Err(e) => {
            if !params.client.is_self_destructing() {
                error!("Error sending {} keepalive: {e}", params.sink.protocol());
                params.client.self_destruct();
            }
        }
    }
}
