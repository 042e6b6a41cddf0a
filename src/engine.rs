// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The video feed engine: consumes telemetry value updates carrying H.264
//! chunks, detects transport loss via the rolling sequence counter, drives
//! the demuxer and the external decoder, and paces frames to the renderer.
//!
//! Two paths touch shared state: the ingestion path (one call per inbound
//! value) and the display scheduler (a periodic task, only in reordered
//! mode). They share the reorder queue and the sink, both behind mutexes;
//! neither path ever blocks on the other beyond those critical sections.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::decoder::DecodeBackend;
use crate::decoder::DecodeContext;
use crate::decoder::DecodedFrame;
use crate::decoder::PictureType;
use crate::demuxer::h264es::EsDemuxer;
use crate::demuxer::h264es::Packet;
use crate::demuxer::h264es::DEFAULT_BUFFER_CAPACITY;
use crate::reorder::GopQueue;

/// Display rate used when the stream advertises none, or an implausible one.
pub const FALLBACK_FPS: f64 = 5.0;

/// Diagnostic fields surfaced through [`VideoSink::on_detail`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Detail {
    Resolution,
    ColorFormat,
    Fps,
    /// The transport sequence counter of the latest chunk.
    Packet,
    /// The absolute frame number of the latest decoded frame.
    Frame,
    /// Decode latency of the latest frame, in seconds.
    Decode,
}

impl Detail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Detail::Resolution => "Resolution",
            Detail::ColorFormat => "Colorspace",
            Detail::Fps => "FPS",
            Detail::Packet => "Packet",
            Detail::Frame => "Frame",
            Detail::Decode => "Decode",
        }
    }
}

/// External renderer and status surface.
pub trait VideoSink: Send {
    /// A human-readable status line, shown in place of or over the video.
    /// An empty string clears it.
    fn on_status_text(&mut self, text: &str);

    /// The next frame to display, in display order.
    fn on_frame(&mut self, frame: DecodedFrame);

    /// A diagnostic key/value update. `-` is the placeholder value.
    fn on_detail(&mut self, key: Detail, value: &str);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("value too short to be a video chunk ({0} characters)")]
    TooShort(usize),
    #[error("value does not start with 0x")]
    MissingPrefix,
    #[error("value contains non-hex characters")]
    BadHex,
    #[error("declared payload length {declared} exceeds the available data")]
    TruncatedPayload { declared: usize },
}

/// One transport chunk: a 16-bit rolling sequence counter and up to 253
/// payload bytes, consumed immediately by injection into the demuxer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Parses the transport's textual representation `0xSSSSNNDD…`: 4 hex
    /// digits of sequence counter, 2 hex digits of payload byte count, then
    /// the hex-encoded payload. Anything past the declared payload length is
    /// ignored. Malformed input is rejected without side effects.
    pub fn parse(value: &str) -> Result<Self, ChunkError> {
        if value.len() < 8 {
            return Err(ChunkError::TooShort(value.len()));
        }
        if !value.starts_with("0x") {
            return Err(ChunkError::MissingPrefix);
        }

        // The ASCII prefix makes index 2 a character boundary.
        let digits = &value[2..];
        let bytes = digits.as_bytes();
        if !bytes[..6].iter().all(u8::is_ascii_hexdigit) {
            return Err(ChunkError::BadHex);
        }

        let seq = u16::from_str_radix(&digits[0..4], 16).map_err(|_| ChunkError::BadHex)?;
        let declared = usize::from_str_radix(&digits[4..6], 16).map_err(|_| ChunkError::BadHex)?;

        if bytes.len() < 6 + declared * 2 {
            return Err(ChunkError::TruncatedPayload { declared });
        }

        let hex = &bytes[6..6 + declared * 2];
        if !hex.iter().all(u8::is_ascii_hexdigit) {
            return Err(ChunkError::BadHex);
        }

        let payload = hex
            .chunks_exact(2)
            .map(|pair| hex_nibble(pair[0]) << 4 | hex_nibble(pair[1]))
            .collect();

        Ok(Chunk { seq, payload })
    }
}

/// Value of one validated ASCII hex digit.
fn hex_nibble(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

/// What to do with B-frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayPolicy {
    /// Ignore B-frames and display I/P pictures immediately in decode order.
    /// No reordering is needed once B-frames are dropped, so no scheduler
    /// runs either.
    Immediate,
    /// Honor B-frames: buffer decoded pictures per GOP and let the display
    /// scheduler emit them in POC order at the stream's frame rate.
    Reordered,
}

impl Default for DisplayPolicy {
    fn default() -> Self {
        Self::Immediate
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FeedOptions {
    pub policy: DisplayPolicy,
    pub buffer_capacity: usize,
    pub fallback_fps: f64,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            policy: Default::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            fallback_fps: FALLBACK_FPS,
        }
    }
}

/// The engine tying the pipeline together. One instance per video widget.
///
/// All failure modes are contained: nothing propagates out of
/// [`VideoFeed::handle_value`], every recovery is surfaced through the sink
/// or the log.
pub struct VideoFeed<B: DecodeBackend> {
    demuxer: EsDemuxer,
    backend: B,
    context: Option<Box<dyn DecodeContext>>,
    options: FeedOptions,
    /// Sequence counter of the previous chunk; `None` until the first one.
    prev_seq: Option<u16>,
    queue: Arc<Mutex<GopQueue>>,
    sink: Arc<Mutex<dyn VideoSink>>,
    scheduler: Option<SchedulerHandle>,
    running: bool,
}

impl<B: DecodeBackend> VideoFeed<B> {
    pub fn new<S: VideoSink + 'static>(backend: B, sink: S, options: FeedOptions) -> Self {
        Self {
            demuxer: EsDemuxer::with_capacity(options.buffer_capacity),
            backend,
            context: None,
            options,
            prev_seq: None,
            queue: Arc::new(Mutex::new(GopQueue::new())),
            sink: Arc::new(Mutex::new(sink)),
            scheduler: None,
            running: false,
        }
    }

    /// Allows the display scheduler to run. Frames decoded before `start` are
    /// queued but not displayed in reordered mode.
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Cancels and joins the display scheduler. Must be called before the
    /// widget's state is torn down.
    pub fn stop(&mut self) {
        self.running = false;
        if let Some(handle) = self.scheduler.take() {
            handle.stop();
        }
    }

    /// Clears all buffered state and continuity counters, for stream
    /// restart. The decode backend and sink wiring stay.
    pub fn reset(&mut self) {
        if let Some(handle) = self.scheduler.take() {
            handle.stop();
        }
        self.demuxer.reset();
        self.context = None;
        self.prev_seq = None;
        self.queue.lock().unwrap().clear();
    }

    /// Ingestion entry point: one inbound telemetry value update.
    pub fn handle_value(&mut self, value: &str) {
        let chunk = match Chunk::parse(value) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!("not a video chunk: {}", err);
                return;
            }
        };

        // The very first chunk has nothing to be contiguous with.
        if let Some(prev) = self.prev_seq {
            if chunk.seq != prev.wrapping_add(1) {
                self.on_sequence_gap(prev, chunk.seq);
            }
        }
        self.prev_seq = Some(chunk.seq);
        self.detail(Detail::Packet, &chunk.seq.to_string());

        if let Err(err) = self.demuxer.inject(&chunk.payload) {
            // The stream has desynchronized badly; only a full flush gets us
            // back to a sane state.
            warn!("{}", err);
            self.status("Video buffer overflow, waiting for good frame");
            self.context = None;
            self.demuxer.flush();
            return;
        }

        while let Some(packet) = self.demuxer.next_packet() {
            self.process_packet(packet);
        }
    }

    /// Loss recovery: salvage whatever picture is open, then flush.
    ///
    /// The normal picture boundary is the next picture's first slice, which
    /// loss may have eaten; the salvage pass finalizes the open picture so it
    /// is not silently dropped along with the buffer.
    fn on_sequence_gap(&mut self, prev: u16, current: u16) {
        warn!("sequence counter jumped ({} -> {})", prev, current);

        if let Some(packet) = self.demuxer.salvage() {
            debug!("salvaged open picture #{} before flushing", packet.seq);
            self.process_packet(packet);
        }

        self.demuxer.flush();
        self.context = None;
        self.status(&format!(
            "Sequence counter jumped ({} -> {}), waiting for good frame",
            prev, current
        ));
    }

    fn process_packet(&mut self, packet: Packet) {
        if self.context.is_none() {
            let score = self.backend.probe(&packet.data);
            if score < 100 {
                debug!(
                    "waiting for key context: packet #{} probe score {}",
                    packet.seq, score
                );
                return;
            }

            match self.backend.create_context(&packet.data) {
                Ok(context) => {
                    debug!("decode context created from packet #{}", packet.seq);
                    self.context = Some(context);
                    self.status("");
                }
                Err(err) => {
                    debug!("decode context creation failed: {}", err);
                    return;
                }
            }
        }

        let start = Instant::now();
        let result = match self.context.as_mut() {
            Some(context) => context.decode(&packet),
            None => return,
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                // No retry: drop the context and wait for the next packet
                // that can bootstrap a fresh one.
                warn!("decode failed for packet #{}: {}", packet.seq, err);
                self.context = None;
                for key in [
                    Detail::Decode,
                    Detail::Frame,
                    Detail::Resolution,
                    Detail::ColorFormat,
                ] {
                    self.detail(key, "-");
                }
                return;
            }
        };

        self.detail(
            Detail::Decode,
            &format!("{:.3}", start.elapsed().as_secs_f64()),
        );
        self.detail(Detail::Frame, &frame.frame_num.to_string());
        self.detail(Detail::Resolution, &frame.resolution.to_string());
        self.detail(Detail::ColorFormat, &frame.format.to_string());
        self.detail(Detail::Fps, &format!("{:.1}", self.display_fps()));

        match self.options.policy {
            DisplayPolicy::Immediate => {
                if matches!(frame.pic_type, PictureType::B) {
                    debug!("ignoring B frame {}", frame.frame_num);
                    return;
                }
                self.sink.lock().unwrap().on_frame(frame);
            }
            DisplayPolicy::Reordered => {
                self.queue.lock().unwrap().push(frame);
                self.ensure_scheduler();
            }
        }
    }

    /// The display rate, with the fallback applied for absent or implausible
    /// stream-reported values.
    fn display_fps(&self) -> f64 {
        let fps = self.demuxer.fps();
        if fps <= 0.01 {
            self.options.fallback_fps
        } else {
            fps
        }
    }

    /// Spawns the display scheduler if it is not running. A scheduler that
    /// ran out of frames exits on its own and is respawned here when the
    /// next decoded frame arrives.
    fn ensure_scheduler(&mut self) {
        if !self.running {
            return;
        }

        if let Some(handle) = &self.scheduler {
            if !handle.is_finished() {
                return;
            }
        }

        let period = Duration::from_secs_f64(1.0 / self.display_fps());
        self.scheduler = Some(SchedulerHandle::spawn(
            period,
            Arc::clone(&self.queue),
            Arc::clone(&self.sink),
        ));
    }

    fn status(&self, text: &str) {
        self.sink.lock().unwrap().on_status_text(text);
    }

    fn detail(&self, key: Detail, value: &str) {
        self.sink.lock().unwrap().on_detail(key, value);
    }
}

impl<B: DecodeBackend> Drop for VideoFeed<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.take() {
            handle.stop();
        }
    }
}

/// The display scheduler: a periodic task pulling displayable frames from
/// the reorder queue at the stream's frame rate.
struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl SchedulerHandle {
    fn spawn(
        period: Duration,
        queue: Arc<Mutex<GopQueue>>,
        sink: Arc<Mutex<dyn VideoSink>>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::spawn(move || {
            debug!("display scheduler started, period {:?}", period);

            loop {
                thread::sleep(period);
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                let frame = {
                    let mut queue = queue.lock().unwrap();
                    if queue.is_empty() {
                        // Out of frames entirely: exit rather than spin.
                        // Ingestion respawns the task with the next decoded
                        // frame.
                        debug!("display scheduler exhausted the queue, exiting");
                        break;
                    }
                    queue.take_next_frame()
                };

                // A non-empty queue with nothing displayable yet (POC gap)
                // just skips this tick.
                if let Some(frame) = frame {
                    sink.lock().unwrap().on_frame(frame);
                }
            }
        });

        Self { stop, thread }
    }

    fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Cancels the task and joins it; bounded by one display period.
    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.thread.join().is_err() {
            warn!("display scheduler panicked");
        }
    }
}
