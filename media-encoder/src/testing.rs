//! In-memory codec, factory, writer and sink used by the unit tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{BufferFlags, Codec, CodecFactory, EncodedSample, OutputEvent, SampleInfo},
    config::BitrateMode,
    error::{CodecError, MuxerError},
    format::{MediaFormat, TrackKind, keys},
    muxer::{TrackId, TrackSink, block_until_started},
    surface::{FrameSink, Surface, VideoFrame},
    writer::ContainerWriter,
};

/// Upper bound on how long an empty poll blocks the test worker.
const IDLE_POLL: Duration = Duration::from_millis(2);

#[derive(Clone, Debug)]
pub struct FakeCodecOptions {
    pub unsupported_modes: Vec<BitrateMode>,
    /// Reject the configuration even without a bitrate mode.
    pub reject_default: bool,
    /// Fail with a runtime error when producing this sample (0 based).
    pub fail_at_sample: Option<usize>,
    /// Emit a codec-config buffer right after the format change.
    pub emit_codec_config: bool,
    /// Report the output format a second time after the first sample.
    pub repeat_format: bool,
    /// Never produce the end-of-stream sample.
    pub swallow_end_of_stream: bool,
    /// Block this long, ignoring cancellation, before the end-of-stream sample.
    pub stall_at_end_of_stream: Option<Duration>,
    pub input_buffer_size: usize,
}

impl Default for FakeCodecOptions {
    fn default() -> Self {
        Self {
            unsupported_modes: Vec::new(),
            reject_default: false,
            fail_at_sample: None,
            emit_codec_config: false,
            repeat_format: false,
            swallow_end_of_stream: false,
            stall_at_end_of_stream: None,
            input_buffer_size: 4096,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeCodecLog {
    pub mime: String,
    pub configure_attempts: Vec<Option<BitrateMode>>,
    pub configured: Option<MediaFormat>,
    pub surfaces: u32,
    pub started: bool,
    pub stopped: bool,
    pub released: u32,
    /// (size, pts, flags) of every queued input buffer.
    pub inputs: Vec<(usize, i64, BufferFlags)>,
}

enum Pending {
    Frame { size: usize, pts_us: i64 },
    EndOfStream,
}

#[derive(Clone, Default)]
struct PendingQueue(Arc<Mutex<VecDeque<Pending>>>);

impl PendingQueue {
    fn push(&self, item: Pending) {
        self.0.lock().unwrap().push_back(item);
    }

    fn peek_is_frame(&self) -> Option<bool> {
        self.0
            .lock()
            .unwrap()
            .front()
            .map(|p| matches!(p, Pending::Frame { .. }))
    }

    fn pop(&self) -> Option<Pending> {
        self.0.lock().unwrap().pop_front()
    }
}

struct FakeSurfaceSink {
    queue: PendingQueue,
}

impl FrameSink for FakeSurfaceSink {
    fn render(&self, frame: VideoFrame) -> Result<(), CodecError> {
        self.queue.push(Pending::Frame {
            size: frame.data.len(),
            pts_us: frame.pts_us,
        });
        Ok(())
    }

    fn signal_end_of_stream(&self) -> Result<(), CodecError> {
        self.queue.push(Pending::EndOfStream);
        Ok(())
    }
}

/// A codec that turns every input frame into one encoded sample.
pub struct FakeCodec {
    options: FakeCodecOptions,
    log: Arc<Mutex<FakeCodecLog>>,
    queue: PendingQueue,
    format_sent: bool,
    format_repeated: bool,
    config_sent: bool,
    produced: usize,
    last_pts_us: i64,
    output: Vec<u8>,
    output_busy: bool,
    input: Vec<u8>,
    input_busy: bool,
}

impl FakeCodec {
    pub fn new(mime: &str, options: FakeCodecOptions) -> (Self, Arc<Mutex<FakeCodecLog>>) {
        let log = Arc::new(Mutex::new(FakeCodecLog {
            mime: mime.to_string(),
            ..Default::default()
        }));
        let codec = Self {
            input: vec![0; options.input_buffer_size],
            options,
            log: log.clone(),
            queue: PendingQueue::default(),
            format_sent: false,
            format_repeated: false,
            config_sent: false,
            produced: 0,
            last_pts_us: 0,
            output: Vec::new(),
            output_busy: false,
            input_busy: false,
        };
        (codec, log)
    }

    fn emit(&mut self, data: Vec<u8>, pts_us: i64, flags: BufferFlags) -> OutputEvent {
        let info = SampleInfo::new(data.len(), pts_us, flags);
        self.output = data;
        self.output_busy = true;
        OutputEvent::Buffer { index: 0, info }
    }
}

impl Codec for FakeCodec {
    fn configure(&mut self, format: &MediaFormat) -> Result<(), CodecError> {
        let mode = format
            .integer(keys::BITRATE_MODE)
            .and_then(BitrateMode::from_format_value);
        self.log.lock().unwrap().configure_attempts.push(mode);
        if let Some(mode) = mode {
            if self.options.unsupported_modes.contains(&mode) {
                return Err(CodecError::BitrateModeUnsupported(mode));
            }
        } else if self.options.reject_default {
            return Err(CodecError::Configuration("format rejected".to_string()));
        }
        self.log.lock().unwrap().configured = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Surface, CodecError> {
        let format = self
            .log
            .lock()
            .unwrap()
            .configured
            .clone()
            .ok_or_else(|| CodecError::Runtime("not configured".to_string()))?;
        self.log.lock().unwrap().surfaces += 1;
        let width = format.integer(keys::WIDTH).unwrap_or(0) as u32;
        let height = format.integer(keys::HEIGHT).unwrap_or(0) as u32;
        Ok(Surface::new(
            FakeSurfaceSink {
                queue: self.queue.clone(),
            },
            width,
            height,
        ))
    }

    fn start(&mut self) -> Result<(), CodecError> {
        self.log.lock().unwrap().started = true;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError> {
        if self.input_busy {
            std::thread::sleep(timeout.min(IDLE_POLL));
            return Ok(None);
        }
        self.input_busy = true;
        Ok(Some(0))
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
        if index != 0 || !self.input_busy {
            return Err(CodecError::InvalidIndex(index));
        }
        Ok(&mut self.input)
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        if index != 0 || !self.input_busy {
            return Err(CodecError::InvalidIndex(index));
        }
        self.input_busy = false;
        self.log
            .lock()
            .unwrap()
            .inputs
            .push((size, presentation_time_us, flags));
        if size > 0 {
            self.queue.push(Pending::Frame {
                size,
                pts_us: presentation_time_us,
            });
        }
        if flags.contains(BufferFlags::END_OF_STREAM) {
            self.queue.push(Pending::EndOfStream);
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputEvent, CodecError> {
        if self.output_busy {
            return Err(CodecError::Runtime("output buffer not released".to_string()));
        }
        if self.queue.peek_is_frame() == Some(true) && !self.format_sent {
            self.format_sent = true;
            return Ok(OutputEvent::FormatChanged);
        }
        if self.format_sent && self.options.emit_codec_config && !self.config_sent {
            self.config_sent = true;
            return Ok(self.emit(vec![0, 0, 0, 1, 0x67], 0, BufferFlags::CODEC_CONFIG));
        }
        if self.options.repeat_format && self.produced == 1 && !self.format_repeated {
            self.format_repeated = true;
            return Ok(OutputEvent::FormatChanged);
        }

        match self.queue.pop() {
            Some(Pending::Frame { size, pts_us }) => {
                if self.options.fail_at_sample == Some(self.produced) {
                    return Err(CodecError::Runtime("encoder hardware fault".to_string()));
                }
                let mut data = vec![0xAB; size.clamp(8, 256)];
                data[..8].copy_from_slice(&pts_us.to_le_bytes());
                let flags = if self.produced % 30 == 0 {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::empty()
                };
                self.produced += 1;
                self.last_pts_us = pts_us;
                Ok(self.emit(data, pts_us, flags))
            }
            Some(Pending::EndOfStream) if !self.options.swallow_end_of_stream => {
                if let Some(stall) = self.options.stall_at_end_of_stream {
                    std::thread::sleep(stall);
                }
                Ok(self.emit(Vec::new(), self.last_pts_us, BufferFlags::END_OF_STREAM))
            }
            Some(Pending::EndOfStream) | None => {
                std::thread::sleep(timeout.min(IDLE_POLL));
                Ok(OutputEvent::TryAgainLater)
            }
        }
    }

    fn output_format(&self) -> Result<MediaFormat, CodecError> {
        let mut format = self
            .log
            .lock()
            .unwrap()
            .configured
            .clone()
            .ok_or_else(|| CodecError::Runtime("not configured".to_string()))?;
        format.remove(keys::BITRATE_MODE);
        format.set_bytes(keys::CSD_0, Bytes::from_static(&[0, 0, 0, 1, 0x67]));
        Ok(format)
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8], CodecError> {
        if index != 0 || !self.output_busy {
            return Err(CodecError::InvalidIndex(index));
        }
        Ok(&self.output)
    }

    fn release_output_buffer(&mut self, index: usize) -> Result<(), CodecError> {
        if index != 0 || !self.output_busy {
            return Err(CodecError::InvalidIndex(index));
        }
        self.output_busy = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.log.lock().unwrap().stopped = true;
        Ok(())
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released += 1;
    }
}

/// Hands out [`FakeCodec`]s and keeps a log handle for each.
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub video: FakeCodecOptions,
    pub audio: FakeCodecOptions,
    pub fail_create: Vec<TrackKind>,
    pub(crate) created: Arc<Mutex<Vec<Arc<Mutex<FakeCodecLog>>>>>,
}

impl FakeFactory {
    pub fn codec_logs(&self) -> Vec<FakeCodecLog> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|log| log.lock().unwrap().clone())
            .collect()
    }

    pub fn codec_log(&self, kind: TrackKind) -> Option<FakeCodecLog> {
        self.codec_logs()
            .into_iter()
            .find(|log| TrackKind::from_mime(&log.mime) == Some(kind))
    }
}

impl CodecFactory for FakeFactory {
    fn create_encoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError> {
        let kind = TrackKind::from_mime(mime)
            .ok_or_else(|| CodecError::Unsupported(mime.to_string()))?;
        if self.fail_create.contains(&kind) {
            return Err(CodecError::Unsupported(mime.to_string()));
        }
        let options = match kind {
            TrackKind::Video => self.video.clone(),
            TrackKind::Audio => self.audio.clone(),
        };
        let (codec, log) = FakeCodec::new(mime, options);
        self.created.lock().unwrap().push(log);
        Ok(Box::new(codec))
    }
}

#[derive(Clone, Debug, Default)]
pub struct WriterLog {
    pub tracks: Vec<MediaFormat>,
    /// (writer track index, pts, size)
    pub samples: Vec<(usize, i64, usize)>,
    pub started: u32,
    pub stopped: u32,
    pub released: u32,
    pub discarded: u32,
}

impl WriterLog {
    pub fn samples_for(&self, index: usize) -> Vec<i64> {
        self.samples
            .iter()
            .filter(|(i, _, _)| *i == index)
            .map(|(_, pts, _)| *pts)
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MemoryWriter {
    pub log: Arc<Mutex<WriterLog>>,
    pub fail_writes: bool,
    pub fail_stop: bool,
}

impl MemoryWriter {
    pub fn new() -> (Self, Arc<Mutex<WriterLog>>) {
        let writer = Self::default();
        let log = writer.log.clone();
        (writer, log)
    }
}

impl ContainerWriter for MemoryWriter {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        let mut log = self.log.lock().unwrap();
        anyhow::ensure!(log.started == 0, "track added after start");
        log.tracks.push(format.clone());
        Ok(log.tracks.len() - 1)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().started += 1;
        Ok(())
    }

    fn write_sample_data(
        &mut self,
        track_index: usize,
        data: &[u8],
        info: &SampleInfo,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!self.fail_writes, "disk full");
        let mut log = self.log.lock().unwrap();
        anyhow::ensure!(log.started == 1, "write before start");
        anyhow::ensure!(track_index < log.tracks.len(), "bad track {}", track_index);
        log.samples
            .push((track_index, info.presentation_time_us, data.len()));
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().stopped += 1;
        anyhow::ensure!(!self.fail_stop, "trailer write failed");
        Ok(())
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released += 1;
    }

    fn discard(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().discarded += 1;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    AddTrack(TrackKind),
    Write(TrackId, i64),
    Finish(TrackId),
}

/// Records calls made by an encoder worker. Reports started once
/// `start_after` tracks have been added, or when forced.
pub struct RecordingSink {
    pub events: Mutex<Vec<SinkEvent>>,
    pub start_after: usize,
    started: watch::Sender<bool>,
}

impl RecordingSink {
    pub fn new(start_after: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            start_after,
            started: watch::channel(start_after == 0).0,
        }
    }

    pub fn force_start(&self) {
        self.started.send_replace(true);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    fn tracks(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SinkEvent::AddTrack(_)))
            .count()
    }
}

impl TrackSink for RecordingSink {
    fn add_track(&self, kind: TrackKind, _format: MediaFormat) -> Result<TrackId, MuxerError> {
        let mut events = self.events.lock().unwrap();
        let id = events
            .iter()
            .filter(|e| matches!(e, SinkEvent::AddTrack(_)))
            .count();
        events.push(SinkEvent::AddTrack(kind));
        if id + 1 >= self.start_after {
            self.started.send_replace(true);
        }
        Ok(id)
    }

    fn write_sample(&self, track: TrackId, sample: EncodedSample) -> Result<(), MuxerError> {
        if !self.is_started() {
            return Err(MuxerError::NotStarted {
                registered: self.tracks(),
                expected: self.start_after,
            });
        }
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Write(track, sample.pts_us()));
        Ok(())
    }

    fn finish_track(&self, track: TrackId) -> Result<(), MuxerError> {
        self.events.lock().unwrap().push(SinkEvent::Finish(track));
        Ok(())
    }

    fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    fn wait_started(&self, cancel: &CancellationToken) -> bool {
        block_until_started(self.started.subscribe(), cancel)
    }
}

pub fn rgba_frame(width: u32, height: u32, pts_us: i64) -> VideoFrame {
    let data = Bytes::from(vec![0x80; (width * height * 4) as usize]);
    VideoFrame::new(data, width, height, crate::surface::PixelLayout::Rgba, pts_us)
}
