use std::{
    collections::VecDeque,
    sync::{
        Arc,
        mpsc::{Receiver, SyncSender, TryRecvError, sync_channel},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{BufferFlags, CodecFactory, EncodedSample},
    error::{EncoderError, MuxerError, Result},
    format::{MediaFormat, TrackKind},
    muxer::{TrackId, TrackSink},
    session::{CodecSession, DrainEvent},
    surface::Surface,
};

/// Log a dropped pre-start sample at most every N drops.
const DROP_LOG_INTERVAL: u64 = 120;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderState {
    Created,
    Configured,
    Started,
    Encoding,
    Draining,
    EndOfStreamSignaled,
    Released,
    Failed,
}

impl EncoderState {
    pub fn name(&self) -> &'static str {
        match self {
            EncoderState::Created => "created",
            EncoderState::Configured => "configured",
            EncoderState::Started => "started",
            EncoderState::Encoding => "encoding",
            EncoderState::Draining => "draining",
            EncoderState::EndOfStreamSignaled => "end-of-stream",
            EncoderState::Released => "released",
            EncoderState::Failed => "failed",
        }
    }
}

/// Capability shared by every encoder variant. The drain loop is driven by
/// [`run_encode_loop`]; a variant only supplies its format, its input
/// discipline and how its track is forwarded to the muxer.
pub trait Encoder: Send + 'static {
    fn kind(&self) -> TrackKind;

    /// Mime type used for codec creation and as the track mime.
    fn encode_type(&self) -> &'static str;

    /// Builds the format, configures the session (with bitrate fallback) and
    /// acquires the input side.
    fn config_encoder(&mut self, session: &mut CodecSession) -> Result<()>;

    fn add_track(&self, sink: &dyn TrackSink, format: MediaFormat) -> Result<TrackId>;

    fn write_data(&self, sink: &dyn TrackSink, track: TrackId, sample: EncodedSample)
    -> Result<()>;

    /// Tells the muxer this track produced its last sample.
    fn release(&self, sink: &dyn TrackSink, track: TrackId) -> Result<()>;

    /// `true` when the owner pushes every input buffer, `false` when frames
    /// arrive through the encode surface.
    fn encode_manually(&self) -> bool;

    fn encode_surface(&self) -> Option<Surface> {
        None
    }

    /// Playback duration of `bytes` of manual input.
    fn input_duration_us(&self, _bytes: usize) -> i64 {
        0
    }
}

#[derive(Clone, Debug)]
pub enum FrameCmd {
    Data { data: Bytes, pts_us: i64 },
    EndOfStream,
}

/// Cloneable sender for manually fed encoders.
#[derive(Clone)]
pub struct FrameInput {
    tx: SyncSender<FrameCmd>,
}

impl FrameInput {
    /// Queues one chunk of raw input. Blocks while the queue is full.
    pub fn push_frame(&self, data: Bytes, pts_us: i64) -> Result<()> {
        self.tx
            .send(FrameCmd::Data { data, pts_us })
            .map_err(|_| EncoderError::Cancelled)
    }

    /// Queues the end-of-stream marker; it is submitted as an empty
    /// end-of-stream input buffer after all queued data.
    pub fn signal_end_of_stream(&self) -> Result<()> {
        self.tx
            .send(FrameCmd::EndOfStream)
            .map_err(|_| EncoderError::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopOptions {
    pub drain_timeout: Duration,
    pub max_pending_samples: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_millis(10),
            max_pending_samples: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackSummary {
    pub kind: TrackKind,
    pub track: Option<TrackId>,
    pub samples_written: u64,
    pub bytes_written: u64,
    /// Samples dropped while waiting for the muxer to start.
    pub dropped_before_start: u64,
    pub last_pts_us: Option<i64>,
}

impl TrackSummary {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            track: None,
            samples_written: 0,
            bytes_written: 0,
            dropped_before_start: 0,
            last_pts_us: None,
        }
    }
}

pub(crate) struct ManualInput {
    rx: Receiver<FrameCmd>,
    current: Option<(Bytes, i64)>,
    last_pts_us: i64,
    eos_pending: bool,
    eos_submitted: bool,
}

impl ManualInput {
    pub(crate) fn new(rx: Receiver<FrameCmd>) -> Self {
        Self {
            rx,
            current: None,
            last_pts_us: 0,
            eos_pending: false,
            eos_submitted: false,
        }
    }
}

fn set_state(state: &watch::Sender<EncoderState>, next: EncoderState) {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Moves queued manual input into free codec input buffers. Chunks larger
/// than a buffer are split; each piece's pts is advanced by the duration of
/// the bytes already submitted.
fn feed_input(
    encoder: &dyn Encoder,
    session: &mut CodecSession,
    input: &mut ManualInput,
    timeout: Duration,
) -> Result<()> {
    loop {
        if input.eos_submitted {
            return Ok(());
        }
        if input.current.is_none() && !input.eos_pending {
            match input.rx.try_recv() {
                Ok(FrameCmd::Data { data, pts_us }) => {
                    if data.is_empty() {
                        continue;
                    }
                    input.current = Some((data, pts_us));
                }
                Ok(FrameCmd::EndOfStream) => input.eos_pending = true,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    log::warn!(
                        "{} input closed without end of stream, ending stream",
                        encoder.kind()
                    );
                    input.eos_pending = true;
                }
            }
        }

        let Some((index, buffer)) = session.acquire_input_buffer(timeout)? else {
            return Ok(());
        };
        match input.current.take() {
            Some((data, pts_us)) => {
                let n = data.len().min(buffer.len());
                if n == 0 {
                    return Err(EncoderError::CodecFailure(format!(
                        "{} encoder returned an empty input buffer",
                        encoder.kind()
                    )));
                }
                buffer[..n].copy_from_slice(&data[..n]);
                session.submit_input_buffer(index, n, pts_us, BufferFlags::empty())?;
                input.last_pts_us = pts_us;
                if n < data.len() {
                    input.current = Some((data.slice(n..), pts_us + encoder.input_duration_us(n)));
                }
            }
            None => {
                session.submit_input_buffer(
                    index,
                    0,
                    input.last_pts_us,
                    BufferFlags::END_OF_STREAM,
                )?;
                input.eos_submitted = true;
                log::debug!("{} end of stream queued to codec", encoder.kind());
            }
        }
    }
}

fn write_sample(
    encoder: &dyn Encoder,
    sink: &dyn TrackSink,
    track: TrackId,
    sample: EncodedSample,
    summary: &mut TrackSummary,
) -> Result<()> {
    let size = sample.data.len() as u64;
    let pts = sample.pts_us();
    encoder.write_data(sink, track, sample)?;
    summary.samples_written += 1;
    summary.bytes_written += size;
    summary.last_pts_us = Some(pts);
    Ok(())
}

fn flush_pending(
    encoder: &dyn Encoder,
    sink: &dyn TrackSink,
    track: TrackId,
    pending: &mut VecDeque<EncodedSample>,
    summary: &mut TrackSummary,
) -> Result<()> {
    while let Some(sample) = pending.pop_front() {
        write_sample(encoder, sink, track, sample, summary)?;
    }
    Ok(())
}

/// Drives one encoder until its end-of-stream sample: feeds manual input,
/// drains output, registers the track on the negotiated format and forwards
/// samples, holding them back while the muxer waits for sibling tracks.
pub(crate) fn run_encode_loop(
    encoder: &dyn Encoder,
    session: &mut CodecSession,
    sink: &dyn TrackSink,
    mut input: Option<ManualInput>,
    options: &LoopOptions,
    cancel: &CancellationToken,
    state: &watch::Sender<EncoderState>,
) -> Result<TrackSummary> {
    let kind = encoder.kind();
    let mut summary = TrackSummary::new(kind);
    let mut track: Option<TrackId> = None;
    let mut pending: VecDeque<EncodedSample> = VecDeque::new();

    loop {
        if cancel.is_cancelled() {
            return Err(EncoderError::Cancelled);
        }

        if let Some(input) = input.as_mut() {
            set_state(state, EncoderState::Encoding);
            feed_input(encoder, session, input, options.drain_timeout)?;
        }

        set_state(state, EncoderState::Draining);
        let mut end_of_stream = false;
        for event in session.drain_output(options.drain_timeout) {
            match event? {
                DrainEvent::FormatChanged(format) => {
                    let id = encoder.add_track(sink, format)?;
                    log::info!("{} encoder registered track {}", kind, id);
                    track = Some(id);
                    summary.track = Some(id);
                }
                DrainEvent::Sample(sample) => {
                    end_of_stream = sample.info.is_end_of_stream();
                    let Some(id) = track else {
                        return Err(EncoderError::CodecFailure(format!(
                            "{} encoder reached end of stream before reporting its output format",
                            kind
                        )));
                    };
                    if sample.data.is_empty() {
                        continue;
                    }
                    set_state(state, EncoderState::Encoding);
                    if pending.is_empty() && sink.is_started() {
                        write_sample(encoder, sink, id, sample, &mut summary)?;
                    } else {
                        if pending.len() >= options.max_pending_samples {
                            pending.pop_front();
                            summary.dropped_before_start += 1;
                            if summary.dropped_before_start % DROP_LOG_INTERVAL == 1 {
                                log::debug!(
                                    "{} muxer not started, dropped {} samples",
                                    kind,
                                    summary.dropped_before_start
                                );
                            }
                        }
                        pending.push_back(sample);
                    }
                }
            }
        }

        if let Some(id) = track {
            if !pending.is_empty() {
                if end_of_stream && !sink.wait_started(cancel) {
                    if cancel.is_cancelled() {
                        return Err(EncoderError::Cancelled);
                    }
                    return Err(MuxerError::Closed.into());
                }
                if sink.is_started() {
                    flush_pending(encoder, sink, id, &mut pending, &mut summary)?;
                }
            }

            if end_of_stream {
                set_state(state, EncoderState::EndOfStreamSignaled);
                encoder.release(sink, id)?;
                log::info!(
                    "{} encoder reached end of stream: {} samples, {} bytes",
                    kind,
                    summary.samples_written,
                    summary.bytes_written
                );
                return Ok(summary);
            }
        }
    }
}

/// One encoder plus its codec session and drain worker.
pub struct EncoderTask {
    kind: TrackKind,
    mime: &'static str,
    manual: bool,
    encoder: Option<Box<dyn Encoder>>,
    session: Option<CodecSession>,
    surface: Option<Surface>,
    input: Option<FrameInput>,
    input_queue_bound: usize,
    state: Arc<watch::Sender<EncoderState>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<TrackSummary>>>,
}

impl EncoderTask {
    /// Creates the codec for `encoder`. A codec creation failure is fatal.
    pub fn new(
        encoder: Box<dyn Encoder>,
        factory: &dyn CodecFactory,
        cancel: CancellationToken,
        input_queue_bound: usize,
    ) -> Result<Self> {
        let session = CodecSession::create(factory, encoder.encode_type())?;
        let (state, _) = watch::channel(EncoderState::Created);
        Ok(Self {
            kind: encoder.kind(),
            mime: encoder.encode_type(),
            manual: encoder.encode_manually(),
            encoder: Some(encoder),
            session: Some(session),
            surface: None,
            input: None,
            input_queue_bound: input_queue_bound.max(1),
            state: Arc::new(state),
            cancel,
            handle: None,
        })
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn encode_type(&self) -> &'static str {
        self.mime
    }

    pub fn encode_manually(&self) -> bool {
        self.manual
    }

    pub fn state(&self) -> EncoderState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EncoderState> {
        self.state.subscribe()
    }

    fn expect_state(&self, expected: EncoderState) -> Result<()> {
        let found = self.state();
        if found != expected {
            return Err(EncoderError::InvalidState {
                expected: expected.name(),
                found: found.name(),
            });
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.session = None;
        self.encoder = None;
        set_state(&self.state, EncoderState::Failed);
    }

    pub fn configure(&mut self) -> Result<()> {
        self.expect_state(EncoderState::Created)?;
        let (Some(encoder), Some(session)) = (self.encoder.as_mut(), self.session.as_mut()) else {
            return Err(EncoderError::InvalidState {
                expected: "created",
                found: "released",
            });
        };
        if let Err(e) = encoder.config_encoder(session) {
            log::error!("{} encoder configuration failed: {}", self.kind, e);
            self.fail();
            return Err(e);
        }
        self.surface = encoder.encode_surface();
        set_state(&self.state, EncoderState::Configured);
        Ok(())
    }

    /// Starts the codec and moves the drain loop onto a blocking worker.
    /// A worker failure cancels `cancel`, stopping sibling encoders.
    pub fn start(&mut self, sink: Arc<dyn TrackSink>, options: LoopOptions) -> Result<()> {
        self.expect_state(EncoderState::Configured)?;
        let (Some(encoder), Some(mut session)) = (self.encoder.take(), self.session.take()) else {
            return Err(EncoderError::InvalidState {
                expected: "configured",
                found: "released",
            });
        };
        if let Err(e) = session.start() {
            log::error!("{} encoder start failed: {}", self.kind, e);
            set_state(&self.state, EncoderState::Failed);
            return Err(e);
        }

        let input = if self.manual {
            let (tx, rx) = sync_channel(self.input_queue_bound);
            self.input = Some(FrameInput { tx });
            Some(ManualInput::new(rx))
        } else {
            None
        };

        set_state(&self.state, EncoderState::Started);
        log::info!("{} encoder started ({})", self.kind, self.mime);

        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let kind = self.kind;
        self.handle = Some(tokio::task::spawn_blocking(move || {
            let result = run_encode_loop(
                encoder.as_ref(),
                &mut session,
                sink.as_ref(),
                input,
                &options,
                &cancel,
                &state,
            );
            session.release();
            match &result {
                Ok(_) => set_state(&state, EncoderState::Released),
                Err(EncoderError::Cancelled) => {
                    log::info!("{} encoder cancelled", kind);
                    set_state(&state, EncoderState::Failed);
                }
                Err(e) => {
                    log::error!("{} encoder failed: {}", kind, e);
                    set_state(&state, EncoderState::Failed);
                    cancel.cancel();
                }
            }
            result
        }));
        Ok(())
    }

    /// Input surface for surface-driven encoders; `None` for manual ones.
    pub fn encode_surface(&self) -> Option<Surface> {
        self.surface.clone()
    }

    /// Manual input handle, available once a manually fed encoder started.
    pub fn input(&self) -> Option<FrameInput> {
        self.input.clone()
    }

    fn manual_input(&self) -> Result<&FrameInput> {
        if !self.manual {
            return Err(EncoderError::NotManual);
        }
        self.input.as_ref().ok_or(EncoderError::InvalidState {
            expected: "started",
            found: self.state().name(),
        })
    }

    pub fn push_frame(&self, data: Bytes, pts_us: i64) -> Result<()> {
        self.manual_input()?.push_frame(data, pts_us)
    }

    /// Surface encoders close their surface; manual encoders queue the
    /// end-of-stream buffer.
    pub fn signal_end_of_stream(&self) -> Result<()> {
        if self.manual {
            return self.manual_input()?.signal_end_of_stream();
        }
        match &self.surface {
            Some(surface) => surface.signal_end_of_stream(),
            None => Err(EncoderError::InvalidState {
                expected: "configured",
                found: self.state().name(),
            }),
        }
    }

    /// Waits for the worker. Safe to race against a timeout: the worker
    /// handle is kept until it completes.
    pub async fn wait(&mut self) -> Result<TrackSummary> {
        let found = self.state().name();
        let Some(handle) = self.handle.as_mut() else {
            return Err(EncoderError::InvalidState {
                expected: "started",
                found,
            });
        };
        let result = handle.await;
        self.handle = None;
        result.map_err(|e| EncoderError::CodecFailure(format!("{} worker panicked: {}", self.kind, e)))?
    }

    /// Stops waiting for a worker that ignores cancellation. The worker
    /// still releases its codec when it eventually returns.
    pub fn detach(&mut self) {
        if self.handle.take().is_some() {
            log::warn!("{} encoder worker detached", self.kind);
        }
    }

    /// Signals end of stream (surface encoders) and blocks until this track
    /// has been flushed and marked finished.
    pub async fn stop(&mut self) -> Result<TrackSummary> {
        if !self.manual {
            self.signal_end_of_stream()?;
        }
        self.wait().await
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
