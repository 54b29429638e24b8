use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::EncodedSample,
    error::MuxerError,
    format::{MediaFormat, TrackKind},
    writer::ContainerWriter,
};

pub type TrackId = usize;

/// Command channel capacity; workers block on a full queue.
const MUXER_CHAN_CAP: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackStats {
    pub samples: u64,
    pub bytes: u64,
    /// Samples dropped because their timestamp went backwards.
    pub dropped: u64,
    pub last_pts_us: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackReport {
    pub id: TrackId,
    pub kind: TrackKind,
    pub mime: String,
    pub finished: bool,
    pub stats: TrackStats,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MuxerReport {
    pub started: bool,
    pub finalized: bool,
    pub aborted: bool,
    pub tracks: Vec<TrackReport>,
}

impl MuxerReport {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackReport> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

struct Track {
    kind: TrackKind,
    format: MediaFormat,
    writer_index: usize,
    finished: bool,
    stats: TrackStats,
}

/// Collects track formats, opens the container once every expected track is
/// registered and finalizes it once every registered track has finished.
pub struct TrackMuxer {
    writer: Box<dyn ContainerWriter>,
    expected_tracks: usize,
    tracks: Vec<Track>,
    started: bool,
    finalized: bool,
    aborted: bool,
}

impl TrackMuxer {
    pub fn new(writer: Box<dyn ContainerWriter>, expected_tracks: usize) -> Self {
        Self {
            writer,
            expected_tracks,
            tracks: Vec::new(),
            started: false,
            finalized: false,
            aborted: false,
        }
    }

    pub fn expected_tracks(&self) -> usize {
        self.expected_tracks
    }

    pub fn registered_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_closed(&self) -> bool {
        self.finalized || self.aborted
    }

    pub fn add_track(&mut self, kind: TrackKind, format: MediaFormat) -> Result<TrackId, MuxerError> {
        if self.is_closed() {
            return Err(MuxerError::Closed);
        }
        if self.tracks.iter().any(|t| t.kind == kind) {
            return Err(MuxerError::DuplicateTrack(kind));
        }
        if self.tracks.len() >= self.expected_tracks {
            return Err(MuxerError::UnexpectedTrack {
                kind,
                expected: self.expected_tracks,
            });
        }

        let id = self.tracks.len();
        log::info!("muxer add {} track {}: {}", kind, id, format);
        self.tracks.push(Track {
            kind,
            format,
            writer_index: 0,
            finished: false,
            stats: TrackStats::default(),
        });

        if self.tracks.len() == self.expected_tracks {
            self.open()?;
        }
        Ok(id)
    }

    /// Adds every track to the writer in registration order and commits the
    /// header. Container formats need all track formats up front.
    fn open(&mut self) -> Result<(), MuxerError> {
        for track in self.tracks.iter_mut() {
            track.writer_index = self
                .writer
                .add_track(&track.format)
                .map_err(|e| MuxerError::Writer(format!("{:#}", e)))?;
        }
        self.writer
            .start()
            .map_err(|e| MuxerError::Writer(format!("{:#}", e)))?;
        self.started = true;
        log::info!("muxer started with {} tracks", self.tracks.len());
        Ok(())
    }

    pub fn write_sample(&mut self, id: TrackId, sample: &EncodedSample) -> Result<(), MuxerError> {
        if self.is_closed() {
            return Err(MuxerError::Closed);
        }
        if id >= self.tracks.len() {
            return Err(MuxerError::UnknownTrack(id));
        }
        if !self.started {
            return Err(MuxerError::NotStarted {
                registered: self.tracks.len(),
                expected: self.expected_tracks,
            });
        }

        let track = &mut self.tracks[id];
        if track.finished {
            return Err(MuxerError::TrackFinished(id));
        }
        let pts = sample.pts_us();
        if let Some(last) = track.stats.last_pts_us {
            if pts < last {
                track.stats.dropped += 1;
                log::warn!(
                    "{} track {} sample pts {}us goes backwards (last {}us), dropped",
                    track.kind,
                    id,
                    pts,
                    last
                );
                return Ok(());
            }
        }

        self.writer
            .write_sample_data(track.writer_index, &sample.data, &sample.info)
            .map_err(|e| MuxerError::Writer(format!("{:#}", e)))?;
        track.stats.samples += 1;
        track.stats.bytes += sample.data.len() as u64;
        track.stats.last_pts_us = Some(pts);
        Ok(())
    }

    /// Marks a track finished. Returns `true` when this call finalized the
    /// container. Finishing a track twice is a no-op.
    pub fn mark_track_finished(&mut self, id: TrackId) -> Result<bool, MuxerError> {
        let track = self.tracks.get_mut(id).ok_or(MuxerError::UnknownTrack(id))?;
        if track.finished {
            log::debug!("{} track {} already finished", track.kind, id);
            return Ok(false);
        }
        track.finished = true;
        log::info!(
            "{} track {} finished: {} samples, {} bytes",
            track.kind,
            id,
            track.stats.samples,
            track.stats.bytes
        );

        if self.started && !self.is_closed() && self.tracks.iter().all(|t| t.finished) {
            self.finalize()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// A failed trailer leaves an unfinished container, which is discarded.
    fn finalize(&mut self) -> Result<(), MuxerError> {
        if let Err(e) = self.writer.stop() {
            log::error!("muxer trailer write failed: {:#}", e);
            self.discard_output();
            return Err(MuxerError::Writer(format!("{:#}", e)));
        }
        self.finalized = true;
        self.writer.release();
        log::info!("muxer finalized");
        Ok(())
    }

    fn discard_output(&mut self) {
        self.aborted = true;
        self.writer.release();
        if let Err(e) = self.writer.discard() {
            log::error!("muxer discard error: {:#}", e);
        }
    }

    /// Closes the writer without finalizing and discards its output.
    pub fn abort(&mut self) {
        if self.is_closed() {
            return;
        }
        self.discard_output();
        log::warn!(
            "muxer aborted with {}/{} tracks registered",
            self.tracks.len(),
            self.expected_tracks
        );
    }

    pub fn report(&self) -> MuxerReport {
        MuxerReport {
            started: self.started,
            finalized: self.finalized,
            aborted: self.aborted,
            tracks: self
                .tracks
                .iter()
                .enumerate()
                .map(|(id, t)| TrackReport {
                    id,
                    kind: t.kind,
                    mime: t.format.mime().to_string(),
                    finished: t.finished,
                    stats: t.stats,
                })
                .collect(),
        }
    }
}

/// Blocking interface encoder workers use to reach the muxer.
pub trait TrackSink: Send + Sync {
    fn add_track(&self, kind: TrackKind, format: MediaFormat) -> Result<TrackId, MuxerError>;

    fn write_sample(&self, track: TrackId, sample: EncodedSample) -> Result<(), MuxerError>;

    fn finish_track(&self, track: TrackId) -> Result<(), MuxerError>;

    /// Whether the container accepts samples yet.
    fn is_started(&self) -> bool;

    /// Blocks until the container accepts samples. `false` when cancelled
    /// or when the muxer closed first.
    fn wait_started(&self, cancel: &CancellationToken) -> bool;
}

/// Blocking wait on a published start flag, for use on worker threads.
pub(crate) fn block_until_started(
    mut started: watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> bool {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return *started.borrow();
    };
    runtime.block_on(async {
        tokio::select! {
            r = started.wait_for(|s| *s) => r.is_ok(),
            _ = cancel.cancelled() => false,
        }
    })
}

enum MuxerCommand {
    AddTrack {
        kind: TrackKind,
        format: MediaFormat,
        result: oneshot::Sender<Result<TrackId, MuxerError>>,
    },
    WriteSample {
        track: TrackId,
        sample: EncodedSample,
        result: oneshot::Sender<Result<(), MuxerError>>,
    },
    FinishTrack {
        track: TrackId,
        result: oneshot::Sender<Result<bool, MuxerError>>,
    },
    Abort {
        result: oneshot::Sender<()>,
    },
}

/// Handle to a [`TrackMuxer`] owned by a dedicated task. Every request is
/// serialized through that task, so concurrent registrations cannot race on
/// the "all tracks registered" transition.
#[derive(Clone)]
pub struct MuxerHandle {
    tx: mpsc::Sender<MuxerCommand>,
    started: watch::Receiver<bool>,
}

impl MuxerHandle {
    /// Moves the muxer onto its own task. The task ends once the container is
    /// finalized or aborted, or when every handle is dropped (in which case an
    /// unfinished container is aborted).
    pub fn spawn(muxer: TrackMuxer) -> (Self, JoinHandle<MuxerReport>) {
        let (tx, rx) = mpsc::channel(MUXER_CHAN_CAP);
        let (started_tx, started) = watch::channel(false);
        let handle = tokio::task::spawn_blocking(move || Self::muxer_loop(muxer, rx, started_tx));
        (Self { tx, started }, handle)
    }

    fn muxer_loop(
        mut muxer: TrackMuxer,
        mut rx: mpsc::Receiver<MuxerCommand>,
        started: watch::Sender<bool>,
    ) -> MuxerReport {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                MuxerCommand::AddTrack {
                    kind,
                    format,
                    result,
                } => {
                    let r = muxer.add_track(kind, format);
                    started.send_replace(muxer.is_started());
                    let _ = result.send(r);
                }
                MuxerCommand::WriteSample {
                    track,
                    sample,
                    result,
                } => {
                    let _ = result.send(muxer.write_sample(track, &sample));
                }
                MuxerCommand::FinishTrack { track, result } => {
                    let _ = result.send(muxer.mark_track_finished(track));
                }
                MuxerCommand::Abort { result } => {
                    muxer.abort();
                    let _ = result.send(());
                }
            }
            if muxer.is_closed() {
                break;
            }
        }

        if !muxer.is_closed() {
            muxer.abort();
        }
        started.send_replace(false);
        muxer.report()
    }

    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, MuxerError>>) -> MuxerCommand,
    ) -> Result<T, MuxerError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .blocking_send(build(tx))
            .map_err(|_| MuxerError::Closed)?;
        rx.blocking_recv().map_err(|_| MuxerError::Closed)?
    }

    /// Discards the container unless it is already finalized.
    pub async fn abort(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(MuxerCommand::Abort { result: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl TrackSink for MuxerHandle {
    fn add_track(&self, kind: TrackKind, format: MediaFormat) -> Result<TrackId, MuxerError> {
        self.request(|result| MuxerCommand::AddTrack {
            kind,
            format,
            result,
        })
    }

    fn write_sample(&self, track: TrackId, sample: EncodedSample) -> Result<(), MuxerError> {
        self.request(|result| MuxerCommand::WriteSample {
            track,
            sample,
            result,
        })
    }

    fn finish_track(&self, track: TrackId) -> Result<(), MuxerError> {
        self.request(|result| MuxerCommand::FinishTrack { track, result })
            .map(|_| ())
    }

    fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    fn wait_started(&self, cancel: &CancellationToken) -> bool {
        block_until_started(self.started.clone(), cancel)
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
