use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    audio::AudioEncoder,
    codec::CodecFactory,
    config::{EncoderConfig, PipelineConfig},
    encoder::{Encoder, EncoderTask, FrameInput, LoopOptions, TrackSummary},
    error::{EncoderError, MuxerError, Result},
    format::TrackKind,
    muxer::{MuxerHandle, MuxerReport, TrackMuxer, TrackSink},
    surface::Surface,
    video::VideoEncoder,
    writer::ContainerWriter,
};

/// How long a cancelled worker may take to exit before it is detached.
const WORKER_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Finished,
    Failed,
}

/// Outcome of a finalized recording.
#[derive(Clone, Debug)]
pub struct RecordingSummary {
    pub output: PathBuf,
    pub tracks: Vec<TrackSummary>,
    pub muxer: MuxerReport,
}

impl RecordingSummary {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackSummary> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Owns every encoder of a recording plus the muxer they share, and starts
/// and stops them as one unit.
pub struct Pipeline {
    config: PipelineConfig,
    factory: Arc<dyn CodecFactory>,
    writer: Option<Box<dyn ContainerWriter>>,
    encoders: Vec<EncoderTask>,
    muxer: Option<(MuxerHandle, JoinHandle<MuxerReport>)>,
    cancel: CancellationToken,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        factory: Arc<dyn CodecFactory>,
        writer: Box<dyn ContainerWriter>,
    ) -> Self {
        Self {
            config,
            factory,
            writer: Some(writer),
            encoders: Vec::new(),
            muxer: None,
            cancel: CancellationToken::new(),
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// True once any worker failed or the pipeline was torn down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when a worker fails; use it to stop feeding input early.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    fn build_encoder(config: EncoderConfig) -> Box<dyn Encoder> {
        match config {
            EncoderConfig::Video(video) => Box::new(VideoEncoder::new(video)),
            EncoderConfig::Audio(audio) => Box::new(AudioEncoder::new(audio)),
        }
    }

    /// Drops an unused writer along with whatever it already created.
    fn discard_writer(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.release();
            if let Err(e) = writer.discard() {
                log::error!("failed to discard {}: {:#}", self.config.output.display(), e);
            }
        }
    }

    /// Configures every encoder, then spawns the muxer and the workers.
    /// No track reaches the container writer until all encoders configured;
    /// a failed start discards the output.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(EncoderError::InvalidState {
                expected: "idle",
                found: state_name(self.state),
            });
        }
        let configs = self.config.encoders();
        if configs.is_empty() {
            self.discard_writer();
            self.state = PipelineState::Failed;
            return Err(EncoderError::Configuration(
                "no video or audio track configured".to_string(),
            ));
        }

        let mut tasks = Vec::with_capacity(configs.len());
        for config in configs {
            let encoder = Self::build_encoder(config);
            let configured = EncoderTask::new(
                encoder,
                self.factory.as_ref(),
                self.cancel.clone(),
                self.config.input_queue_bound,
            )
            .and_then(|mut task| task.configure().map(|_| task));
            match configured {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    // dropping the configured siblings releases their codecs
                    drop(tasks);
                    self.discard_writer();
                    self.state = PipelineState::Failed;
                    log::error!("pipeline configuration failed: {}", e);
                    return Err(e);
                }
            }
        }

        let Some(writer) = self.writer.take() else {
            return Err(EncoderError::InvalidState {
                expected: "idle",
                found: "finished",
            });
        };
        let (handle, join) = MuxerHandle::spawn(TrackMuxer::new(writer, tasks.len()));
        let sink: Arc<dyn TrackSink> = Arc::new(handle.clone());
        let options = LoopOptions {
            drain_timeout: self.config.drain_timeout(),
            max_pending_samples: self.config.max_pending_samples,
        };

        self.muxer = Some((handle, join));
        let mut start_error = None;
        for task in tasks.iter_mut() {
            if let Err(e) = task.start(sink.clone(), options) {
                start_error = Some(e);
                break;
            }
        }
        self.encoders = tasks;
        drop(sink);
        if let Some(e) = start_error {
            self.teardown().await;
            return Err(e);
        }
        self.state = PipelineState::Running;
        log::info!(
            "pipeline started: {} tracks -> {}",
            self.encoders.len(),
            self.config.output.display()
        );
        Ok(())
    }

    fn encoder(&self, kind: TrackKind) -> Option<&EncoderTask> {
        self.encoders.iter().find(|e| e.kind() == kind)
    }

    /// Drawable target of the video encoder.
    pub fn video_surface(&self) -> Option<Surface> {
        self.encoder(TrackKind::Video)?.encode_surface()
    }

    /// PCM input of the audio encoder. The owner must signal end of stream
    /// on it before [`Pipeline::stop`] can complete.
    pub fn audio_input(&self) -> Option<FrameInput> {
        self.encoder(TrackKind::Audio)?.input()
    }

    /// Cancels the workers, waits a bounded time for them and discards the
    /// output. Workers stuck inside their codec are detached.
    async fn teardown(&mut self) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + WORKER_GRACE;
        for task in self.encoders.iter_mut() {
            if tokio::time::timeout_at(deadline, task.wait()).await.is_err() {
                task.detach();
            }
        }
        if let Some((handle, join)) = self.muxer.take() {
            handle.abort().await;
            drop(handle);
            if let Err(e) = join.await {
                log::error!("muxer task failed: {}", e);
            }
        }
        self.state = PipelineState::Failed;
    }

    /// Ends every surface-driven stream, waits for all tracks to drain and
    /// returns once the container is finalized. Manual inputs must already
    /// have been given their end of stream.
    ///
    /// Any worker failure, or a drain exceeding `stop_timeout`, discards the
    /// output instead.
    pub async fn stop(&mut self) -> Result<RecordingSummary> {
        if self.state != PipelineState::Running {
            return Err(EncoderError::InvalidState {
                expected: "running",
                found: state_name(self.state),
            });
        }
        self.state = PipelineState::Stopping;
        log::info!("pipeline stopping");

        for task in self.encoders.iter().filter(|t| !t.encode_manually()) {
            if let Err(e) = task.signal_end_of_stream() {
                log::warn!("{} end of stream failed: {}", task.kind(), e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_timeout();
        let mut results = Vec::with_capacity(self.encoders.len());
        let mut stalled = None;
        for task in self.encoders.iter_mut() {
            match tokio::time::timeout_at(deadline, task.wait()).await {
                Ok(result) => results.push(result),
                Err(_) => {
                    stalled = Some(task.kind());
                    break;
                }
            }
        }
        if let Some(kind) = stalled {
            log::error!(
                "{} encoder did not reach end of stream within {:?}, discarding output",
                kind,
                self.config.stop_timeout()
            );
            self.teardown().await;
            return Err(EncoderError::StopTimeout);
        }

        if let Some(e) = first_failure(&results) {
            log::error!("pipeline failed, discarding output: {}", e);
            self.teardown().await;
            return Err(e);
        }

        let Some((handle, join)) = self.muxer.take() else {
            self.state = PipelineState::Failed;
            return Err(EncoderError::InvalidState {
                expected: "running",
                found: "failed",
            });
        };
        drop(handle);
        let report = join
            .await
            .map_err(|e| EncoderError::CodecFailure(format!("muxer task failed: {}", e)))?;
        if !report.finalized {
            self.state = PipelineState::Failed;
            return Err(EncoderError::Muxer(MuxerError::Writer(
                "container was not finalized".to_string(),
            )));
        }

        let tracks = results.into_iter().filter_map(|r| r.ok()).collect();
        self.state = PipelineState::Finished;
        log::info!("pipeline finished: {}", self.config.output.display());
        Ok(RecordingSummary {
            output: self.config.output.clone(),
            tracks,
            muxer: report,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // workers exit and the muxer aborts once its handles are gone
        self.cancel.cancel();
    }
}

/// Prefers the root cause over the cancellations it triggered in siblings.
fn first_failure(results: &[Result<TrackSummary>]) -> Option<EncoderError> {
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(_) => {}
            Err(EncoderError::Cancelled) => cancelled = Some(EncoderError::Cancelled),
            Err(e) => return Some(e.clone()),
        }
    }
    cancelled
}

fn state_name(state: PipelineState) -> &'static str {
    match state {
        PipelineState::Idle => "idle",
        PipelineState::Running => "running",
        PipelineState::Stopping => "stopping",
        PipelineState::Finished => "finished",
        PipelineState::Failed => "failed",
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
