use std::path::PathBuf;

use clap::Parser;
use media_encoder::{AudioConfig, VideoConfig};

use crate::config::RecorderConfig;

mod config;
mod source;

/**
    Records a synthetic test pattern, and optionally a tone, into a container file.
*/
#[derive(Parser)]
#[command(name = "lite-recorder")]
struct Cli {
    /// JSON config file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output file, the extension picks the container.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    width: Option<i32>,

    #[arg(long)]
    height: Option<i32>,

    #[arg(long)]
    fps: Option<u32>,

    /// Video bitrate in bits per second; defaults to 3 * width * height.
    #[arg(long)]
    bitrate: Option<u32>,

    /// Recording length in seconds.
    #[arg(short, long)]
    seconds: Option<u32>,

    /// Also record a sine tone.
    #[arg(long)]
    audio: bool,

    #[arg(long)]
    sample_rate: Option<u32>,

    #[arg(long)]
    channels: Option<u32>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RecorderConfig> {
        let mut config = match &self.config {
            Some(path) => RecorderConfig::load(path)?,
            None => RecorderConfig::default(),
        };
        if let Some(output) = self.output {
            config.pipeline.output = output;
        }
        if let Some(seconds) = self.seconds {
            config.seconds = seconds;
        }

        let video = config.pipeline.video.get_or_insert_with(VideoConfig::default);
        if let Some(width) = self.width {
            video.width = width;
        }
        if let Some(height) = self.height {
            video.height = height;
        }
        if let Some(fps) = self.fps {
            video.frame_rate = fps;
        }
        if self.bitrate.is_some() {
            video.bitrate = self.bitrate;
        }

        if self.audio || self.sample_rate.is_some() || self.channels.is_some() {
            let audio = config.pipeline.audio.get_or_insert_with(AudioConfig::default);
            if let Some(sample_rate) = self.sample_rate {
                audio.sample_rate = sample_rate;
            }
            if let Some(channels) = self.channels {
                audio.channel_count = channels;
            }
        }
        Ok(config)
    }
}

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("media_encoder", log::LevelFilter::Debug)
        .filter_module("lite_recorder", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = Cli::parse().into_config()?;
    log::info!(
        "recording {}s to {}",
        config.seconds,
        config.pipeline.output.display()
    );
    record::run(config).await
}

#[cfg(not(feature = "ffmpeg"))]
mod record {
    use crate::config::RecorderConfig;

    pub async fn run(config: RecorderConfig) -> anyhow::Result<()> {
        log::debug!("{}", serde_json::to_string_pretty(&config)?);
        anyhow::bail!("lite-recorder was built without the `ffmpeg` feature, no encoder available")
    }
}

#[cfg(feature = "ffmpeg")]
mod record {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use anyhow::Context;
    use media_encoder::{
        Pipeline, Surface,
        encoder::FrameInput,
        ffmpeg::FfmpegCodecFactory,
        output::FileWriter,
    };
    use tokio_util::sync::CancellationToken;

    use crate::{
        config::RecorderConfig,
        source::{TestPattern, Tone},
    };

    struct Inputs {
        surface: Option<Surface>,
        audio: Option<FrameInput>,
    }

    /// Feeds frames in real time until `seconds` elapsed or `cancel` fires.
    fn produce(config: &RecorderConfig, inputs: &Inputs, cancel: &CancellationToken) -> anyhow::Result<u64> {
        let fps = config.pipeline.video.as_ref().map(|v| v.frame_rate).unwrap_or(30).max(1);
        let mut pattern = config
            .pipeline
            .video
            .as_ref()
            .map(|v| TestPattern::new(v.width as u32, v.height as u32, fps));
        let mut tone = config
            .pipeline
            .audio
            .as_ref()
            .map(|a| (Tone::new(a.sample_rate, a.channel_count, config.tone_hz), (a.sample_rate / fps) as usize));

        let total = config.seconds as u64 * fps as u64;
        let frame = Duration::from_secs(1) / fps;
        let started = Instant::now();
        for i in 0..total {
            if cancel.is_cancelled() {
                return Ok(i);
            }
            if let (Some(surface), Some(pattern)) = (&inputs.surface, pattern.as_mut()) {
                surface.draw(pattern.next_frame())?;
            }
            if let (Some(input), Some((tone, samples))) = (&inputs.audio, tone.as_mut()) {
                let (data, pts) = tone.next_chunk(*samples);
                input.push_frame(data, pts)?;
            }
            if let Some(wait) = (started + frame * (i as u32 + 1)).checked_duration_since(Instant::now()) {
                std::thread::sleep(wait);
            }
        }
        Ok(total)
    }

    pub async fn run(config: RecorderConfig) -> anyhow::Result<()> {
        media_encoder::init()?;
        let writer = FileWriter::new(&config.pipeline.output)
            .with_context(|| format!("opening {}", config.pipeline.output.display()))?;
        let mut pipeline = Pipeline::new(
            config.pipeline.clone(),
            Arc::new(FfmpegCodecFactory),
            Box::new(writer),
        );
        pipeline.start().await.context("starting pipeline")?;

        let inputs = Inputs {
            surface: pipeline.video_surface(),
            audio: pipeline.audio_input(),
        };
        let audio = inputs.audio.clone();
        let cancel = CancellationToken::new();
        let producer_cancel = cancel.clone();
        let mut producer = tokio::task::spawn_blocking(move || produce(&config, &inputs, &producer_cancel));

        let finished = tokio::select! {
            r = &mut producer => Some(r),
            _ = tokio::signal::ctrl_c() => {
                log::warn!("interrupted, finishing recording");
                None
            }
            _ = pipeline.cancelled() => None,
        };
        let produced = match finished {
            Some(r) => r,
            None => {
                cancel.cancel();
                producer.await
            }
        };

        if let Some(audio) = audio {
            if let Err(e) = audio.signal_end_of_stream() {
                log::warn!("audio end of stream failed: {}", e);
            }
        }
        let summary = pipeline.stop().await.context("stopping pipeline")?;
        let frames = produced.context("producer task panicked")??;
        log::info!("{} frames produced", frames);
        for track in &summary.tracks {
            log::info!(
                "{} track: {} samples, {} bytes, last pts {:?}us",
                track.kind,
                track.samples_written,
                track.bytes_written,
                track.last_pts_us
            );
        }
        log::info!("wrote {}", summary.output.display());
        Ok(())
    }
}
