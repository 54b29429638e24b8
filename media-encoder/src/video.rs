use crate::{
    codec::EncodedSample,
    config::VideoConfig,
    encoder::Encoder,
    error::Result,
    format::{MIME_VIDEO_AVC, MediaFormat, TrackKind, keys},
    muxer::{TrackId, TrackSink},
    session::CodecSession,
    surface::Surface,
};

/// H.264 encoder fed through an input surface.
pub struct VideoEncoder {
    config: VideoConfig,
    surface: Option<Surface>,
}

impl VideoEncoder {
    pub fn new(config: VideoConfig) -> Self {
        Self {
            config,
            surface: None,
        }
    }

    pub fn config(&self) -> &VideoConfig {
        &self.config
    }

    /// Format requested from the codec, without a rate-control mode.
    pub fn build_format(&self) -> MediaFormat {
        let mut format = MediaFormat::video(MIME_VIDEO_AVC, self.config.width, self.config.height);
        format.set_integer(keys::BIT_RATE, self.config.effective_bitrate() as i64);
        format.set_integer(keys::FRAME_RATE, self.config.frame_rate as i64);
        format.set_integer(
            keys::I_FRAME_INTERVAL,
            self.config.key_frame_interval_secs as i64,
        );
        format.set_integer(keys::COLOR_FORMAT, self.config.color_format.as_format_value());
        format
    }
}

impl Encoder for VideoEncoder {
    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn encode_type(&self) -> &'static str {
        MIME_VIDEO_AVC
    }

    fn config_encoder(&mut self, session: &mut CodecSession) -> Result<()> {
        self.config.validate()?;
        let format = self.build_format();
        let mode = session.configure(&format, Some(self.config.bitrate_mode))?;
        if mode.is_none() {
            log::warn!(
                "video encoder running with codec default rate control at {} bps",
                self.config.effective_bitrate()
            );
        }
        self.surface = Some(session.acquire_input_surface()?);
        Ok(())
    }

    fn add_track(&self, sink: &dyn TrackSink, format: MediaFormat) -> Result<TrackId> {
        Ok(sink.add_track(TrackKind::Video, format)?)
    }

    fn write_data(
        &self,
        sink: &dyn TrackSink,
        track: TrackId,
        sample: EncodedSample,
    ) -> Result<()> {
        Ok(sink.write_sample(track, sample)?)
    }

    fn release(&self, sink: &dyn TrackSink, track: TrackId) -> Result<()> {
        Ok(sink.finish_track(track)?)
    }

    fn encode_manually(&self) -> bool {
        false
    }

    fn encode_surface(&self) -> Option<Surface> {
        self.surface.clone()
    }
}
