use crate::{
    codec::EncodedSample,
    config::AudioConfig,
    encoder::Encoder,
    error::Result,
    format::{MIME_AUDIO_AAC, MediaFormat, TrackKind, keys},
    muxer::{TrackId, TrackSink},
    session::CodecSession,
};

/// Largest input chunk accepted by the codec, as a fraction of a second.
const MAX_INPUT_DIVISOR: u64 = 10;

/// AAC encoder fed with interleaved 16-bit PCM through manual input buffers.
pub struct AudioEncoder {
    config: AudioConfig,
}

impl AudioEncoder {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn build_format(&self) -> MediaFormat {
        let mut format = MediaFormat::audio(
            MIME_AUDIO_AAC,
            self.config.sample_rate,
            self.config.channel_count,
        );
        format.set_integer(keys::BIT_RATE, self.config.bitrate as i64);
        format.set_integer(keys::AAC_PROFILE, self.config.aac_profile);
        format.set_integer(
            keys::MAX_INPUT_SIZE,
            (self.config.bytes_per_second() / MAX_INPUT_DIVISOR) as i64,
        );
        format
    }
}

impl Encoder for AudioEncoder {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn encode_type(&self) -> &'static str {
        MIME_AUDIO_AAC
    }

    fn config_encoder(&mut self, session: &mut CodecSession) -> Result<()> {
        self.config.validate()?;
        session.configure(&self.build_format(), None)?;
        Ok(())
    }

    fn add_track(&self, sink: &dyn TrackSink, format: MediaFormat) -> Result<TrackId> {
        Ok(sink.add_track(TrackKind::Audio, format)?)
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
        true
    }

    fn input_duration_us(&self, bytes: usize) -> i64 {
        let rate = self.config.bytes_per_second();
        if rate == 0 {
            return 0;
        }
        (bytes as u64 * 1_000_000 / rate) as i64
    }
}
