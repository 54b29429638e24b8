use std::time::Duration;

use bytes::Bytes;

use crate::{
    codec::{BufferFlags, Codec, CodecFactory, EncodedSample, OutputEvent},
    config::BitrateMode,
    error::{CodecError, EncoderError, Result},
    format::{MediaFormat, TrackKind, keys},
    surface::Surface,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Started,
    Draining,
    Stopped,
    Released,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configured => "configured",
            SessionState::Started => "started",
            SessionState::Draining => "draining",
            SessionState::Stopped => "stopped",
            SessionState::Released => "released",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DrainEvent {
    FormatChanged(MediaFormat),
    Sample(EncodedSample),
}

/// Owns exactly one codec instance for the lifetime of an encoder.
///
/// The codec is released on every exit path: explicitly through
/// [`CodecSession::release`] or implicitly when the session is dropped.
pub struct CodecSession {
    codec: Box<dyn Codec>,
    mime: String,
    state: SessionState,
    format_reported: bool,
    eos_seen: bool,
    bitrate_mode: Option<BitrateMode>,
}

impl CodecSession {
    pub fn new(codec: Box<dyn Codec>, mime: &str) -> Self {
        Self {
            codec,
            mime: mime.to_string(),
            state: SessionState::Unconfigured,
            format_reported: false,
            eos_seen: false,
            bitrate_mode: None,
        }
    }

    pub fn create(factory: &dyn CodecFactory, mime: &str) -> Result<Self> {
        let codec = factory.create_encoder(mime).map_err(|e| {
            EncoderError::CodecFailure(format!("failed to create {} encoder: {}", mime, e))
        })?;
        Ok(Self::new(codec, mime))
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Rate control the codec accepted, `None` when it runs in its default mode.
    pub fn bitrate_mode(&self) -> Option<BitrateMode> {
        self.bitrate_mode
    }

    pub fn end_of_stream_seen(&self) -> bool {
        self.eos_seen
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(EncoderError::InvalidState {
                expected: expected.name(),
                found: self.state.name(),
            });
        }
        Ok(())
    }

    /// Configures the codec, degrading the rate control if the requested mode
    /// is rejected: requested mode, then variable bitrate, then the codec's
    /// own default. Only a failure of the last attempt is an error.
    pub fn configure(
        &mut self,
        format: &MediaFormat,
        requested: Option<BitrateMode>,
    ) -> Result<Option<BitrateMode>> {
        self.expect_state(SessionState::Unconfigured)?;
        validate_format(format)?;

        let mut attempts = Vec::with_capacity(3);
        if let Some(mode) = requested {
            attempts.push(Some(mode));
            if mode != BitrateMode::VariableBitrate {
                attempts.push(Some(BitrateMode::VariableBitrate));
            }
        }
        attempts.push(None);

        let mut format = format.clone();
        let mut last_error = None;
        for mode in attempts {
            match mode {
                Some(mode) => format.set_integer(keys::BITRATE_MODE, mode.as_format_value()),
                None => {
                    format.remove(keys::BITRATE_MODE);
                }
            }
            match self.codec.configure(&format) {
                Ok(()) => {
                    if mode != requested {
                        log::warn!(
                            "{} encoder configured with fallback bitrate mode {:?} (requested {:?})",
                            self.mime,
                            mode,
                            requested
                        );
                    }
                    log::info!("{} encoder configured: {}", self.mime, format);
                    self.bitrate_mode = mode;
                    self.state = SessionState::Configured;
                    return Ok(mode);
                }
                Err(e) => {
                    log::warn!(
                        "{} encoder rejected bitrate mode {:?}: {}",
                        self.mime,
                        mode,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no configuration attempted".to_string());
        log::error!("failed to configure {} encoder: {}", self.mime, reason);
        Err(EncoderError::Configuration(format!(
            "failed to configure {} encoder: {}",
            self.mime, reason
        )))
    }

    pub fn acquire_input_surface(&mut self) -> Result<Surface> {
        self.expect_state(SessionState::Configured)?;
        Ok(self.codec.create_input_surface()?)
    }

    pub fn start(&mut self) -> Result<()> {
        self.expect_state(SessionState::Configured)?;
        self.codec.start()?;
        self.state = SessionState::Started;
        Ok(())
    }

    fn expect_running(&self) -> Result<()> {
        match self.state {
            SessionState::Started | SessionState::Draining => Ok(()),
            other => Err(EncoderError::InvalidState {
                expected: "started",
                found: other.name(),
            }),
        }
    }

    /// Waits up to `timeout` for a free input slot.
    pub fn acquire_input_buffer(&mut self, timeout: Duration) -> Result<Option<(usize, &mut [u8])>> {
        self.expect_running()?;
        match self.codec.dequeue_input_buffer(timeout)? {
            Some(index) => Ok(Some((index, self.codec.input_buffer(index)?))),
            None => Ok(None),
        }
    }

    pub fn submit_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<()> {
        self.expect_running()?;
        self.codec
            .queue_input_buffer(index, size, presentation_time_us, flags)?;
        Ok(())
    }

    /// Polls the codec for output. The returned iterator ends at the first
    /// empty poll or right after the end-of-stream sample.
    pub fn drain_output(&mut self, timeout: Duration) -> Drain<'_> {
        if self.state == SessionState::Started {
            self.state = SessionState::Draining;
        }
        let done = self.eos_seen || self.state != SessionState::Draining;
        Drain {
            session: self,
            timeout,
            done,
        }
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DrainEvent>> {
        loop {
            match self.codec.dequeue_output_buffer(timeout)? {
                OutputEvent::TryAgainLater => return Ok(None),
                OutputEvent::FormatChanged => {
                    if self.format_reported {
                        return Err(EncoderError::CodecFailure(format!(
                            "{} encoder changed output format twice",
                            self.mime
                        )));
                    }
                    self.format_reported = true;
                    let format = self.codec.output_format()?;
                    log::info!("{} encoder output format: {}", self.mime, format);
                    return Ok(Some(DrainEvent::FormatChanged(format)));
                }
                OutputEvent::Buffer { index, info } => {
                    let data = {
                        let buffer = self.codec.output_buffer(index)?;
                        let end = info.offset + info.size;
                        if end > buffer.len() {
                            return Err(CodecError::InvalidIndex(index).into());
                        }
                        Bytes::copy_from_slice(&buffer[info.offset..end])
                    };
                    self.codec.release_output_buffer(index)?;

                    if info.is_end_of_stream() {
                        self.eos_seen = true;
                    } else if info.is_codec_config() {
                        log::debug!(
                            "{} encoder codec config buffer ({} bytes) skipped",
                            self.mime,
                            info.size
                        );
                        continue;
                    } else if !self.format_reported {
                        return Err(EncoderError::CodecFailure(format!(
                            "{} encoder produced a sample before its output format",
                            self.mime
                        )));
                    }

                    let mut info = info;
                    info.offset = 0;
                    return Ok(Some(DrainEvent::Sample(EncodedSample { data, info })));
                }
            }
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            SessionState::Started | SessionState::Draining => {
                self.state = SessionState::Stopped;
                self.codec.stop()?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stops the codec if it is running and frees it. Idempotent.
    pub fn release(&mut self) {
        if self.state == SessionState::Released {
            return;
        }
        if let Err(e) = self.stop() {
            log::warn!("{} encoder stop error during release: {}", self.mime, e);
        }
        self.codec.release();
        self.state = SessionState::Released;
        log::debug!("{} encoder released", self.mime);
    }
}

fn validate_format(format: &MediaFormat) -> Result<()> {
    let required: &[&str] = match format.kind() {
        Some(TrackKind::Video) => &[keys::WIDTH, keys::HEIGHT],
        Some(TrackKind::Audio) => &[keys::SAMPLE_RATE, keys::CHANNEL_COUNT],
        None => {
            return Err(EncoderError::Configuration(format!(
                "unsupported mime type {}",
                format.mime()
            )));
        }
    };
    for key in required {
        match format.integer(key) {
            Some(value) if value > 0 => {}
            other => {
                return Err(EncoderError::Configuration(format!(
                    "invalid {} for {}: {:?}",
                    key,
                    format.mime(),
                    other
                )));
            }
        }
    }
    Ok(())
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct Drain<'a> {
    session: &'a mut CodecSession,
    timeout: Duration,
    done: bool,
}

impl Iterator for Drain<'_> {
    type Item = Result<DrainEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.session.next_event(self.timeout) {
            Ok(Some(event)) => {
                if self.session.eos_seen {
                    self.done = true;
                }
                Some(Ok(event))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
