//! FFmpeg container writer.

use std::path::{Path, PathBuf};

use ffmpeg_next::{Dictionary, Packet, Rational, codec, ffi, media};

use crate::{
    codec::SampleInfo,
    format::{MIME_AUDIO_AAC, MIME_AUDIO_OPUS, MIME_VIDEO_AVC, MIME_VIDEO_HEVC, MediaFormat, TrackKind, keys},
    writer::ContainerWriter,
};

const MICROSECONDS: Rational = Rational(1, 1_000_000);

fn codec_id(mime: &str) -> Option<codec::Id> {
    match mime {
        MIME_VIDEO_AVC => Some(codec::Id::H264),
        MIME_VIDEO_HEVC => Some(codec::Id::HEVC),
        MIME_AUDIO_AAC => Some(codec::Id::AAC),
        MIME_AUDIO_OPUS => Some(codec::Id::OPUS),
        _ => None,
    }
}

/// Pixel format recorded by the encoder, YUV420P when absent.
fn video_pixel_format(format: &MediaFormat) -> i32 {
    format
        .integer(keys::PIXEL_FORMAT)
        .map(|v| v as i32)
        .unwrap_or(ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32)
}

/// Writes encoded samples into a file whose container is picked from the
/// path's extension. Sample times are microseconds.
pub struct FileWriter {
    path: PathBuf,
    inner: Option<ffmpeg_next::format::context::Output>,
    tracks: usize,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl FileWriter {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let output = ffmpeg_next::format::output(&path)?;
        Ok(Self {
            path,
            inner: Some(output),
            tracks: 0,
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn output(&mut self) -> anyhow::Result<&mut ffmpeg_next::format::context::Output> {
        self.inner
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("output {} already released", self.path.display()))
    }
}

/// Fills the stream's codec parameters straight from the track format; the
/// encoder context that produced the samples lives in another thread.
unsafe fn set_parameters(
    par: *mut ffi::AVCodecParameters,
    id: codec::Id,
    format: &MediaFormat,
) -> anyhow::Result<()> {
    let kind = format
        .kind()
        .ok_or_else(|| anyhow::anyhow!("unknown media type {}", format.mime()))?;
    unsafe {
        (*par).codec_id = id.into();
        match kind {
            TrackKind::Video => {
                (*par).codec_type = media::Type::Video.into();
                (*par).width = format.integer(keys::WIDTH).unwrap_or(0) as i32;
                (*par).height = format.integer(keys::HEIGHT).unwrap_or(0) as i32;
                (*par).format = video_pixel_format(format);
            }
            TrackKind::Audio => {
                (*par).codec_type = media::Type::Audio.into();
                (*par).sample_rate = format.integer(keys::SAMPLE_RATE).unwrap_or(0) as i32;
                let channels = format.integer(keys::CHANNEL_COUNT).unwrap_or(0) as i32;
                ffi::av_channel_layout_default(&mut (*par).ch_layout, channels);
                (*par).format = ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32;
                if let Some(frame_size) = format.integer("frame-size") {
                    (*par).frame_size = frame_size as i32;
                }
            }
        }
        if let Some(bitrate) = format.integer(keys::BIT_RATE) {
            (*par).bit_rate = bitrate;
        }

        if let Some(extradata) = format.bytes(keys::CSD_0) {
            let len = extradata.len();
            let buf = ffi::av_mallocz(len + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
            anyhow::ensure!(!buf.is_null(), "failed to allocate codec extradata");
            std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, len);
            (*par).extradata = buf;
            (*par).extradata_size = len as i32;
        }
    }
    Ok(())
}

impl ContainerWriter for FileWriter {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize> {
        anyhow::ensure!(!self.have_written_header, "tracks must be added before start");
        let id = codec_id(format.mime())
            .ok_or_else(|| anyhow::anyhow!("no container mapping for {}", format.mime()))?;
        let output = self.output()?;
        let mut stream = output.add_stream(ffmpeg_next::encoder::find(id))?;
        stream.set_time_base(MICROSECONDS);
        unsafe {
            let par = (*stream.as_mut_ptr()).codecpar;
            set_parameters(par, id, format)?;
        }
        let index = stream.index();
        self.tracks += 1;
        log::debug!("{}: track {} added ({})", self.path.display(), index, format.mime());
        Ok(index)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.tracks > 0, "no tracks added");
        if self.have_written_header {
            return Ok(());
        }
        let mut opts = Dictionary::new();
        opts.set("movflags", "+faststart");
        self.output()?.write_header_with(opts)?;
        self.have_written_header = true;
        Ok(())
    }

    fn write_sample_data(
        &mut self,
        track_index: usize,
        data: &[u8],
        info: &SampleInfo,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(self.have_written_header, "write before start");
        let output = self.output()?;
        let time_base = output
            .stream(track_index)
            .ok_or_else(|| anyhow::anyhow!("stream {} not found", track_index))?
            .time_base();

        let mut packet = Packet::copy(data);
        packet.set_stream(track_index);
        packet.set_position(-1);
        packet.set_pts(Some(info.presentation_time_us));
        packet.set_dts(Some(info.presentation_time_us));
        if info.is_key_frame() {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        packet.rescale_ts(MICROSECONDS, time_base);
        packet.write_interleaved(output)?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.output()?.write_trailer()?;
            log::info!("{} finalized", self.path.display());
        }
        Ok(())
    }

    fn release(&mut self) {
        self.inner = None;
    }

    fn discard(&mut self) -> anyhow::Result<()> {
        self.inner = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
