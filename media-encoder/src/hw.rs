//! Hardware-accelerated encoder discovery.
//!
//! Maps the mime types the encoders request to FFmpeg encoder names and finds
//! hardware encoders (NVENC/VAAPI/QSV/V4L2M2M) with fallback to software.

use ffmpeg_next::format::Pixel;

use crate::format::{MIME_AUDIO_AAC, MIME_AUDIO_OPUS, MIME_VIDEO_AVC, MIME_VIDEO_HEVC};

/// Software encoder used for `mime` when no hardware encoder opens.
pub fn software_encoder(mime: &str) -> Option<&'static str> {
    match mime {
        MIME_VIDEO_AVC => Some("libx264"),
        MIME_VIDEO_HEVC => Some("libx265"),
        MIME_AUDIO_AAC => Some("aac"),
        MIME_AUDIO_OPUS => Some("libopus"),
        _ => None,
    }
}

/// Try to find a hardware-accelerated encoder for the given software codec name.
/// Returns the first available hardware encoder, or None if none is found.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_encoder(codec_name: &str) -> bool {
    codec_name.contains("nvenc")
        || codec_name.contains("vaapi")
        || codec_name.contains("qsv")
        || codec_name.contains("v4l2m2m")
}

/// Hardware encoders commonly prefer NV12, software ones YUV420P.
pub fn pixel_format_for_encoder(codec_name: &str) -> Pixel {
    if is_hw_encoder(codec_name) {
        Pixel::NV12
    } else {
        Pixel::YUV420P
    }
}

/// Only the x264/x265 software encoders expose a constant quality knob.
pub fn supports_constant_quality(codec_name: &str) -> bool {
    matches!(codec_name, "libx264" | "libx265")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_encoder_by_mime() {
        assert_eq!(software_encoder(MIME_VIDEO_AVC), Some("libx264"));
        assert_eq!(software_encoder(MIME_AUDIO_AAC), Some("aac"));
        assert_eq!(software_encoder("video/x-vnd.on2.vp8"), None);
    }

    #[test]
    fn test_hw_encoder_pixel_format() {
        assert!(is_hw_encoder("h264_vaapi"));
        assert!(!is_hw_encoder("libx264"));
        assert_eq!(pixel_format_for_encoder("hevc_nvenc"), Pixel::NV12);
        assert_eq!(pixel_format_for_encoder("libx265"), Pixel::YUV420P);
        assert!(!supports_constant_quality("h264_qsv"));
    }
}
