//! Error types shared by the session, encoders, muxer and pipeline.

use thiserror::Error;

use crate::{
    config::BitrateMode,
    format::TrackKind,
    muxer::TrackId,
};

/// Errors reported by a [`Codec`](crate::codec::Codec) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The codec rejected the requested rate-control mode. Recoverable.
    #[error("bitrate mode {0:?} is not supported by this codec")]
    BitrateModeUnsupported(BitrateMode),

    #[error("codec configuration rejected: {0}")]
    Configuration(String),

    #[error("codec runtime error: {0}")]
    Runtime(String),

    #[error("invalid buffer index {0}")]
    InvalidIndex(usize),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Ordering and writer errors from the [`TrackMuxer`](crate::muxer::TrackMuxer).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MuxerError {
    #[error("muxer has not started, {registered}/{expected} tracks registered")]
    NotStarted { registered: usize, expected: usize },

    #[error("{0} track already registered")]
    DuplicateTrack(TrackKind),

    #[error("{kind} track exceeds the {expected} expected tracks")]
    UnexpectedTrack { kind: TrackKind, expected: usize },

    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("track {0} already finished")]
    TrackFinished(TrackId),

    #[error("container writer error: {0}")]
    Writer(String),

    #[error("muxer is closed")]
    Closed,
}

/// Errors surfaced by encoders and the pipeline coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncoderError {
    /// Invalid geometry or format, fatal to the encoder instance.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Runtime failure of the underlying codec, fatal to the pipeline.
    #[error("codec failure: {0}")]
    CodecFailure(String),

    #[error(transparent)]
    Muxer(#[from] MuxerError),

    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("input surface is closed")]
    SurfaceClosed,

    #[error("encoder does not accept manual input")]
    NotManual,

    #[error("encoding cancelled")]
    Cancelled,

    #[error("encoders did not reach end of stream in time")]
    StopTimeout,
}

impl From<CodecError> for EncoderError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Configuration(msg) => EncoderError::Configuration(msg),
            other => EncoderError::CodecFailure(other.to_string()),
        }
    }
}

pub type Result<T, E = EncoderError> = std::result::Result<T, E>;
