use std::{
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    audio::AudioEncoder,
    codec::BufferFlags,
    config::{AudioConfig, VideoConfig},
    encoder::{EncoderState, EncoderTask, LoopOptions},
    error::EncoderError,
    format::TrackKind,
    muxer::TrackSink,
    testing::{FakeCodecOptions, FakeFactory, RecordingSink, SinkEvent, rgba_frame},
    video::VideoEncoder,
};

fn options() -> LoopOptions {
    LoopOptions {
        drain_timeout: Duration::from_millis(5),
        max_pending_samples: 64,
    }
}

fn video_task(factory: &FakeFactory, cancel: CancellationToken) -> anyhow::Result<EncoderTask> {
    let encoder = VideoEncoder::new(VideoConfig::new(64, 48));
    Ok(EncoderTask::new(Box::new(encoder), factory, cancel, 16)?)
}

fn audio_task(factory: &FakeFactory) -> anyhow::Result<EncoderTask> {
    let encoder = AudioEncoder::new(AudioConfig::new(44_100, 2));
    Ok(EncoderTask::new(Box::new(encoder), factory, CancellationToken::new(), 16)?)
}

#[tokio::test]
async fn test_video_task_lifecycle() -> anyhow::Result<()> {
    let factory = FakeFactory::default();
    let mut task = video_task(&factory, CancellationToken::new())?;
    assert_eq!(task.state(), EncoderState::Created);
    assert!(task.encode_surface().is_none());

    task.configure()?;
    assert_eq!(task.state(), EncoderState::Configured);
    let surface = task.encode_surface().unwrap();

    let sink = Arc::new(RecordingSink::new(1));
    task.start(sink.clone(), options())?;
    for i in 0..5 {
        surface.draw(rgba_frame(64, 48, i * 33_333))?;
    }
    let summary = task.stop().await?;

    assert_eq!(summary.kind, TrackKind::Video);
    assert_eq!(summary.track, Some(0));
    assert_eq!(summary.samples_written, 5);
    assert_eq!(summary.last_pts_us, Some(133_332));
    assert_eq!(task.state(), EncoderState::Released);

    let events = sink.events();
    assert_eq!(events.first(), Some(&SinkEvent::AddTrack(TrackKind::Video)));
    assert_eq!(events.last(), Some(&SinkEvent::Finish(0)));
    assert_eq!(events.iter().filter(|e| matches!(e, SinkEvent::AddTrack(_))).count(), 1);
    assert_eq!(events.iter().filter(|e| matches!(e, SinkEvent::Finish(_))).count(), 1);
    let pts: Vec<i64> = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Write(0, pts) => Some(*pts),
            _ => None,
        })
        .collect();
    assert_eq!(pts, vec![0, 33_333, 66_666, 99_999, 133_332]);

    let log = factory.codec_log(TrackKind::Video).unwrap();
    assert_eq!(log.surfaces, 1);
    assert_eq!(log.released, 1);
    Ok(())
}

#[tokio::test]
async fn test_audio_chunks_split_across_buffers() -> anyhow::Result<()> {
    let factory = FakeFactory {
        audio: FakeCodecOptions {
            input_buffer_size: 1000,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = audio_task(&factory)?;
    assert!(matches!(
        task.push_frame(Bytes::from_static(&[0; 4]), 0),
        Err(EncoderError::InvalidState { .. })
    ));
    task.configure()?;
    assert!(task.encode_surface().is_none());

    let sink = Arc::new(RecordingSink::new(1));
    task.start(sink.clone(), options())?;
    task.push_frame(Bytes::from(vec![1u8; 2500]), 0)?;
    task.signal_end_of_stream()?;
    let summary = task.stop().await?;
    assert_eq!(summary.samples_written, 3);

    // 1000 bytes of 44.1kHz stereo s16 is 5668us
    let log = factory.codec_log(TrackKind::Audio).unwrap();
    assert_eq!(
        log.inputs,
        vec![
            (1000, 0, BufferFlags::empty()),
            (1000, 5_668, BufferFlags::empty()),
            (500, 11_336, BufferFlags::empty()),
            (0, 11_336, BufferFlags::END_OF_STREAM),
        ]
    );
    assert_eq!(sink.events().last(), Some(&SinkEvent::Finish(0)));
    Ok(())
}

#[tokio::test]
async fn test_surface_encoder_rejects_manual_input() -> anyhow::Result<()> {
    let factory = FakeFactory::default();
    let mut task = video_task(&factory, CancellationToken::new())?;
    task.configure()?;
    assert!(!task.encode_manually());
    assert_eq!(
        task.push_frame(Bytes::from_static(&[0; 4]), 0),
        Err(EncoderError::NotManual)
    );
    assert!(task.input().is_none());
    Ok(())
}

#[tokio::test]
async fn test_samples_held_until_muxer_starts() -> anyhow::Result<()> {
    let factory = FakeFactory::default();
    let mut task = video_task(&factory, CancellationToken::new())?;
    task.configure()?;
    let surface = task.encode_surface().unwrap();

    // a sibling track never registers, so the sink stays stopped
    let sink = Arc::new(RecordingSink::new(2));
    let opts = LoopOptions {
        max_pending_samples: 2,
        ..options()
    };
    task.start(sink.clone(), opts)?;
    for i in 0..5 {
        surface.draw(rgba_frame(64, 48, i * 1_000))?;
    }
    task.signal_end_of_stream()?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!sink.is_started());
    assert_eq!(sink.events(), vec![SinkEvent::AddTrack(TrackKind::Video)]);
    assert_ne!(task.state(), EncoderState::Released);

    sink.force_start();
    let summary = task.wait().await?;
    assert_eq!(summary.dropped_before_start, 3);
    assert_eq!(summary.samples_written, 2);
    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::AddTrack(TrackKind::Video),
            SinkEvent::Write(0, 3_000),
            SinkEvent::Write(0, 4_000),
            SinkEvent::Finish(0),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_end_of_stream_without_format_fails() -> anyhow::Result<()> {
    let factory = FakeFactory::default();
    let cancel = CancellationToken::new();
    let mut task = video_task(&factory, cancel.clone())?;
    task.configure()?;
    let sink = Arc::new(RecordingSink::new(1));
    task.start(sink.clone(), options())?;

    let err = task.stop().await.unwrap_err();
    assert!(matches!(err, EncoderError::CodecFailure(_)), "{err}");
    assert_eq!(task.state(), EncoderState::Failed);
    assert!(cancel.is_cancelled());
    assert!(sink.events().is_empty());
    assert_eq!(factory.codec_log(TrackKind::Video).unwrap().released, 1);
    Ok(())
}

#[tokio::test]
async fn test_codec_failure_cancels_siblings() -> anyhow::Result<()> {
    let factory = FakeFactory {
        video: FakeCodecOptions {
            fail_at_sample: Some(1),
            ..Default::default()
        },
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let mut task = video_task(&factory, cancel.clone())?;
    task.configure()?;
    let surface = task.encode_surface().unwrap();
    task.start(Arc::new(RecordingSink::new(1)), options())?;

    for i in 0..3 {
        surface.draw(rgba_frame(64, 48, i * 1_000))?;
    }
    tokio::time::timeout(Duration::from_secs(5), cancel.cancelled()).await?;

    let err = task.wait().await.unwrap_err();
    assert!(matches!(err, EncoderError::CodecFailure(_)), "{err}");
    assert_eq!(factory.codec_log(TrackKind::Video).unwrap().released, 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_unresponsive_codec() -> anyhow::Result<()> {
    let factory = FakeFactory {
        video: FakeCodecOptions {
            swallow_end_of_stream: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let mut task = video_task(&factory, cancel.clone())?;
    task.configure()?;
    let surface = task.encode_surface().unwrap();
    task.start(Arc::new(RecordingSink::new(1)), options())?;
    surface.draw(rgba_frame(64, 48, 0))?;
    task.signal_end_of_stream()?;

    assert!(
        tokio::time::timeout(Duration::from_millis(100), task.wait())
            .await
            .is_err()
    );
    cancel.cancel();
    assert_eq!(task.wait().await, Err(EncoderError::Cancelled));
    assert_eq!(task.state(), EncoderState::Failed);
    Ok(())
}

#[tokio::test]
async fn test_configure_failure_releases_codec() -> anyhow::Result<()> {
    let factory = FakeFactory::default();
    let encoder = VideoEncoder::new(VideoConfig::new(-4, 48));
    let mut task = EncoderTask::new(Box::new(encoder), &factory, CancellationToken::new(), 16)?;

    assert!(matches!(task.configure(), Err(EncoderError::Configuration(_))));
    assert_eq!(task.state(), EncoderState::Failed);
    assert_eq!(factory.codec_log(TrackKind::Video).unwrap().released, 1);
    assert!(matches!(
        task.start(Arc::new(RecordingSink::new(1)), options()),
        Err(EncoderError::InvalidState { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_codec_creation_failure() {
    let factory = FakeFactory {
        fail_create: vec![TrackKind::Audio],
        ..Default::default()
    };
    let result = audio_task(&factory);
    assert!(result.is_err());
}
