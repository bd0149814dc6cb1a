use std::{io::Write, time::Duration};

use ingest::{
    demux::{ContainerFormat, Demuxer, EsUnit, TrackKind},
    packet::CodecDescriptor,
    EndReason, IngestConfig, Player,
};

use crate::{
    common::{self, ts::TsOptions, SYNC_SAMPLE_FLAGS},
    AssertWrapper,
};

fn ts_file(options: TsOptions) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".ts")
        .tempfile()
        .assert_success();
    file.write_all(&common::ts::stream(options)).assert_success();
    file.flush().assert_success();
    file
}

#[tokio::test]
async fn transport_stream_file_end_to_end() -> anyhow::Result<()> {
    common::init_logging();
    let file = ts_file(TsOptions::default());

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(file.path().to_str().unwrap()).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    assert_eq!(recorded.early_fragments, 0);

    let (codecs, init) = recorded.init.expect("no init segment");
    assert_eq!(codecs.len(), 2);
    assert!(codecs[0].is_video());
    assert!(matches!(&codecs[1], CodecDescriptor::Audio(_)));
    assert_eq!(init.mime, r#"video/mp4; codecs="avc1.42c01e, mp4a.40.2""#);
    assert!(common::child(&init.bytes, "ftyp").is_some());
    assert!(common::child(&init.bytes, "moov").is_some());

    // key frames every 10 of 50 frames
    assert!(recorded.fragments.len() >= 4, "{} fragments", recorded.fragments.len());
    for (i, fragment) in recorded.fragments.iter().enumerate() {
        assert_eq!(fragment.sequence, i as u32 + 1);
        assert_eq!(
            common::first_sample_flags(&fragment.bytes, 1),
            Some(SYNC_SAMPLE_FLAGS),
            "fragment {} does not start at a key frame",
            fragment.sequence
        );
    }
    for pair in recorded.fragments.windows(2) {
        assert!(pair[0].decode_time < pair[1].decode_time);
    }
    assert!(recorded
        .fragments
        .iter()
        .any(|f| common::track_ids(&f.bytes).contains(&2)));

    player.stop().await;
    Ok(())
}

#[tokio::test]
async fn video_only_file() -> anyhow::Result<()> {
    let file = ts_file(TsOptions {
        video_frames: 20,
        gop: 5,
        audio: false,
    });

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(file.path().to_str().unwrap()).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)));
    let (codecs, init) = recorded.init.unwrap();
    assert_eq!(codecs.len(), 1);
    assert_eq!(init.mime, r#"video/mp4; codecs="avc1.42c01e""#);
    assert_eq!(recorded.fragments.len(), 4);
    for fragment in &recorded.fragments {
        assert_eq!(common::track_ids(&fragment.bytes), vec![1]);
    }
    Ok(())
}

#[tokio::test]
async fn missing_file_fails_dial() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("missing.flv");

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(path.to_str().unwrap()).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;

    assert!(recorded.init.is_none());
    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(ingest::IngestError::Dial(_))
    ));
    Ok(())
}

#[tokio::test]
async fn truncated_file_fails_negotiation() -> anyhow::Result<()> {
    let stream = common::ts::stream(TsOptions::default());
    let mut file = tempfile::Builder::new().suffix(".ts").tempfile()?;
    // tables only
    file.write_all(&stream[..188 * 2])?;
    file.flush()?;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(file.path().to_str().unwrap()).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;

    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(ingest::IngestError::Negotiation(_))
    ));
    Ok(())
}

#[tokio::test]
async fn progressive_mp4_file() -> anyhow::Result<()> {
    common::init_logging();
    let mut file = tempfile::Builder::new().suffix(".mp4").tempfile()?;
    file.write_all(&common::mp4::progressive(50, 10))?;
    file.flush()?;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(file.path().to_str().unwrap()).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    let (codecs, init) = recorded.init.expect("no init segment");
    assert_eq!(codecs.len(), 2);
    assert_eq!(init.mime, r#"video/mp4; codecs="avc1.42c01e, mp4a.40.2""#);
    assert_eq!(recorded.fragments.len(), 5);
    for fragment in &recorded.fragments {
        assert_eq!(
            common::first_sample_flags(&fragment.bytes, 1),
            Some(SYNC_SAMPLE_FLAGS)
        );
    }
    Ok(())
}

#[tokio::test]
async fn corrupt_mp4_file_fails_negotiation() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".mp4").tempfile()?;
    // a free box, then a moov claiming a 64 bit size past the end
    file.write_all(&[0, 0, 0, 8, b'f', b'r', b'e', b'e'])?;
    file.write_all(&[0, 0, 0, 1, b'm', b'o', b'o', b'v'])?;
    file.write_all(&u64::MAX.to_be_bytes())?;
    file.flush()?;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(file.path().to_str().unwrap()).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;

    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(ingest::IngestError::Negotiation(_))
    ));
    Ok(())
}

#[test]
fn transport_stream_in_small_chunks() {
    let stream = common::ts::stream(TsOptions::default());
    let mut demuxer = Demuxer::new(ContainerFormat::Ts).assert_success();
    let mut units = Vec::new();
    for chunk in stream.chunks(7) {
        demuxer.push(chunk, &mut units).assert_success();
    }
    demuxer.finish(&mut units).assert_success();

    let declared = units
        .iter()
        .filter_map(|u| match u {
            EsUnit::Declare { track, kind } => Some((*track, *kind)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        declared,
        vec![
            (common::ts::VIDEO_PID as u32, TrackKind::Video),
            (common::ts::AUDIO_PID as u32, TrackKind::Audio)
        ]
    );

    let video = units
        .iter()
        .filter_map(|u| match u {
            EsUnit::Video { dts, nalus, .. } => Some((*dts, nalus.len())),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(video.len(), 50);
    // 126000 ticks at 90 kHz, then one frame every 40 ms
    assert_eq!(video[0].0, Duration::from_millis(1400));
    assert_eq!(video[1].0, Duration::from_millis(1440));
    // AUD, SPS, PPS and IDR
    assert_eq!(video[0].1, 4);
    assert!(units.iter().any(|u| matches!(u, EsUnit::AudioConfig { .. })));
}
