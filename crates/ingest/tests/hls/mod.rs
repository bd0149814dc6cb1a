use std::time::Duration;

use ingest::{EndReason, IngestConfig, IngestError, Player, TransportKind};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::common::{self, ts::TsOptions, SYNC_SAMPLE_FLAGS};

const PACKET_SIZE: usize = 188;

trait HlsMock {
    async fn mock<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>;
}

impl HlsMock for MockServer {
    async fn mock<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>,
    {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(self)
            .await;
        self
    }
}

fn media_playlist(segments: &[&str], media_sequence: u64, ended: bool) -> String {
    let mut playlist = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"
    );
    for segment in segments {
        playlist.push_str(&format!("#EXTINF:1.0,\n{segment}\n"));
    }
    if ended {
        playlist.push_str("#EXT-X-ENDLIST\n");
    }
    playlist
}

/// Splits a stream at a packet boundary inside the first video access unit,
/// so its parameter sets only complete with the second segment.
fn split_stream() -> (Vec<u8>, Vec<u8>) {
    let mut stream = common::ts::stream(TsOptions::default());
    let tail = stream.split_off(PACKET_SIZE * 3);
    (stream, tail)
}

#[tokio::test]
async fn master_playlist_to_variant() -> anyhow::Result<()> {
    common::init_logging();
    let server = MockServer::start().await;
    let (head, tail) = split_stream();
    server
        .mock(
            "/master.m3u8",
            "#EXTM3U\n\
             #EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=320x240\n\
             variant/index.m3u8\n",
        )
        .await
        .mock(
            "/variant/index.m3u8",
            media_playlist(&["seg0.ts", "seg1.ts"], 0, true),
        )
        .await
        .mock("/variant/seg0.ts", head)
        .await
        .mock("/variant/seg1.ts", tail)
        .await;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(&format!("{}/master.m3u8", server.uri())).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    let (codecs, _) = recorded.init.expect("no init segment");
    assert_eq!(codecs.len(), 2);
    assert!(!recorded.fragments.is_empty());
    for fragment in &recorded.fragments {
        assert_eq!(
            common::first_sample_flags(&fragment.bytes, 1),
            Some(SYNC_SAMPLE_FLAGS)
        );
    }
    Ok(())
}

#[tokio::test]
async fn live_playlist_is_refreshed_until_it_ends() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let (head, tail) = split_stream();

    // the first load sees one segment, reloads see both and the end
    Mock::given(method("GET"))
        .and(path("/live/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(media_playlist(&["0.ts"], 7, false)),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    server
        .mock("/live/index.m3u8", media_playlist(&["0.ts", "1.ts"], 7, true))
        .await
        .mock("/live/0.ts", head)
        .await
        .mock("/live/1.ts", tail)
        .await;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player
        .play(&format!("{}/live/index.m3u8", server.uri()))
        .await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(15)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    assert!(recorded.init.is_some());
    assert!(recorded.fragments.len() >= 4);

    let requests = server.received_requests().await.unwrap_or_default();
    let fetched = |p: &str| requests.iter().filter(|r| r.url.path() == p).count();
    assert_eq!(fetched("/live/index.m3u8"), 2);
    assert_eq!(fetched("/live/0.ts"), 1);
    assert_eq!(fetched("/live/1.ts"), 1);
    Ok(())
}

#[tokio::test]
async fn cmaf_playlist_with_map() -> anyhow::Result<()> {
    common::init_logging();
    let server = MockServer::start().await;
    let (init, segments) = common::mp4::cmaf(30, 10);
    let names = (0..segments.len())
        .map(|i| format!("{i}.m4s"))
        .collect::<Vec<_>>();
    let playlist = media_playlist(
        &names.iter().map(String::as_str).collect::<Vec<_>>(),
        0,
        true,
    )
    .replacen(
        "#EXT-X-MEDIA-SEQUENCE:0\n",
        "#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-MAP:URI=\"init.mp4\"\n",
        1,
    );
    server
        .mock("/cmaf/index.m3u8", playlist)
        .await
        .mock("/cmaf/init.mp4", init.to_vec())
        .await;
    for (name, segment) in names.iter().zip(&segments) {
        server.mock(&format!("/cmaf/{name}"), segment.to_vec()).await;
    }

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player
        .play(&format!("{}/cmaf/index.m3u8", server.uri()))
        .await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    let (codecs, init) = recorded.init.expect("no init segment");
    assert_eq!(codecs.len(), 2);
    assert_eq!(init.mime, r#"video/mp4; codecs="avc1.42c01e, mp4a.40.2""#);
    assert_eq!(recorded.fragments.len(), segments.len());
    for fragment in &recorded.fragments {
        assert_eq!(
            common::first_sample_flags(&fragment.bytes, 1),
            Some(SYNC_SAMPLE_FLAGS)
        );
    }

    let requests = server.received_requests().await.unwrap_or_default();
    let init_fetches = requests
        .iter()
        .filter(|r| r.url.path() == "/cmaf/init.mp4")
        .count();
    assert_eq!(init_fetches, 1);
    Ok(())
}

#[tokio::test]
async fn missing_playlist_fails_dial() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(&format!("{}/gone.m3u8", server.uri())).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::Dial(_))
    ));
    Ok(())
}

#[tokio::test]
async fn encrypted_playlist_is_rejected() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock(
            "/enc.m3u8",
            "#EXTM3U\n#EXT-X-TARGETDURATION:1\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
             #EXTINF:1.0,\n0.ts\n#EXT-X-ENDLIST\n",
        )
        .await;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(&format!("{}/enc.m3u8", server.uri())).await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::Negotiation(_))
    ));
    Ok(())
}

#[test]
fn hls_locators_route_to_hls() {
    let client = ingest::dispatch("https://cdn.example.com/a/index.m3u8", &IngestConfig::default())
        .unwrap();
    assert_eq!(ingest::StreamClient::kind(&client), TransportKind::Hls);
}
