use std::time::Duration;

use ingest::{
    config::PlatformConfig,
    demux::ContainerFormat,
    platform::{resolve, Platform, Resolved},
    util::http::HttpClient,
    EndReason, IngestConfig, IngestError, Player,
};
use serde_json::json;
use url::Url;
use wiremock::{
    matchers::{body_partial_json, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::common::{self, ts::TsOptions};

fn config(server: &MockServer) -> IngestConfig {
    IngestConfig {
        platform: PlatformConfig {
            chzzk_api: Some(server.uri()),
            chzzk_playback_api: Some(server.uri()),
            youtube_api: Some(server.uri()),
        },
        ..Default::default()
    }
}

async fn resolve_with(server: &MockServer, platform: Platform, url: &str) -> ingest::IngestResult<Resolved> {
    let config = config(server);
    let client = HttpClient::new(&config)?;
    resolve(platform, &Url::parse(url).unwrap(), &client, &config).await
}

async fn mock_json(server: &MockServer, mock_path: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(mock_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn live_detail(status: &str, hls: Option<&str>) -> serde_json::Value {
    let playback = hls.map(|hls| {
        json!({
            "media": [
                { "mediaId": "LLHLS", "protocol": "HLS", "path": "https://ll.example.com/ll.m3u8" },
                { "mediaId": "HLS", "protocol": "HLS", "path": hls },
            ]
        })
        .to_string()
    });
    json!({
        "code": 200,
        "message": null,
        "content": {
            "liveTitle": "fixture",
            "status": status,
            "livePlaybackJson": playback,
        }
    })
}

#[tokio::test]
async fn chzzk_live_resolves_to_manifest() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_json(
        &server,
        "/service/v3/channels/abc123/live-detail",
        live_detail("OPEN", Some("https://cdn.example.com/hls/playlist.m3u8")),
    )
    .await;

    let resolved = resolve_with(&server, Platform::Chzzk, "https://chzzk.naver.com/live/abc123").await?;
    assert_eq!(
        resolved,
        Resolved::Manifest(Url::parse("https://cdn.example.com/hls/playlist.m3u8")?)
    );
    Ok(())
}

#[tokio::test]
async fn chzzk_closed_live_has_no_rendition() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_json(
        &server,
        "/service/v3/channels/abc123/live-detail",
        live_detail("CLOSE", None),
    )
    .await;

    let result = resolve_with(&server, Platform::Chzzk, "https://chzzk.naver.com/live/abc123").await;
    assert!(matches!(result, Err(IngestError::NoRenditionAvailable(m)) if m.contains("CLOSE")));
    Ok(())
}

#[tokio::test]
async fn chzzk_api_error_is_a_resolution_failure() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_json(
        &server,
        "/service/v3/channels/missing/live-detail",
        json!({ "code": 404, "message": "channel not found", "content": null }),
    )
    .await;

    let result = resolve_with(&server, Platform::Chzzk, "https://chzzk.naver.com/live/missing").await;
    assert!(matches!(
        result,
        Err(IngestError::Resolution { status, message }) if status == "404" && message == "channel not found"
    ));
    Ok(())
}

#[tokio::test]
async fn chzzk_clip_resolves_to_media() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_json(
        &server,
        "/service/v1/clips/clip1/detail",
        json!({
            "code": 200,
            "message": null,
            "content": { "clipTitle": "clip", "videoId": "V1", "inKey": "K1" }
        }),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/neonplayer/vodplay/v1/playback/V1"))
        .and(query_param("key", "K1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "videos": { "list": [
                { "source": "https://vod.example.com/clip?sig=1", "encodingOption": { "name": "720p" } }
            ]}
        })))
        .mount(&server)
        .await;

    let resolved = resolve_with(&server, Platform::Chzzk, "https://chzzk.naver.com/clips/clip1").await?;
    assert_eq!(
        resolved,
        Resolved::Media {
            url: Url::parse("https://vod.example.com/clip?sig=1")?,
            format: ContainerFormat::Mp4,
        }
    );
    Ok(())
}

#[tokio::test]
async fn chzzk_unsupported_path() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let result = resolve_with(&server, Platform::Chzzk, "https://chzzk.naver.com/lives").await;
    assert!(matches!(result, Err(IngestError::UnsupportedPath(_))));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    Ok(())
}

#[tokio::test]
async fn naver_pages_fail_resolution() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let live = resolve_with(&server, Platform::Naver, "https://tv.naver.com/l/171004").await;
    assert!(matches!(live, Err(IngestError::Resolution { .. })), "{live:?}");
    let shopping = resolve_with(
        &server,
        Platform::Naver,
        "https://view.shoppinglive.naver.com/lives/1234567",
    )
    .await;
    assert!(matches!(shopping, Err(IngestError::Resolution { .. })), "{shopping:?}");

    let other = resolve_with(&server, Platform::Naver, "https://tv.naver.com/v/123").await;
    assert!(matches!(other, Err(IngestError::UnsupportedPath(_))), "{other:?}");
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    Ok(())
}

async fn mock_player(server: &MockServer, video_id: &str, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/youtubei/v1/player"))
        .and(body_partial_json(json!({ "videoId": video_id })))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn youtube_live_resolves_to_manifest() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_player(
        &server,
        "dQw4w9WgXcQ",
        json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": { "hlsManifestUrl": "https://manifest.example.com/index.m3u8" },
            "videoDetails": { "videoId": "dQw4w9WgXcQ", "title": "live", "isLive": true }
        }),
    )
    .await;

    let resolved = resolve_with(&server, Platform::Youtube, "https://www.youtube.com/live/dQw4w9WgXcQ").await?;
    assert_eq!(
        resolved,
        Resolved::Manifest(Url::parse("https://manifest.example.com/index.m3u8")?)
    );
    Ok(())
}

#[tokio::test]
async fn youtube_video_resolves_to_muxed_format() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_player(
        &server,
        "dQw4w9WgXcQ",
        json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": {
                "formats": [
                    { "itag": 18, "url": "https://media.example.com/18", "mimeType": "video/mp4; codecs=\"avc1.42001E, mp4a.40.2\"", "audioChannels": 2 }
                ],
                "adaptiveFormats": [
                    { "itag": 137, "url": "https://media.example.com/137", "mimeType": "video/mp4; codecs=\"avc1.640028\"" }
                ]
            }
        }),
    )
    .await;

    let resolved = resolve_with(&server, Platform::Youtube, "https://youtu.be/dQw4w9WgXcQ").await?;
    assert_eq!(
        resolved,
        Resolved::Media {
            url: Url::parse("https://media.example.com/18")?,
            format: ContainerFormat::Mp4,
        }
    );
    Ok(())
}

#[tokio::test]
async fn youtube_unplayable_video() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_player(
        &server,
        "dQw4w9WgXcQ",
        json!({ "playabilityStatus": { "status": "LOGIN_REQUIRED", "reason": "Sign in" } }),
    )
    .await;

    let result = resolve_with(&server, Platform::Youtube, "https://www.youtube.com/watch?v=dQw4w9WgXcQ").await;
    assert!(matches!(
        result,
        Err(IngestError::Resolution { status, .. }) if status == "LOGIN_REQUIRED"
    ));
    Ok(())
}

#[tokio::test]
async fn youtube_without_usable_format() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_player(
        &server,
        "dQw4w9WgXcQ",
        json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": {
                "adaptiveFormats": [
                    { "itag": 251, "mimeType": "audio/webm; codecs=\"opus\"", "audioChannels": 2 }
                ]
            }
        }),
    )
    .await;

    let result = resolve_with(&server, Platform::Youtube, "https://youtu.be/dQw4w9WgXcQ").await;
    assert!(matches!(result, Err(IngestError::NoRenditionAvailable(_))));
    Ok(())
}

#[tokio::test]
async fn youtube_unsupported_path() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let result = resolve_with(&server, Platform::Youtube, "https://www.youtube.com/feed/trending").await;
    assert!(matches!(result, Err(IngestError::UnsupportedPath(_))));
    Ok(())
}

#[tokio::test]
async fn chzzk_live_plays_through_hls() -> anyhow::Result<()> {
    common::init_logging();
    let server = MockServer::start().await;
    mock_json(
        &server,
        "/service/v3/channels/abc123/live-detail",
        live_detail("OPEN", Some(&format!("{}/hls/playlist.m3u8", server.uri()))),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/hls/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg.ts\n#EXT-X-ENDLIST\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hls/seg.ts"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(common::ts::stream(TsOptions::default())),
        )
        .mount(&server)
        .await;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(config(&server), tx);
    let session = player.play("https://chzzk.naver.com/live/abc123").await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    assert_eq!(recorded.init.map(|(codecs, _)| codecs.len()), Some(2));
    assert!(!recorded.fragments.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_resolution_ends_the_session() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_json(
        &server,
        "/service/v3/channels/abc123/live-detail",
        live_detail("CLOSE", None),
    )
    .await;

    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(config(&server), tx);
    let session = player.play("https://chzzk.naver.com/live/abc123").await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(10)).await;

    assert!(recorded.init.is_none());
    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::NoRenditionAvailable(_))
    ));
    Ok(())
}
