use std::time::Duration;

use ingest::{EndReason, IngestConfig, IngestError, Player};
use wiremock::{
    matchers::{header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::common::{self, ts::TsOptions};

async fn play(locator: String) -> common::Recorded {
    let (tx, mut rx) = common::events();
    let mut player = Player::with_config(IngestConfig::default(), tx);
    let session = player.play(&locator).await;
    common::record(&mut rx, session, Duration::from_secs(10)).await
}

#[tokio::test]
async fn progressive_transport_stream() -> anyhow::Result<()> {
    common::init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vod/video.ts"))
        .and(header_exists("user-agent"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(common::ts::stream(TsOptions::default())),
        )
        .expect(1)
        .mount(&server)
        .await;

    let recorded = play(format!("{}/vod/video.ts", server.uri())).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    assert_eq!(recorded.init.map(|(codecs, _)| codecs.len()), Some(2));
    assert!(recorded.fragments.len() >= 4);
    Ok(())
}

#[tokio::test]
async fn error_status_fails_dial() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let recorded = play(format!("{}/vod/video.flv", server.uri())).await;

    assert!(recorded.init.is_none());
    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::Dial(message)) if message.contains("403")
    ));
    Ok(())
}

#[tokio::test]
async fn mp4_without_length_is_rejected() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live.mp4"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let recorded = play(format!("{}/live.mp4", server.uri())).await;

    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::Dial(_))
    ));
    Ok(())
}

#[tokio::test]
async fn progressive_mp4_with_length() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vod/show.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(common::mp4::progressive(30, 10)))
        .expect(1)
        .mount(&server)
        .await;

    let recorded = play(format!("{}/vod/show.mp4", server.uri())).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)), "{:?}", recorded.reason);
    assert_eq!(recorded.init.map(|(codecs, _)| codecs.len()), Some(2));
    assert_eq!(recorded.fragments.len(), 3);
    Ok(())
}

#[tokio::test]
async fn unknown_extension_fails_dial() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let recorded = play(format!("{}/stream.bin", server.uri())).await;

    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::Dial(_))
    ));
    assert!(server
        .received_requests()
        .await
        .unwrap_or_default()
        .is_empty());
    Ok(())
}
