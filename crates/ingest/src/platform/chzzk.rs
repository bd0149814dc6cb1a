use ingest_chzzk::{ChzzkClient, API_BASE, PLAYBACK_API_BASE};
use url::Url;

use super::{parse_resolved_url, path_id, Resolved};
use crate::{
    config::PlatformConfig,
    demux::ContainerFormat,
    error::{IngestError, IngestResult},
    util::http::HttpClient,
};

pub(super) async fn resolve(
    url: &Url,
    client: &HttpClient,
    config: &PlatformConfig,
) -> IngestResult<Resolved> {
    let chzzk = ChzzkClient::new(client.inner().clone()).with_base_urls(
        config.chzzk_api.as_deref().unwrap_or(API_BASE),
        config
            .chzzk_playback_api
            .as_deref()
            .unwrap_or(PLAYBACK_API_BASE),
    );

    if let Some(channel_id) = path_id(url, "/live/") {
        let manifest = chzzk.live_hls_url(channel_id).await?;
        return Ok(Resolved::Manifest(parse_resolved_url(&manifest)?));
    }
    if let Some(clip_id) = path_id(url, "/clips/") {
        let source = parse_resolved_url(&chzzk.clip_source_url(clip_id).await?)?;
        let format = ContainerFormat::from_url(&source).unwrap_or(ContainerFormat::Mp4);
        return Ok(Resolved::Media {
            url: source,
            format,
        });
    }
    Err(IngestError::UnsupportedPath(url.path().to_string()))
}
