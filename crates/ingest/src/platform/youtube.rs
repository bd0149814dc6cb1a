use ingest_youtube::{model::Playback, YoutubeClient, API_BASE};
use url::Url;

use super::{parse_resolved_url, Resolved};
use crate::{
    config::PlatformConfig, demux::ContainerFormat, error::IngestResult, util::http::HttpClient,
};

pub(super) async fn resolve(
    url: &Url,
    client: &HttpClient,
    config: &PlatformConfig,
) -> IngestResult<Resolved> {
    // fail on the path before any request is made
    let video_id = ingest_youtube::video_id(url)?;
    let youtube = YoutubeClient::new(client.inner().clone())
        .with_base_url(config.youtube_api.as_deref().unwrap_or(API_BASE));

    match youtube.player(&video_id).await?.playback()? {
        Playback::Manifest(manifest) => Ok(Resolved::Manifest(parse_resolved_url(&manifest)?)),
        Playback::Progressive { url, mime_type } => {
            log::debug!("youtube {video_id}: progressive {mime_type}");
            Ok(Resolved::Media {
                url: parse_resolved_url(&url)?,
                format: ContainerFormat::Mp4,
            })
        }
    }
}
