use std::time::Duration;

use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use reqwest::Client;
use url::Url;

use crate::{
    demux::ContainerFormat,
    error::{IngestError, IngestResult},
    util::http::HttpClient,
};

/// Fetches `url` and follows a master playlist to its first regular
/// variant.
#[async_recursion::async_recursion]
pub async fn load_m3u8(
    client: &Client,
    url: Url,
    total_retry: u32,
) -> IngestResult<(Url, MediaPlaylist)> {
    log::info!("Start fetching M3U8 file.");

    let mut retry = total_retry;
    let m3u8_parsed = loop {
        if retry == 0 {
            return Err(IngestError::M3u8FetchError);
        }

        match client
            .get(url.clone())
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
        {
            Ok(resp) => match resp.bytes().await {
                Ok(m3u8_bytes) => match m3u8_rs::parse_playlist_res(&m3u8_bytes) {
                    Ok(parsed) => break parsed,
                    Err(error) => {
                        log::warn!("Failed to parse M3U8 file: {error}");
                        retry -= 1;
                    }
                },
                Err(error) => {
                    log::warn!("Failed to fetch M3U8 file: {error}");
                    retry -= 1;
                }
            },
            Err(error) => {
                log::warn!("Failed to fetch M3U8 file: {error}");
                retry -= 1;
            }
        }
    };
    log::info!("M3U8 file fetched.");

    match m3u8_parsed {
        Playlist::MasterPlaylist(pl) => {
            let variant = pl
                .variants
                .iter()
                .find(|v| !v.is_i_frame)
                .ok_or_else(|| IngestError::M3u8ParseError("master playlist has no variant".into()))?;
            let url = url.join(&variant.uri)?;

            log::info!(
                "Selected stream: {url}; Bandwidth: {bandwidth}",
                bandwidth = variant.bandwidth
            );
            load_m3u8(client, url, total_retry).await
        }
        Playlist::MediaPlaylist(pl) => Ok((url, pl)),
    }
}

/// Rejects playlists whose segments cannot be demuxed as they are.
pub fn check_supported(playlist: &MediaPlaylist) -> IngestResult<()> {
    for segment in &playlist.segments {
        if let Some(key) = &segment.key {
            if key.method != KeyMethod::None {
                return Err(IngestError::Negotiation(format!(
                    "encrypted playlists are not supported ({})",
                    key.method
                )));
            }
        }
        if segment.map.as_ref().is_some_and(|map| map.byte_range.is_some()) {
            return Err(IngestError::Negotiation(
                "byte ranges in EXT-X-MAP are not supported".into(),
            ));
        }
    }
    Ok(())
}

/// Segments behind an `EXT-X-MAP` are CMAF, everything else MPEG-TS.
pub fn segment_format(playlist: &MediaPlaylist) -> ContainerFormat {
    if playlist.segments.iter().any(|s| s.map.is_some()) {
        ContainerFormat::Fmp4
    } else {
        ContainerFormat::Ts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HlsSegment {
    pub url: Url,
    pub media_sequence: u64,
    pub duration: f32,
    /// Initialization section the segment depends on.
    pub map: Option<Url>,
}

#[derive(Debug)]
pub struct PlaylistUpdate {
    pub segments: Vec<HlsSegment>,
    pub ended: bool,
    /// How long to wait before the next reload.
    pub refresh_interval: Duration,
}

/// Remembers the newest media sequence seen so reloads only yield new
/// segments.
pub struct PlaylistTracker {
    client: HttpClient,
    url: Url,
    retry: u32,
    latest_media_sequence: Option<u64>,
    /// The tag applies to every following segment, across reloads too.
    map: Option<Url>,
}

impl PlaylistTracker {
    pub fn new(client: HttpClient, url: Url, retry: u32) -> Self {
        Self {
            client,
            url,
            retry,
            latest_media_sequence: None,
            map: None,
        }
    }

    pub fn advance(&mut self, playlist: &MediaPlaylist) -> IngestResult<PlaylistUpdate> {
        check_supported(playlist)?;

        let mut segments = Vec::with_capacity(playlist.segments.len());
        for (i, segment) in playlist.segments.iter().enumerate() {
            if let Some(map) = &segment.map {
                self.map = Some(self.url.join(&map.uri)?);
            }
            let media_sequence = playlist.media_sequence + i as u64;
            if let Some(latest) = self.latest_media_sequence {
                if media_sequence <= latest {
                    continue;
                }
            }
            segments.push(HlsSegment {
                url: self.url.join(&segment.uri)?,
                media_sequence,
                duration: segment.duration,
                map: self.map.clone(),
            });
        }
        if let Some(last) = segments.last() {
            self.latest_media_sequence = Some(last.media_sequence);
        }

        let count = playlist.segments.len() as f32;
        let average = if count == 0. {
            0
        } else {
            (playlist.segments.iter().map(|s| s.duration).sum::<f32>() / count) as u64
        };

        Ok(PlaylistUpdate {
            segments,
            ended: playlist.end_list,
            refresh_interval: Duration::from_secs(average.clamp(1, 5)),
        })
    }

    pub async fn reload(&mut self) -> IngestResult<PlaylistUpdate> {
        let (_, playlist) = load_m3u8(&self.client, self.url.clone(), self.retry).await?;
        self.advance(&playlist)
    }
}
