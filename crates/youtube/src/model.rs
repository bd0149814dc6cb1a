use serde::{Deserialize, Serialize};

use crate::{YoutubeError, YoutubeResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRequest<'a> {
    pub video_id: &'a str,
    pub context: RequestContext<'a>,
    pub content_check_ok: bool,
    pub racy_check_ok: bool,
}

#[derive(Debug, Serialize)]
pub struct RequestContext<'a> {
    pub client: ClientInfo<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo<'a> {
    pub client_name: &'a str,
    pub client_version: &'a str,
    pub hl: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResponse {
    pub playability_status: PlayabilityStatus,
    pub streaming_data: Option<StreamingData>,
    pub video_details: Option<VideoDetails>,
}

#[derive(Debug, Deserialize)]
pub struct PlayabilityStatus {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub video_id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub is_live: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingData {
    pub hls_manifest_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<Format>,
    #[serde(default)]
    pub adaptive_formats: Vec<Format>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    pub itag: u32,
    pub url: Option<String>,
    pub mime_type: String,
    pub bitrate: Option<u64>,
    pub audio_channels: Option<u32>,
    pub quality_label: Option<String>,
}

impl Format {
    pub fn has_audio(&self) -> bool {
        self.audio_channels.is_some_and(|c| c > 0)
    }

    pub fn is_mp4(&self) -> bool {
        self.mime_type.starts_with("video/mp4") || self.mime_type.starts_with("audio/mp4")
    }
}

/// How a video can be played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playback {
    /// An HLS manifest, for lives and premieres.
    Manifest(String),
    /// A progressive MP4 url.
    Progressive { url: String, mime_type: String },
}

impl PlayerResponse {
    pub fn playback(&self) -> YoutubeResult<Playback> {
        if self.playability_status.status != "OK" {
            return Err(YoutubeError::Unplayable {
                status: self.playability_status.status.clone(),
                reason: self.playability_status.reason.clone().unwrap_or_default(),
            });
        }
        let Some(data) = &self.streaming_data else {
            return Err(YoutubeError::NoFormat);
        };
        if let Some(manifest) = data.hls_manifest_url.as_ref().filter(|u| !u.is_empty()) {
            return Ok(Playback::Manifest(manifest.clone()));
        }

        // muxed formats first, so a video with audio wins over audio only
        data.formats
            .iter()
            .chain(data.adaptive_formats.iter())
            .find(|f| f.has_audio() && f.is_mp4() && f.url.is_some())
            .and_then(|f| {
                Some(Playback::Progressive {
                    url: f.url.clone()?,
                    mime_type: f.mime_type.clone(),
                })
            })
            .ok_or(YoutubeError::NoFormat)
    }
}
