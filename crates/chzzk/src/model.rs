use serde::Deserialize;

use crate::{ChzzkError, ChzzkResult};

/// Every Chzzk service API wraps its payload in this envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    pub message: Option<String>,
    pub content: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn into_content(self) -> ChzzkResult<T> {
        if self.code != 200 {
            return Err(ChzzkError::Api {
                code: self.code,
                message: self.message.unwrap_or_default(),
            });
        }
        self.content.ok_or(ChzzkError::EmptyContent)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDetail {
    pub live_title: Option<String>,
    /// `OPEN` or `CLOSE`
    pub status: String,
    /// A JSON document encoded as a string.
    pub live_playback_json: Option<String>,
}

impl LiveDetail {
    pub fn is_open(&self) -> bool {
        self.status == "OPEN"
    }

    pub fn playback(&self) -> ChzzkResult<Option<LivePlayback>> {
        match self.live_playback_json.as_deref() {
            Some(json) if !json.is_empty() => Ok(Some(serde_json::from_str(json)?)),
            _ => Ok(None),
        }
    }

    /// Path of the `HLS` media entry. Missing for lives that are not
    /// broadcasting, in which case the live status is reported.
    pub fn hls_path(&self) -> ChzzkResult<String> {
        self.playback()?
            .and_then(|playback| playback.hls_path().map(str::to_string))
            .ok_or_else(|| ChzzkError::Offline(self.status.clone()))
    }
}

#[derive(Debug, Deserialize)]
pub struct LivePlayback {
    #[serde(default)]
    pub media: Vec<LiveMedia>,
}

impl LivePlayback {
    pub fn hls_path(&self) -> Option<&str> {
        self.media
            .iter()
            .find(|m| m.media_id == "HLS")
            .map(|m| m.path.as_str())
            .filter(|path| !path.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMedia {
    pub media_id: String,
    pub protocol: Option<String>,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipDetail {
    pub clip_title: Option<String>,
    pub video_id: String,
    pub in_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VodPlayback {
    pub videos: VodVideos,
}

#[derive(Debug, Deserialize)]
pub struct VodVideos {
    #[serde(default)]
    pub list: Vec<VodVideo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VodVideo {
    pub source: String,
    pub encoding_option: Option<VodEncodingOption>,
}

#[derive(Debug, Deserialize)]
pub struct VodEncodingOption {
    pub name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl VodPlayback {
    pub fn first_source(&self) -> Option<&str> {
        self.videos
            .list
            .iter()
            .map(|v| v.source.as_str())
            .find(|source| !source.is_empty())
    }
}
