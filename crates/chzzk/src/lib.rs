pub mod model;

use fake_user_agent::get_chrome_rua;
use model::*;
use reqwest::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const API_BASE: &str = "https://api.chzzk.naver.com";
pub const PLAYBACK_API_BASE: &str = "https://apis.naver.com";

#[derive(Error, Debug)]
pub enum ChzzkError {
    #[error("chzzk api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("chzzk api returned no content")]
    EmptyContent,

    #[error("live is not available, status: {0}")]
    Offline(String),

    #[error("clip has no video source")]
    NoVideo,

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ChzzkResult<T> = Result<T, ChzzkError>;

pub struct ChzzkClient {
    client: Client,
    api: String,
    playback_api: String,
}

impl ChzzkClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api: API_BASE.to_string(),
            playback_api: PLAYBACK_API_BASE.to_string(),
        }
    }

    /// Points the client at other hosts, e.g. a local fixture server.
    pub fn with_base_urls(mut self, api: impl Into<String>, playback_api: impl Into<String>) -> Self {
        self.api = api.into().trim_end_matches('/').to_string();
        self.playback_api = playback_api.into().trim_end_matches('/').to_string();
        self
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> ChzzkResult<T> {
        log::debug!("GET {url}");
        let response = self.client.get(url).send().await?;
        Ok(response.json().await?)
    }

    pub async fn live_detail(&self, channel_id: &str) -> ChzzkResult<LiveDetail> {
        let url = format!("{}/service/v3/channels/{channel_id}/live-detail", self.api);
        self.get::<ApiResponse<LiveDetail>>(&url)
            .await?
            .into_content()
    }

    pub async fn clip_detail(&self, clip_id: &str) -> ChzzkResult<ClipDetail> {
        let url = format!("{}/service/v1/clips/{clip_id}/detail", self.api);
        self.get::<ApiResponse<ClipDetail>>(&url)
            .await?
            .into_content()
    }

    pub async fn vod_playback(&self, video_id: &str, in_key: &str) -> ChzzkResult<VodPlayback> {
        let url = format!(
            "{}/neonplayer/vodplay/v1/playback/{video_id}?key={in_key}",
            self.playback_api
        );
        self.get(&url).await
    }

    /// HLS manifest url of a channel's current live.
    pub async fn live_hls_url(&self, channel_id: &str) -> ChzzkResult<String> {
        let detail = self.live_detail(channel_id).await?;
        log::info!(
            "chzzk live {channel_id}: {} ({})",
            detail.live_title.as_deref().unwrap_or_default(),
            detail.status
        );
        detail.hls_path()
    }

    /// Url of the first progressive source of a clip.
    pub async fn clip_source_url(&self, clip_id: &str) -> ChzzkResult<String> {
        let detail = self.clip_detail(clip_id).await?;
        let in_key = detail.in_key.ok_or(ChzzkError::NoVideo)?;
        let playback = self.vod_playback(&detail.video_id, &in_key).await?;
        playback
            .first_source()
            .map(str::to_string)
            .ok_or(ChzzkError::NoVideo)
    }
}

impl Default for ChzzkClient {
    fn default() -> Self {
        let client = Client::builder()
            .user_agent(get_chrome_rua())
            .build()
            .unwrap_or_default();
        Self::new(client)
    }
}
