pub mod model;

use std::sync::LazyLock;

use fake_user_agent::get_chrome_rua;
use model::*;
use regex::Regex;
use reqwest::Client;
use thiserror::Error;
use url::Url;

pub const API_BASE: &str = "https://www.youtube.com";

static VIDEO_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

#[derive(Error, Debug)]
pub enum YoutubeError {
    #[error("unsupported youtube url: {0}")]
    UnsupportedUrl(String),

    #[error("invalid video id: {0}")]
    InvalidVideoId(String),

    #[error("video is not playable ({status}): {reason}")]
    Unplayable { status: String, reason: String },

    #[error("no playable format")]
    NoFormat,

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

pub type YoutubeResult<T> = Result<T, YoutubeError>;

/// Extracts the video id from the url shapes a viewer shares:
/// `/watch?v={id}`, `/live/{id}`, `/shorts/{id}` and `youtu.be/{id}`.
pub fn video_id(url: &Url) -> YoutubeResult<String> {
    let path = url.path();
    let id = if url.host_str() == Some("youtu.be") {
        path.trim_start_matches('/').split('/').next()
    } else if path == "/watch" {
        return url
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| YoutubeError::UnsupportedUrl(url.to_string()))
            .and_then(validate);
    } else if let Some(rest) = path
        .strip_prefix("/live/")
        .or_else(|| path.strip_prefix("/shorts/"))
    {
        rest.split('/').next()
    } else {
        None
    };

    match id {
        Some(id) if !id.is_empty() => validate(id.to_string()),
        _ => Err(YoutubeError::UnsupportedUrl(url.to_string())),
    }
}

fn validate(id: String) -> YoutubeResult<String> {
    if VIDEO_ID_REGEX.is_match(&id) {
        Ok(id)
    } else {
        Err(YoutubeError::InvalidVideoId(id))
    }
}

pub struct YoutubeClient {
    client: Client,
    api: String,
}

impl YoutubeClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api: API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, api: impl Into<String>) -> Self {
        self.api = api.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn player(&self, video_id: &str) -> YoutubeResult<PlayerResponse> {
        // this client gets direct format urls without signature deciphering
        let request = PlayerRequest {
            video_id,
            context: RequestContext {
                client: ClientInfo {
                    client_name: "ANDROID_VR",
                    client_version: "1.60.19",
                    hl: "en",
                },
            },
            content_check_ok: true,
            racy_check_ok: true,
        };

        let response: PlayerResponse = self
            .client
            .post(format!("{}/youtubei/v1/player", self.api))
            .query(&[("prettyPrint", "false")])
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if let Some(details) = &response.video_details {
            log::info!(
                "youtube {}: {} (live: {})",
                details.video_id,
                details.title.as_deref().unwrap_or_default(),
                details.is_live
            );
        }
        Ok(response)
    }
}

impl Default for YoutubeClient {
    fn default() -> Self {
        let client = Client::builder()
            .user_agent(get_chrome_rua())
            .build()
            .unwrap_or_default();
        Self::new(client)
    }
}
