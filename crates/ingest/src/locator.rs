//! Locator dispatch: which client plays a url. No I/O happens here.

use std::path::{Path, PathBuf};

use url::Url;

use crate::{
    client::Client,
    config::IngestConfig,
    error::{IngestError, IngestResult},
    platform::{Platform, PlatformClient},
    transport::{
        file::FileClient, hls::HlsClient, http::HttpStreamClient, rtmp::RtmpClient,
        rtsp::RtspClient, srt::SrtClient,
    },
    util::http::HttpClient,
    StreamClient,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    File(PathBuf),
    Http(Url),
    Hls(Url),
    Rtmp(Url),
    Srt(Url),
    Rtsp(Url),
    Platform(Platform, Url),
}

pub fn route(locator: &str) -> IngestResult<Route> {
    let locator = locator.trim();
    if Path::new(locator).is_absolute() {
        return Ok(Route::File(PathBuf::from(locator)));
    }

    let url = Url::parse(locator)
        .map_err(|e| IngestError::InvalidLocator(format!("{locator}: {e}")))?;

    if matches!(url.scheme(), "http" | "https") {
        if let Some(platform) = url.host_str().and_then(Platform::from_host) {
            return Ok(Route::Platform(platform, url));
        }
    }

    match url.scheme() {
        "file" => url
            .to_file_path()
            .map(Route::File)
            .map_err(|_| IngestError::InvalidLocator(format!("{url} is not a local path"))),
        "rtmp" | "rtmps" => Ok(Route::Rtmp(url)),
        "http" | "https" => {
            if url.path().to_ascii_lowercase().ends_with(".m3u8") {
                Ok(Route::Hls(url))
            } else {
                Ok(Route::Http(url))
            }
        }
        "srt" => Ok(Route::Srt(url)),
        "rtsp" | "rtsps" => Ok(Route::Rtsp(url)),
        scheme => Err(IngestError::UnsupportedScheme(scheme.to_string())),
    }
}

/// Builds the client for a locator. The client is not dialed yet.
pub fn dispatch(locator: &str, config: &IngestConfig) -> IngestResult<Client> {
    let route = route(locator)?;
    log::debug!("Dispatching {locator} to {route:?}");

    let client = match route {
        Route::File(path) => Client::File(FileClient::new(path)),
        Route::Http(url) => Client::Http(HttpStreamClient::new(HttpClient::new(config)?, url)),
        Route::Hls(url) => Client::Hls(HlsClient::new(HttpClient::new(config)?, url, config.hls_retry)),
        Route::Rtmp(url) => Client::Rtmp(RtmpClient::new(
            url,
            config.strict_tls,
            config.rtmp_idle_timeout(),
        )),
        Route::Srt(url) => Client::Srt(SrtClient::new(url, config)),
        Route::Rtsp(url) => Client::Rtsp(RtspClient::new(
            url,
            config.strict_tls,
            config.rtsp_idle_timeout(),
            config.user_agent(),
        )),
        Route::Platform(platform, url) => Client::Platform(PlatformClient::new(
            platform,
            url,
            HttpClient::new(config)?,
            config.clone(),
        )),
    };
    Ok(client)
}

/// Turns a locator into a client for a session.
pub trait Connector: Send + Sync + 'static {
    type Client: StreamClient;

    fn connect(&self, locator: &str) -> IngestResult<Self::Client>;
}

/// The production connector, backed by [`dispatch`].
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    config: IngestConfig,
}

impl Dispatcher {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }
}

impl Connector for Dispatcher {
    type Client = Client;

    fn connect(&self, locator: &str) -> IngestResult<Client> {
        dispatch(locator, &self.config)
    }
}
