//! Content platforms whose page urls resolve to an HLS manifest or a
//! progressive media url, played by the matching transport.

mod chzzk;
mod naver;
mod youtube;

use url::Url;

use crate::{
    config::IngestConfig,
    demux::ContainerFormat,
    error::{IngestError, IngestResult},
    packet::CodecDescriptor,
    queue::ProducerOutput,
    transport::{hls::HlsClient, http::HttpStreamClient, TransportKind},
    util::http::HttpClient,
    StreamClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Chzzk,
    /// Naver TV and Shopping Live pages.
    Naver,
    Youtube,
}

impl Platform {
    pub fn from_host(host: &str) -> Option<Self> {
        match host {
            "chzzk.naver.com" => Some(Platform::Chzzk),
            "tv.naver.com" | "view.shoppinglive.naver.com" => Some(Platform::Naver),
            "www.youtube.com" | "youtube.com" | "m.youtube.com" | "music.youtube.com"
            | "youtu.be" | "www.youtubekids.com" => Some(Platform::Youtube),
            _ => None,
        }
    }
}

/// Where a platform url actually plays from. Exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Manifest(Url),
    Media { url: Url, format: ContainerFormat },
}

pub async fn resolve(
    platform: Platform,
    url: &Url,
    client: &HttpClient,
    config: &IngestConfig,
) -> IngestResult<Resolved> {
    let resolved = match platform {
        Platform::Chzzk => chzzk::resolve(url, client, &config.platform).await?,
        Platform::Naver => naver::resolve(url)?,
        Platform::Youtube => youtube::resolve(url, client, &config.platform).await?,
    };
    log::info!("Resolved {url} to {resolved:?}");
    Ok(resolved)
}

/// The path segment after `prefix`, if the path has that shape.
fn path_id<'a>(url: &'a Url, prefix: &str) -> Option<&'a str> {
    url.path()
        .strip_prefix(prefix)
        .and_then(|rest| rest.split('/').next())
        .filter(|id| !id.is_empty())
}

fn parse_resolved_url(raw: &str) -> IngestResult<Url> {
    Url::parse(raw).map_err(|e| IngestError::Resolution {
        status: "invalid url".into(),
        message: format!("{raw}: {e}"),
    })
}

enum Inner {
    Hls(HlsClient),
    Http(HttpStreamClient),
}

/// Resolves during `dial`, then forwards everything to the transport it
/// resolved to.
pub struct PlatformClient {
    platform: Platform,
    url: Url,
    client: HttpClient,
    config: IngestConfig,
    inner: Option<Inner>,
}

impl PlatformClient {
    pub fn new(platform: Platform, url: Url, client: HttpClient, config: IngestConfig) -> Self {
        Self {
            platform,
            url,
            client,
            config,
            inner: None,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl StreamClient for PlatformClient {
    fn kind(&self) -> TransportKind {
        match &self.inner {
            Some(Inner::Hls(inner)) => inner.kind(),
            Some(Inner::Http(inner)) => inner.kind(),
            None => TransportKind::Platform,
        }
    }

    async fn dial(&mut self) -> IngestResult<()> {
        let resolved = resolve(self.platform, &self.url, &self.client, &self.config).await?;
        let inner = match resolved {
            Resolved::Manifest(url) => {
                Inner::Hls(HlsClient::new(self.client.clone(), url, self.config.hls_retry))
            }
            Resolved::Media { url, format } => {
                Inner::Http(HttpStreamClient::new(self.client.clone(), url).with_format(format))
            }
        };
        match self.inner.insert(inner) {
            Inner::Hls(inner) => inner.dial().await,
            Inner::Http(inner) => inner.dial().await,
        }
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        match &mut self.inner {
            Some(Inner::Hls(inner)) => inner.negotiate_codecs().await,
            Some(Inner::Http(inner)) => inner.negotiate_codecs().await,
            None => Err(IngestError::Negotiation("platform url is not resolved".into())),
        }
    }

    fn take_output(&mut self) -> Option<ProducerOutput> {
        match &mut self.inner {
            Some(Inner::Hls(inner)) => inner.take_output(),
            Some(Inner::Http(inner)) => inner.take_output(),
            None => None,
        }
    }

    async fn close(&mut self) {
        match &mut self.inner {
            Some(Inner::Hls(inner)) => inner.close().await,
            Some(Inner::Http(inner)) => inner.close().await,
            None => {}
        }
    }
}
