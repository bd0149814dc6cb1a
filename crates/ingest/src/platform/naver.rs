use url::Url;

use super::path_id;
use crate::error::{IngestError, IngestResult};

/// What a Naver TV or Shopping Live page url points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaverTarget {
    TvLive(u64),
    TvClip(u64),
    ShoppingLive(u64),
}

impl NaverTarget {
    pub fn from_url(url: &Url) -> IngestResult<Self> {
        let number = |prefix: &str| {
            path_id(url, prefix).map(|id| {
                id.parse::<u64>()
                    .map_err(|_| IngestError::UnsupportedPath(format!("invalid id: {id}")))
            })
        };
        let target = match url.host_str() {
            Some("tv.naver.com") => match (number("/l/"), number("/h/")) {
                (Some(no), _) => NaverTarget::TvLive(no?),
                (_, Some(no)) => NaverTarget::TvClip(no?),
                _ => return Err(IngestError::UnsupportedPath(url.path().to_string())),
            },
            Some("view.shoppinglive.naver.com") => match number("/lives/") {
                Some(id) => NaverTarget::ShoppingLive(id?),
                None => return Err(IngestError::UnsupportedPath(url.path().to_string())),
            },
            _ => return Err(IngestError::UnsupportedPath(url.to_string())),
        };
        Ok(target)
    }
}

/// Playback of these pages goes through signed player APIs that have no
/// stable public endpoint, so a recognised page fails resolution instead of
/// falling through to a plain HTTP download.
pub(super) fn resolve(url: &Url) -> IngestResult<super::Resolved> {
    let target = NaverTarget::from_url(url)?;
    log::debug!("Naver page {url} is {target:?}");
    Err(IngestError::Resolution {
        status: "unsupported".into(),
        message: format!("no playback api for {target:?}"),
    })
}
