use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Unsupported path: {0}")]
    UnsupportedPath(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Codec negotiation failed: {0}")]
    Negotiation(String),

    #[error("Platform resolution failed ({status}): {message}")]
    Resolution { status: String, message: String },

    #[error("No playable rendition available: {0}")]
    NoRenditionAvailable(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("M3u8 fetch error")]
    M3u8FetchError,

    #[error("Invalid m3u8 file: {0}")]
    M3u8ParseError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }

    /// Reclassifies a failure that happened while connecting.
    pub(crate) fn into_dial(self) -> Self {
        match self {
            IngestError::IOError(e) => IngestError::Dial(e.to_string()),
            IngestError::RequestError(e) => IngestError::Dial(e.to_string()),
            IngestError::HttpError(status) => IngestError::Dial(format!("HTTP status {status}")),
            IngestError::M3u8FetchError => IngestError::Dial("failed to fetch playlist".into()),
            IngestError::Stream(e) => IngestError::Dial(e),
            other => other,
        }
    }

    /// Reclassifies a failure that happened after negotiation completed.
    pub(crate) fn into_stream(self) -> Self {
        match self {
            IngestError::IOError(e) => IngestError::Stream(e.to_string()),
            IngestError::RequestError(e) => IngestError::Stream(e.to_string()),
            IngestError::HttpError(status) => IngestError::Stream(format!("HTTP status {status}")),
            IngestError::M3u8FetchError => IngestError::Stream("failed to refresh playlist".into()),
            IngestError::M3u8ParseError(e) => IngestError::Stream(format!("invalid playlist: {e}")),
            IngestError::Negotiation(e) => IngestError::Stream(e),
            other => other,
        }
    }
}

impl From<ingest_chzzk::ChzzkError> for IngestError {
    fn from(e: ingest_chzzk::ChzzkError) -> Self {
        match e {
            ingest_chzzk::ChzzkError::Api { code, message } => IngestError::Resolution {
                status: code.to_string(),
                message,
            },
            ingest_chzzk::ChzzkError::Offline(status) => IngestError::NoRenditionAvailable(
                format!("live is not available, status: {status}"),
            ),
            ingest_chzzk::ChzzkError::NoVideo => {
                IngestError::NoRenditionAvailable("clip has no video source".into())
            }
            other => IngestError::Resolution {
                status: "request".into(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ingest_youtube::YoutubeError> for IngestError {
    fn from(e: ingest_youtube::YoutubeError) -> Self {
        match e {
            ingest_youtube::YoutubeError::Unplayable { status, reason } => {
                IngestError::Resolution {
                    status,
                    message: reason,
                }
            }
            ingest_youtube::YoutubeError::NoFormat => {
                IngestError::NoRenditionAvailable("no format with audio and a direct url".into())
            }
            ingest_youtube::YoutubeError::InvalidVideoId(id) => {
                IngestError::UnsupportedPath(format!("invalid video id: {id}"))
            }
            ingest_youtube::YoutubeError::UnsupportedUrl(url) => IngestError::UnsupportedPath(url),
            other => IngestError::Resolution {
                status: "request".into(),
                message: other.to_string(),
            },
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
