//! HLS client: a media playlist of MPEG-TS or CMAF segments, refreshed while
//! live.

mod playlist;

pub use playlist::{
    check_supported, load_m3u8, segment_format, HlsSegment, PlaylistTracker, PlaylistUpdate,
};

use std::collections::VecDeque;

use bytes::Bytes;
use futures::StreamExt;
use m3u8_rs::MediaPlaylist;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    negotiate, pump, Backpressure, ByteStream, EndOfInput, Pipeline, Production, TransportKind,
};
use crate::{
    error::{IngestError, IngestResult},
    packet::CodecDescriptor,
    queue::ProducerOutput,
    util::http::HttpClient,
    StreamClient,
};

const QUEUE_CAPACITY: usize = 64;

type SegmentReceiver = mpsc::UnboundedReceiver<IngestResult<Vec<HlsSegment>>>;

pub struct HlsClient {
    client: HttpClient,
    url: Url,
    retry: u32,
    playlist: Option<(Url, MediaPlaylist)>,
    production: Production,
}

impl HlsClient {
    pub fn new(client: HttpClient, url: Url, retry: u32) -> Self {
        Self {
            client,
            url,
            retry,
            playlist: None,
            production: Production::new(QUEUE_CAPACITY),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl StreamClient for HlsClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Hls
    }

    async fn dial(&mut self) -> IngestResult<()> {
        let loaded = load_m3u8(&self.client, self.url.clone(), self.retry)
            .await
            .map_err(IngestError::into_dial)?;
        self.playlist = Some(loaded);
        Ok(())
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        let Some((url, playlist)) = self.playlist.take() else {
            return Err(IngestError::Negotiation("playlist is not loaded".into()));
        };

        let format = segment_format(&playlist);
        let mut tracker = PlaylistTracker::new(self.client.clone(), url, self.retry);
        let update = tracker.advance(&playlist)?;
        log::info!(
            "Playlist has {} {format:?} segments{}",
            update.segments.len(),
            if update.ended { ", ended" } else { "" }
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        let ended = update.ended;
        let interval = update.refresh_interval;
        if !update.segments.is_empty() {
            _ = sender.send(Ok(update.segments));
        }
        if ended {
            drop(sender);
        } else {
            self.production
                .spawn(refresh(tracker, sender, interval, self.production.cancel_token()));
        }

        let mut source = segment_stream(self.client.clone(), self.retry, receiver);
        let mut pipeline = Pipeline::new(format)?;
        let descriptors = negotiate(&mut source, &mut pipeline).await?;
        self.production.start(|input, cancel| {
            pump(source, pipeline, input, cancel, EndOfInput::Clean, Backpressure::Wait)
        })?;
        Ok(descriptors)
    }

    fn take_output(&mut self) -> Option<ProducerOutput> {
        self.production.take_output()
    }

    async fn close(&mut self) {
        self.playlist = None;
        self.production.close().await;
    }
}

/// Reloads a live playlist until it ends, the consumer goes away or the
/// client is closed.
async fn refresh(
    mut tracker: PlaylistTracker,
    sender: mpsc::UnboundedSender<IngestResult<Vec<HlsSegment>>>,
    mut interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut last_load = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(last_load + interval) => {}
        }
        if sender.is_closed() {
            break;
        }

        last_load = tokio::time::Instant::now();
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = tracker.reload() => update,
        };
        let update = match update {
            Ok(update) => update,
            Err(e) => {
                log::error!("Failed to refresh playlist: {e}");
                _ = sender.send(Err(e.into_stream()));
                break;
            }
        };

        interval = update.refresh_interval;
        if !update.segments.is_empty() && sender.send(Ok(update.segments)).is_err() {
            break;
        }
        if update.ended {
            log::info!("Playlist ended.");
            break;
        }
    }
}

struct SegmentQueue {
    client: HttpClient,
    receiver: SegmentReceiver,
    queue: VecDeque<HlsSegment>,
    /// Initialization section already yielded.
    map: Option<Url>,
}

/// Segment bodies in playlist order, each preceded by its initialization
/// section whenever that changes. The stream ends once the refresh loop
/// stops sending.
fn segment_stream(client: HttpClient, retry: u32, receiver: SegmentReceiver) -> ByteStream {
    let state = SegmentQueue {
        client,
        receiver,
        queue: VecDeque::new(),
        map: None,
    };
    futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(segment) = state.queue.pop_front() {
                if let Some(map) = segment.map.clone().filter(|m| state.map.as_ref() != Some(m)) {
                    let body = fetch(&state.client, &map, retry).await;
                    state.map = Some(map);
                    state.queue.push_front(segment);
                    return Some((body, state));
                }
                let body = fetch(&state.client, &segment.url, retry).await;
                return Some((body, state));
            }
            match state.receiver.recv().await {
                Some(Ok(segments)) => state.queue.extend(segments),
                Some(Err(e)) => return Some((Err(e), state)),
                None => return None,
            }
        }
    })
    .boxed()
}

async fn fetch(client: &HttpClient, url: &Url, retry: u32) -> IngestResult<Bytes> {
    let mut last_error = None;
    for _ in 0..retry.max(1) {
        let result = async {
            let body = client
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            Ok::<_, reqwest::Error>(body)
        }
        .await;
        match result {
            Ok(body) => {
                log::debug!("Fetched {url} ({} bytes)", body.len());
                return Ok(body);
            }
            Err(e) => {
                log::warn!("Failed to fetch {url}: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(IngestError::Stream(format!(
        "segment {url} failed after {retry} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}
