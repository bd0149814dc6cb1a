use std::io::Cursor;

use bytes::BytesMut;
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use url::Url;

use super::{
    negotiate, negotiate_samples, pump, pump_samples, Backpressure, ByteStream, EndOfInput,
    Pipeline, Production, SampleSource, TransportKind,
};
use crate::{
    demux::{ContainerFormat, Readiness},
    error::{IngestError, IngestResult},
    packet::CodecDescriptor,
    queue::ProducerOutput,
    util::http::HttpClient,
    StreamClient,
};

const QUEUE_CAPACITY: usize = 64;

/// Progressive download of a single container over HTTP.
pub struct HttpStreamClient {
    client: HttpClient,
    url: Url,
    format: Option<ContainerFormat>,
    live: bool,
    source: Option<ByteStream>,
    production: Production,
}

impl HttpStreamClient {
    pub fn new(client: HttpClient, url: Url) -> Self {
        Self {
            client,
            url,
            format: None,
            live: false,
            source: None,
            production: Production::new(QUEUE_CAPACITY),
        }
    }

    /// Uses `format` instead of guessing from the URL path. Platform media
    /// URLs rarely carry an extension.
    pub fn with_format(mut self, format: ContainerFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Known after dial: the response carried no content length.
    pub fn is_live(&self) -> bool {
        self.live
    }
}

impl StreamClient for HttpStreamClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn dial(&mut self) -> IngestResult<()> {
        let format = match self.format {
            Some(format) => format,
            None => ContainerFormat::from_url(&self.url)?,
        };

        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| IngestError::from(e).into_dial())?;
        if response.status() != StatusCode::OK {
            return Err(IngestError::Dial(format!(
                "{} responded with {}",
                self.url,
                response.status()
            )));
        }

        let live = !matches!(response.content_length(), Some(length) if length > 0);
        if live && format.needs_random_access() {
            return Err(IngestError::Dial(format!(
                "{format:?} needs random access and cannot be played from a live response"
            )));
        }
        log::info!(
            "Streaming {} as {format:?}{}",
            self.url,
            if live { " (live)" } else { "" }
        );

        self.format = Some(format);
        self.live = live;
        self.source = Some(
            response
                .bytes_stream()
                .map_err(IngestError::from)
                .boxed(),
        );
        Ok(())
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        let (Some(format), Some(mut source)) = (self.format, self.source.take()) else {
            return Err(IngestError::Negotiation("response is not open".into()));
        };

        if format.needs_random_access() {
            // sample tables point anywhere in the body
            let mut body = BytesMut::new();
            while let Some(chunk) = source.next().await {
                body.extend_from_slice(&chunk?);
            }
            let size = body.len() as u64;
            let mut source = SampleSource::open(Cursor::new(body.freeze()), size).await?;
            let mut pipeline = Pipeline::for_units(Readiness::Declared);
            let descriptors = negotiate_samples(&mut source, &mut pipeline).await?;
            self.production
                .start(|input, cancel| pump_samples(source, pipeline, input, cancel))?;
            return Ok(descriptors);
        }

        let mut pipeline = Pipeline::new(format)?;
        let descriptors = negotiate(&mut source, &mut pipeline).await?;
        let end = if self.live {
            EndOfInput::Unexpected
        } else {
            EndOfInput::Clean
        };
        self.production
            .start(|input, cancel| {
                pump(source, pipeline, input, cancel, end, Backpressure::Wait)
            })?;
        Ok(descriptors)
    }

    fn take_output(&mut self) -> Option<ProducerOutput> {
        self.production.take_output()
    }

    async fn close(&mut self) {
        self.source = None;
        self.production.close().await;
    }
}
