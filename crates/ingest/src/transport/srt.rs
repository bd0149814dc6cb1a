use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use srt_tokio::SrtSocket;
use url::Url;

use super::{
    negotiate, pump, Backpressure, ByteStream, EndOfInput, Pipeline, Production, TransportKind,
};
use crate::{
    config::IngestConfig,
    demux::ContainerFormat,
    error::{IngestError, IngestResult},
    packet::CodecDescriptor,
    queue::ProducerOutput,
    StreamClient,
};

/// Caller parameters taken from an `srt://` locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtOptions {
    pub host: String,
    pub port: u16,
    pub stream_id: Option<String>,
    pub passphrase: Option<String>,
    pub latency: Duration,
}

impl SrtOptions {
    pub fn from_url(url: &Url, default_latency: Duration) -> IngestResult<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| IngestError::InvalidLocator(format!("{url} has no host")))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| IngestError::InvalidLocator(format!("{url} has no port")))?;

        let mut options = Self {
            host,
            port,
            stream_id: None,
            passphrase: None,
            latency: default_latency,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "streamid" => options.stream_id = Some(value.into_owned()),
                "passphrase" => options.passphrase = Some(value.into_owned()),
                "latency" => {
                    let ms = value.parse::<u64>().map_err(|_| {
                        IngestError::InvalidLocator(format!("invalid SRT latency: {value}"))
                    })?;
                    options.latency = Duration::from_millis(ms);
                }
                _ => log::debug!("Ignoring SRT option {key}"),
            }
        }

        // access-control stream ids are often written as a fragment
        if options.stream_id.is_none() {
            if let Some(fragment) = url.fragment().filter(|f| f.starts_with("!::")) {
                options.stream_id = Some(format!("#{fragment}"));
            }
        }
        Ok(options)
    }
}

pub struct SrtClient {
    url: Url,
    default_latency: Duration,
    stall_timeout: Duration,
    source: Option<ByteStream>,
    production: Production,
}

impl SrtClient {
    pub fn new(url: Url, config: &IngestConfig) -> Self {
        Self {
            url,
            default_latency: config.srt_latency(),
            stall_timeout: config.srt_stall_timeout(),
            source: None,
            production: Production::new(config.srt_queue_capacity),
        }
    }
}

impl StreamClient for SrtClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Srt
    }

    async fn dial(&mut self) -> IngestResult<()> {
        let options = SrtOptions::from_url(&self.url, self.default_latency)?;
        let address = tokio::net::lookup_host((options.host.as_str(), options.port))
            .await
            .map_err(|e| IngestError::Dial(format!("resolve {}: {e}", options.host)))?
            .next()
            .ok_or_else(|| IngestError::Dial(format!("{} has no address", options.host)))?;

        let mut builder = SrtSocket::builder().latency(options.latency);
        if let Some(passphrase) = &options.passphrase {
            builder = builder.encryption(0, passphrase.as_str());
        }
        let socket = builder
            .call(address, options.stream_id.as_deref())
            .await
            .map_err(|e| IngestError::Dial(format!("SRT call to {address}: {e}")))?;
        log::info!("SRT connected to {address}");

        self.source = Some(
            socket
                .map_ok(|(_, data)| data)
                .map_err(IngestError::from)
                .boxed(),
        );
        Ok(())
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        let Some(mut source) = self.source.take() else {
            return Err(IngestError::Negotiation("not connected".into()));
        };

        let mut pipeline = Pipeline::new(ContainerFormat::Ts)?;
        let descriptors = negotiate(&mut source, &mut pipeline).await?;
        let backpressure = Backpressure::DropAfter(self.stall_timeout);
        self.production.start(|input, cancel| {
            pump(source, pipeline, input, cancel, EndOfInput::Clean, backpressure)
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
