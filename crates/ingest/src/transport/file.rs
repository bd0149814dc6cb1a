use std::{io::BufReader, path::PathBuf};

use futures::{StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

use super::{
    negotiate, negotiate_samples, pump, pump_samples, Backpressure, EndOfInput, Pipeline,
    Production, SampleSource, TransportKind,
};
use crate::{
    demux::{ContainerFormat, Readiness},
    error::{IngestError, IngestResult},
    packet::CodecDescriptor,
    queue::ProducerOutput,
    StreamClient,
};

const QUEUE_CAPACITY: usize = 16;

/// Demuxes a local container file chosen by its extension.
pub struct FileClient {
    path: PathBuf,
    format: Option<ContainerFormat>,
    file: Option<tokio::fs::File>,
    production: Production,
}

impl FileClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
            file: None,
            production: Production::new(QUEUE_CAPACITY),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl StreamClient for FileClient {
    fn kind(&self) -> TransportKind {
        TransportKind::File
    }

    async fn dial(&mut self) -> IngestResult<()> {
        let format = ContainerFormat::from_path(&self.path)?;
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| IngestError::Dial(format!("open {}: {e}", self.path.display())))?;
        log::info!("Opened {} as {format:?}", self.path.display());

        self.format = Some(format);
        self.file = Some(file);
        Ok(())
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        let (Some(format), Some(file)) = (self.format, self.file.take()) else {
            return Err(IngestError::Negotiation("file is not open".into()));
        };

        if format.needs_random_access() {
            let size = file.metadata().await?.len();
            let file = BufReader::new(file.into_std().await);
            let mut source = SampleSource::open(file, size).await?;
            let mut pipeline = Pipeline::for_units(Readiness::Declared);
            let descriptors = negotiate_samples(&mut source, &mut pipeline).await?;
            self.production
                .start(|input, cancel| pump_samples(source, pipeline, input, cancel))?;
            return Ok(descriptors);
        }

        let mut source = ReaderStream::new(file).map_err(IngestError::from).boxed();
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
        self.file = None;
        self.production.close().await;
    }
}
