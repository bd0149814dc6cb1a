//! Transport producers and the plumbing they share.

pub mod file;
pub mod hls;
pub mod http;
pub mod rtmp;
pub mod rtsp;
pub mod srt;

use std::{
    collections::VecDeque,
    future::Future,
    io::{Read, Seek},
    time::Duration,
};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    demux::{
        mp4::Mp4Demuxer, Assembled, ContainerFormat, Demuxer, EsUnit, Readiness, TrackAssembler,
    },
    error::{IngestError, IngestResult},
    packet::{CodecDescriptor, Packet},
    queue::{producer_channel, Delivery, PacketSender, ProducerInput, ProducerOutput},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    File,
    Http,
    Hls,
    Rtmp,
    Srt,
    Rtsp,
    /// A platform locator whose transport is not resolved yet.
    Platform,
}

pub(crate) type ByteStream = BoxStream<'static, IngestResult<Bytes>>;

/// Demuxer plus assembler, collecting packets until they can be sent.
pub(crate) struct Pipeline {
    demuxer: Option<Demuxer>,
    assembler: TrackAssembler,
    units: Vec<EsUnit>,
    assembled: Vec<Assembled>,
    pending: VecDeque<Packet>,
    finished: bool,
}

impl Pipeline {
    pub fn new(format: ContainerFormat) -> IngestResult<Self> {
        let demuxer = Demuxer::new(format)?;
        let mut pipeline = Self::for_units(demuxer.readiness());
        pipeline.demuxer = Some(demuxer);
        Ok(pipeline)
    }

    /// A pipeline fed with units produced elsewhere.
    pub fn for_units(readiness: Readiness) -> Self {
        Self {
            demuxer: None,
            assembler: TrackAssembler::new(readiness),
            units: Vec::new(),
            assembled: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Returns the codec set the moment it becomes known.
    pub fn feed(&mut self, data: &[u8]) -> IngestResult<Option<Vec<CodecDescriptor>>> {
        if let Some(demuxer) = &mut self.demuxer {
            demuxer.push(data, &mut self.units)?;
        }
        self.assemble()
    }

    pub fn push_units(
        &mut self,
        units: impl IntoIterator<Item = EsUnit>,
    ) -> IngestResult<Option<Vec<CodecDescriptor>>> {
        self.units.extend(units);
        self.assemble()
    }

    /// Completes units still held by the demuxer without ending the input.
    pub fn flush(&mut self) -> IngestResult<Option<Vec<CodecDescriptor>>> {
        if let Some(Demuxer::Ts(demuxer)) = &mut self.demuxer {
            demuxer.flush(&mut self.units);
        }
        self.assemble()
    }

    pub fn finish(&mut self) -> IngestResult<Option<Vec<CodecDescriptor>>> {
        self.finished = true;
        if let Some(demuxer) = &mut self.demuxer {
            demuxer.finish(&mut self.units)?;
        }
        self.assemble()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn take_packets(&mut self) -> VecDeque<Packet> {
        std::mem::take(&mut self.pending)
    }

    fn assemble(&mut self) -> IngestResult<Option<Vec<CodecDescriptor>>> {
        for unit in self.units.drain(..) {
            self.assembler.push(unit, &mut self.assembled)?;
        }

        let mut ready = None;
        for item in self.assembled.drain(..) {
            match item {
                Assembled::Ready(descriptors) => ready = Some(descriptors),
                Assembled::Packet(packet) => self.pending.push_back(packet),
            }
        }
        Ok(ready)
    }
}

/// Reads `source` until the pipeline can describe every stream.
pub(crate) async fn negotiate(
    source: &mut ByteStream,
    pipeline: &mut Pipeline,
) -> IngestResult<Vec<CodecDescriptor>> {
    loop {
        let descriptors = match source.next().await {
            Some(Ok(chunk)) => pipeline.feed(&chunk)?,
            Some(Err(e)) => return Err(e),
            None => match pipeline.finish()? {
                Some(descriptors) => descriptors,
                None => {
                    return Err(IngestError::Negotiation(
                        "stream ended before codec parameters were found".into(),
                    ))
                }
            },
        };
        if let Some(descriptors) = descriptors {
            return Ok(descriptors);
        }
    }
}

/// How an exhausted byte source ends the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndOfInput {
    Clean,
    /// Live sources are not supposed to end.
    Unexpected,
}

impl EndOfInput {
    fn result(self) -> IngestResult<()> {
        match self {
            EndOfInput::Clean => Ok(()),
            EndOfInput::Unexpected => {
                Err(IngestError::Stream("live stream ended unexpectedly".into()))
            }
        }
    }
}

/// What a producer does when the packet queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backpressure {
    /// Stop reading the source until there is room.
    Wait,
    /// Wait at most this long, then drop the packet. For sources without
    /// flow control that must keep being drained.
    DropAfter(Duration),
}

/// Sends a packet unless cancelled first. `false` means stop producing.
pub(crate) async fn deliver(
    packets: &PacketSender,
    packet: Packet,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = packets.send(packet) => sent,
    }
}

async fn deliver_with(
    packets: &PacketSender,
    packet: Packet,
    cancel: &CancellationToken,
    backpressure: Backpressure,
) -> bool {
    let Backpressure::DropAfter(timeout) = backpressure else {
        return deliver(packets, packet, cancel).await;
    };
    let stream_index = packet.stream_index;
    let delivery = tokio::select! {
        _ = cancel.cancelled() => return false,
        delivery = packets.send_within(packet, timeout) => delivery,
    };
    match delivery {
        Delivery::Sent => true,
        Delivery::Dropped => {
            log::warn!("Packet queue stalled for {timeout:?}, dropping a packet of stream {stream_index}");
            true
        }
        Delivery::Closed => false,
    }
}

/// Production loop for byte-oriented sources (file, progressive HTTP, HLS
/// segments, SRT).
pub(crate) async fn pump(
    mut source: ByteStream,
    mut pipeline: Pipeline,
    input: ProducerInput,
    cancel: CancellationToken,
    end: EndOfInput,
    backpressure: Backpressure,
) {
    let result = async {
        loop {
            for packet in pipeline.take_packets() {
                if !deliver_with(&input.packets, packet, &cancel, backpressure).await {
                    return Err(IngestError::Cancelled);
                }
            }
            if pipeline.is_finished() {
                return end.result();
            }

            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                chunk = source.next() => chunk,
            };
            match chunk {
                Some(Ok(data)) => {
                    pipeline.feed(&data).map_err(IngestError::into_stream)?;
                }
                Some(Err(e)) => return Err(e.into_stream()),
                None => {
                    pipeline.finish().map_err(IngestError::into_stream)?;
                }
            }
        }
    }
    .await;
    input.terminal.fire(result);
}

/// Samples handed to the pipeline per blocking read.
const SAMPLE_BATCH: usize = 32;

/// A progressive MP4 read sample by sample off the async runtime.
pub(crate) struct SampleSource<R> {
    demuxer: Option<Mp4Demuxer<R>>,
    described: Vec<EsUnit>,
}

impl<R> SampleSource<R>
where
    R: Read + Seek + Send + 'static,
{
    /// Parses the `moov` box of `reader`.
    pub async fn open(reader: R, size: u64) -> IngestResult<Self> {
        tokio::task::spawn_blocking(move || {
            let demuxer = Mp4Demuxer::open(reader, size)?;
            let mut described = Vec::new();
            demuxer.describe(&mut described)?;
            Ok(Self {
                demuxer: Some(demuxer),
                described,
            })
        })
        .await?
    }

    /// The next batch of units, `None` once every sample was read.
    async fn next_batch(&mut self) -> IngestResult<Option<Vec<EsUnit>>> {
        if !self.described.is_empty() {
            return Ok(Some(std::mem::take(&mut self.described)));
        }
        let Some(mut demuxer) = self.demuxer.take() else {
            return Ok(None);
        };
        let (demuxer, units, more) = tokio::task::spawn_blocking(move || {
            let mut units = Vec::new();
            let more = demuxer.read_units(SAMPLE_BATCH, &mut units)?;
            Ok::<_, IngestError>((demuxer, units, more))
        })
        .await??;
        if more {
            self.demuxer = Some(demuxer);
        }
        Ok(Some(units))
    }
}

/// Like [`negotiate`], for a seekable sample source.
pub(crate) async fn negotiate_samples<R>(
    source: &mut SampleSource<R>,
    pipeline: &mut Pipeline,
) -> IngestResult<Vec<CodecDescriptor>>
where
    R: Read + Seek + Send + 'static,
{
    loop {
        let descriptors = match source.next_batch().await? {
            Some(units) => pipeline.push_units(units)?,
            None => pipeline.finish()?,
        };
        if let Some(descriptors) = descriptors {
            return Ok(descriptors);
        }
        if pipeline.is_finished() {
            return Err(IngestError::Negotiation(
                "mp4 ended before codec parameters were found".into(),
            ));
        }
    }
}

/// Like [`pump`], reading one batch of samples per queue drain so at most a
/// batch is held in memory.
pub(crate) async fn pump_samples<R>(
    mut source: SampleSource<R>,
    mut pipeline: Pipeline,
    input: ProducerInput,
    cancel: CancellationToken,
) where
    R: Read + Seek + Send + 'static,
{
    let result = async {
        loop {
            for packet in pipeline.take_packets() {
                if !deliver(&input.packets, packet, &cancel).await {
                    return Err(IngestError::Cancelled);
                }
            }
            if pipeline.is_finished() {
                return Ok(());
            }

            let batch = tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                batch = source.next_batch() => batch,
            };
            match batch.map_err(IngestError::into_stream)? {
                Some(units) => pipeline.push_units(units),
                None => pipeline.finish(),
            }
            .map_err(IngestError::into_stream)?;
        }
    }
    .await;
    input.terminal.fire(result);
}

/// Background production tasks of one client and the channel they feed.
pub(crate) struct Production {
    cancel: CancellationToken,
    tasks: TaskTracker,
    input: Option<ProducerInput>,
    output: Option<ProducerOutput>,
}

impl Production {
    pub fn new(capacity: usize) -> Self {
        let (input, output) = producer_channel(capacity);
        Self {
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            input: Some(input),
            output: Some(output),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the production task. The producer halves move into it, so a
    /// task that dies silently still ends the terminal signal.
    pub fn start<F, Fut>(&mut self, task: F) -> IngestResult<()>
    where
        F: FnOnce(ProducerInput, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let input = self
            .input
            .take()
            .ok_or_else(|| IngestError::Negotiation("producer already started".into()))?;
        self.tasks.spawn(task(input, self.cancel.clone()));
        Ok(())
    }

    /// Spawns a helper task that lives as long as the production.
    pub fn spawn<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn take_output(&mut self) -> Option<ProducerOutput> {
        self.output.take()
    }

    /// Cancels every task and waits until they have released their
    /// resources. Safe to call more than once.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.input = None;
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Drop for Production {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
