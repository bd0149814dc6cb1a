//! RTMP/RTMPS play client.

pub mod amf;
pub mod chunk;

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use url::Url;

use self::{
    amf::Amf0Value,
    chunk::{ChunkReader, ChunkWriter, Message},
};
use super::{deliver, Pipeline, Production, TransportKind};
use crate::{
    demux::{flv::FlvTagParser, EsUnit, Readiness},
    error::{IngestError, IngestResult},
    packet::CodecDescriptor,
    queue::{ProducerInput, ProducerOutput},
    util::tls::{self, BoxedStream},
    StreamClient,
};

pub const DEFAULT_RTMP_PORT: u16 = 1935;
pub const DEFAULT_RTMPS_PORT: u16 = 443;

const QUEUE_CAPACITY: usize = 64;
const CHUNK_SIZE: u32 = 4096;
const BUFFER_LENGTH_MS: u32 = 3000;

const COMMAND_CHUNK_STREAM: u32 = 3;
const STREAM_CHUNK_STREAM: u32 = 8;

const EVENT_SET_BUFFER_LENGTH: u16 = 3;
const EVENT_PING_REQUEST: u16 = 6;
const EVENT_PING_RESPONSE: u16 = 7;

/// Where to connect and what to ask for, derived from the locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub app: String,
    pub stream: String,
    pub tc_url: String,
}

impl Endpoint {
    pub fn from_url(url: &Url) -> IngestResult<Self> {
        let tls = url.scheme() == "rtmps";
        let host = url
            .host_str()
            .ok_or_else(|| IngestError::InvalidLocator(format!("{url} has no host")))?
            .to_string();
        let port = url.port().unwrap_or(if tls {
            DEFAULT_RTMPS_PORT
        } else {
            DEFAULT_RTMP_PORT
        });

        let mut segments = url.path().trim_start_matches('/').splitn(2, '/');
        let app = segments
            .next()
            .filter(|app| !app.is_empty())
            .ok_or_else(|| IngestError::Dial(format!("{url} has no application name")))?
            .to_string();
        let mut stream = segments.next().unwrap_or_default().to_string();
        if let Some(query) = url.query() {
            stream.push('?');
            stream.push_str(query);
        }
        if stream.is_empty() {
            return Err(IngestError::Dial(format!("{url} has no stream name")));
        }

        let port_part = url.port().map(|p| format!(":{p}")).unwrap_or_default();
        let tc_url = format!("{}://{host}{port_part}/{app}", url.scheme());
        Ok(Self {
            host,
            port,
            tls,
            app,
            stream,
            tc_url,
        })
    }
}

enum Status {
    Started,
    Ended,
    Other,
}

/// Parses an `onStatus` command, failing on error-level statuses.
fn on_status(values: &[Amf0Value]) -> IngestResult<Status> {
    let Some(info) = values.iter().skip(2).find(|v| matches!(v, Amf0Value::Object(_))) else {
        return Ok(Status::Other);
    };
    let code = info.get("code").and_then(Amf0Value::as_str).unwrap_or_default();
    let level = info.get("level").and_then(Amf0Value::as_str).unwrap_or_default();
    log::debug!("RTMP status {code} ({level})");

    if level == "error" {
        let description = info
            .get("description")
            .and_then(Amf0Value::as_str)
            .unwrap_or_default();
        return Err(IngestError::Stream(format!("{code}: {description}")));
    }
    Ok(match code {
        "NetStream.Play.Start" | "NetStream.Play.Reset" => Status::Started,
        "NetStream.Play.Stop" | "NetStream.Play.UnpublishNotify" | "NetStream.Play.Complete" => {
            Status::Ended
        }
        _ => Status::Other,
    })
}

struct Connection {
    reader: ChunkReader<ReadHalf<BoxedStream>>,
    writer: ChunkWriter<WriteHalf<BoxedStream>>,
    stream_id: u32,
    window_ack_size: u32,
    acknowledged: u64,
    tags: FlvTagParser,
}

impl Connection {
    async fn command(
        &mut self,
        chunk_stream_id: u32,
        stream_id: u32,
        values: &[Amf0Value],
    ) -> IngestResult<()> {
        self.writer
            .write_message(&Message {
                chunk_stream_id,
                timestamp: 0,
                type_id: chunk::COMMAND_AMF0,
                stream_id,
                payload: amf::encode(values),
            })
            .await
    }

    async fn user_control(&mut self, event: u16, data: &[u8]) -> IngestResult<()> {
        let mut payload = BytesMut::with_capacity(2 + data.len());
        payload.put_u16(event);
        payload.put_slice(data);
        self.writer
            .write_message(&Message::control(chunk::USER_CONTROL, payload.freeze()))
            .await
    }

    /// Reads one message. Protocol control is answered here, media is parsed
    /// into `units` and commands are handed back.
    async fn next(&mut self, units: &mut Vec<EsUnit>) -> IngestResult<Option<Vec<Amf0Value>>> {
        let message = self.reader.read_message().await?;
        self.acknowledge().await?;

        let mut payload = message.payload;
        match message.type_id {
            chunk::SET_CHUNK_SIZE if payload.len() >= 4 => {
                let size = payload.get_u32() & 0x7fff_ffff;
                log::debug!("RTMP peer chunk size {size}");
                self.reader.set_chunk_size(size as usize);
            }
            chunk::ABORT if payload.len() >= 4 => self.reader.abort(payload.get_u32()),
            chunk::WINDOW_ACK_SIZE if payload.len() >= 4 => {
                self.window_ack_size = payload.get_u32();
            }
            chunk::SET_PEER_BANDWIDTH if payload.len() >= 4 => {
                let size = payload.get_u32();
                let mut reply = BytesMut::with_capacity(4);
                reply.put_u32(size);
                self.writer
                    .write_message(&Message::control(chunk::WINDOW_ACK_SIZE, reply.freeze()))
                    .await?;
            }
            chunk::USER_CONTROL if payload.len() >= 2 => {
                if payload.get_u16() == EVENT_PING_REQUEST {
                    let timestamp = payload.clone();
                    self.user_control(EVENT_PING_RESPONSE, &timestamp).await?;
                }
            }
            chunk::VIDEO => {
                let timestamp = Duration::from_millis(message.timestamp as u64);
                self.tags.video(timestamp, payload, units)?;
            }
            chunk::AUDIO => {
                let timestamp = Duration::from_millis(message.timestamp as u64);
                self.tags.audio(timestamp, payload, units)?;
            }
            chunk::COMMAND_AMF0 => return Ok(Some(amf::decode(payload)?)),
            chunk::DATA_AMF0 => {
                if let Ok(values) = amf::decode(payload) {
                    if let Some(name) = values.first().and_then(Amf0Value::as_str) {
                        log::debug!("RTMP data message {name}");
                    }
                }
            }
            other => log::debug!("Ignoring RTMP message type {other}"),
        }
        Ok(None)
    }

    async fn acknowledge(&mut self) -> IngestResult<()> {
        let received = self.reader.bytes_read();
        if self.window_ack_size > 0
            && received - self.acknowledged >= self.window_ack_size as u64
        {
            let mut payload = BytesMut::with_capacity(4);
            payload.put_u32(received as u32);
            self.writer
                .write_message(&Message::control(chunk::ACKNOWLEDGEMENT, payload.freeze()))
                .await?;
            self.acknowledged = received;
        }
        Ok(())
    }

    /// Waits for the `_result` of `transaction`.
    async fn result(&mut self, transaction: f64) -> IngestResult<Vec<Amf0Value>> {
        let mut ignored = Vec::new();
        loop {
            let Some(values) = self.next(&mut ignored).await? else {
                continue;
            };
            let name = values.first().and_then(Amf0Value::as_str);
            let id = values.get(1).and_then(Amf0Value::as_number);
            match (name, id) {
                (Some("_result"), Some(id)) if id == transaction => return Ok(values),
                (Some("_error"), Some(id)) if id == transaction => {
                    let description = values
                        .iter()
                        .find_map(|v| v.get("description").and_then(Amf0Value::as_str))
                        .unwrap_or("command rejected");
                    return Err(IngestError::Dial(description.to_string()));
                }
                _ => {}
            }
        }
    }
}

pub struct RtmpClient {
    url: Url,
    strict_tls: bool,
    idle_timeout: Duration,
    connection: Option<Connection>,
    production: Production,
}

impl RtmpClient {
    pub fn new(url: Url, strict_tls: bool, idle_timeout: Duration) -> Self {
        Self {
            url,
            strict_tls,
            idle_timeout,
            connection: None,
            production: Production::new(QUEUE_CAPACITY),
        }
    }

    async fn connect(&self) -> IngestResult<Connection> {
        let endpoint = Endpoint::from_url(&self.url)?;
        let mut stream =
            tls::connect(&endpoint.host, endpoint.port, endpoint.tls, self.strict_tls).await?;
        chunk::handshake(&mut stream).await?;
        log::info!("RTMP handshake with {}:{} done", endpoint.host, endpoint.port);

        let (read, write) = tokio::io::split(stream);
        let mut reader = ChunkReader::new(read);
        reader.set_idle_timeout(self.idle_timeout);
        let mut connection = Connection {
            reader,
            writer: ChunkWriter::new(write),
            stream_id: 0,
            window_ack_size: 0,
            acknowledged: 0,
            tags: FlvTagParser::default(),
        };
        connection.writer.set_chunk_size(CHUNK_SIZE).await?;

        connection
            .command(
                COMMAND_CHUNK_STREAM,
                0,
                &[
                    Amf0Value::String("connect".into()),
                    Amf0Value::Number(1.0),
                    Amf0Value::object([
                        ("app", Amf0Value::String(endpoint.app.clone())),
                        ("flashVer", Amf0Value::String("LNX 9,0,124,2".into())),
                        ("tcUrl", Amf0Value::String(endpoint.tc_url.clone())),
                        ("fpad", Amf0Value::Boolean(false)),
                        ("capabilities", Amf0Value::Number(15.0)),
                        ("audioCodecs", Amf0Value::Number(3191.0)),
                        ("videoCodecs", Amf0Value::Number(252.0)),
                        ("videoFunction", Amf0Value::Number(1.0)),
                    ]),
                ],
            )
            .await?;
        connection.result(1.0).await?;

        connection
            .command(
                COMMAND_CHUNK_STREAM,
                0,
                &[
                    Amf0Value::String("createStream".into()),
                    Amf0Value::Number(2.0),
                    Amf0Value::Null,
                ],
            )
            .await?;
        let created = connection.result(2.0).await?;
        connection.stream_id = created
            .get(3)
            .and_then(Amf0Value::as_number)
            .ok_or_else(|| IngestError::Dial("createStream returned no stream id".into()))?
            as u32;

        let stream_id = connection.stream_id;
        connection
            .command(
                STREAM_CHUNK_STREAM,
                stream_id,
                &[
                    Amf0Value::String("play".into()),
                    Amf0Value::Number(0.0),
                    Amf0Value::Null,
                    Amf0Value::String(endpoint.stream.clone()),
                    Amf0Value::Number(-2.0),
                ],
            )
            .await?;
        let mut buffer = BytesMut::with_capacity(8);
        buffer.put_u32(stream_id);
        buffer.put_u32(BUFFER_LENGTH_MS);
        connection
            .user_control(EVENT_SET_BUFFER_LENGTH, &buffer)
            .await?;
        log::info!("Playing RTMP stream {} of {}", endpoint.stream, endpoint.app);

        Ok(connection)
    }
}

impl StreamClient for RtmpClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Rtmp
    }

    async fn dial(&mut self) -> IngestResult<()> {
        let connection = self.connect().await.map_err(IngestError::into_dial)?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        let Some(mut connection) = self.connection.take() else {
            return Err(IngestError::Negotiation("not connected".into()));
        };

        let mut pipeline = Pipeline::for_units(Readiness::FirstFrame);
        let mut units = Vec::new();
        let descriptors = loop {
            if let Some(command) = connection.next(&mut units).await? {
                if command.first().and_then(Amf0Value::as_str) == Some("onStatus") {
                    let status = on_status(&command).map_err(|e| match e {
                        IngestError::Stream(m) => IngestError::Negotiation(m),
                        other => other,
                    })?;
                    if let Status::Ended = status {
                        return Err(IngestError::Negotiation(
                            "stream stopped before media arrived".into(),
                        ));
                    }
                }
            }
            if let Some(descriptors) = pipeline.push_units(units.drain(..))? {
                break descriptors;
            }
        };

        self.production
            .start(|input, cancel| produce(connection, pipeline, input, cancel))?;
        Ok(descriptors)
    }

    fn take_output(&mut self) -> Option<ProducerOutput> {
        self.production.take_output()
    }

    async fn close(&mut self) {
        self.connection = None;
        self.production.close().await;
    }
}

async fn produce(
    mut connection: Connection,
    mut pipeline: Pipeline,
    input: ProducerInput,
    cancel: CancellationToken,
) {
    let result = async {
        let mut units = Vec::new();
        loop {
            for packet in pipeline.take_packets() {
                if !deliver(&input.packets, packet, &cancel).await {
                    return Err(IngestError::Cancelled);
                }
            }

            let command = tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                command = connection.next(&mut units) => command.map_err(IngestError::into_stream)?,
            };
            if let Some(command) = command {
                if command.first().and_then(Amf0Value::as_str) == Some("onStatus") {
                    if let Status::Ended = on_status(&command)? {
                        log::info!("RTMP stream ended by server");
                        return Ok(());
                    }
                }
            }
            pipeline
                .push_units(units.drain(..))
                .map_err(IngestError::into_stream)?;
        }
    }
    .await;
    input.terminal.fire(result);
}
