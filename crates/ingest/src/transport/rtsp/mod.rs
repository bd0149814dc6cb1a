//! RTSP/RTSPS client with RTP interleaved over the control connection.

pub mod rtp;
pub mod sdp;

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use url::Url;

use self::{
    rtp::{AacDepacketizer, H264Depacketizer, RtpPacket},
    sdp::TrackCodec,
};
use super::{deliver, Pipeline, Production, TransportKind};
use crate::{
    clock::{ticks_to_duration, TimestampUnwrapper},
    codec::aac::{AacConfig, SAMPLES_PER_FRAME},
    demux::{EsUnit, Readiness, TrackKind},
    error::{IngestError, IngestResult},
    packet::CodecDescriptor,
    queue::{ProducerInput, ProducerOutput},
    util::tls::{self, BoxedStream},
    StreamClient,
};

pub const DEFAULT_RTSP_PORT: u16 = 554;
pub const DEFAULT_RTSPS_PORT: u16 = 322;

const QUEUE_CAPACITY: usize = 64;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

enum Frame {
    Interleaved { channel: u8, data: Bytes },
    Response(Response),
}

struct Connection {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    cseq: u32,
    session: Option<String>,
    authorization: Option<String>,
    user_agent: String,
    idle_timeout: Duration,
}

impl Connection {
    async fn read_frame(&mut self) -> IngestResult<Frame> {
        let timeout = self.idle_timeout;
        tokio::time::timeout(timeout, self.read_frame_inner())
            .await
            .map_err(|_| IngestError::Stream(format!("RTSP connection idle for {timeout:?}")))?
    }

    async fn read_frame_inner(&mut self) -> IngestResult<Frame> {
        let first = {
            let buf = self.reader.fill_buf().await?;
            match buf.first() {
                Some(b) => *b,
                None => return Err(IngestError::Stream("RTSP connection closed".into())),
            }
        };

        if first == b'$' {
            let mut header = [0u8; 4];
            self.reader.read_exact(&mut header).await?;
            let length = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut data = vec![0u8; length];
            self.reader.read_exact(&mut data).await?;
            return Ok(Frame::Interleaved {
                channel: header[1],
                data: Bytes::from(data),
            });
        }

        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        let mut parts = line.trim_end().splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("RTSP/") {
            return Err(IngestError::Stream(format!(
                "unexpected RTSP data: {}",
                line.trim_end()
            )));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| IngestError::Stream(format!("invalid RTSP status line: {line}")))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(IngestError::Stream("RTSP connection closed".into()));
            }
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((key, value)) = header.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        let mut response = Response {
            status,
            reason,
            headers,
            body: Bytes::new(),
        };
        if let Some(length) = response
            .header("Content-Length")
            .and_then(|l| l.parse::<usize>().ok())
        {
            let mut body = vec![0u8; length];
            self.reader.read_exact(&mut body).await?;
            response.body = Bytes::from(body);
        }
        Ok(Frame::Response(response))
    }

    async fn send(&mut self, method: &str, url: &str, headers: &[(&str, String)]) -> IngestResult<u32> {
        self.cseq += 1;
        let mut request = format!(
            "{method} {url} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: {}\r\n",
            self.cseq, self.user_agent
        );
        if let Some(authorization) = &self.authorization {
            request.push_str(&format!("Authorization: {authorization}\r\n"));
        }
        if let Some(session) = &self.session {
            request.push_str(&format!("Session: {session}\r\n"));
        }
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        log::debug!("RTSP > {method} {url}");
        self.writer.write_all(request.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(self.cseq)
    }

    /// Sends a request and waits for its response, skipping interleaved data.
    async fn request(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> IngestResult<Response> {
        self.send(method, url, headers).await?;
        loop {
            if let Frame::Response(response) = self.read_frame().await? {
                log::debug!("RTSP < {} {}", response.status, response.reason);
                if response.status == 401 {
                    let scheme = response
                        .header("WWW-Authenticate")
                        .unwrap_or_default()
                        .to_string();
                    return Err(IngestError::Dial(if scheme.starts_with("Digest") {
                        "RTSP server requires digest authentication, which is not supported"
                            .to_string()
                    } else {
                        "RTSP server rejected the credentials".to_string()
                    }));
                }
                if response.status != 200 {
                    return Err(IngestError::Dial(format!(
                        "{method} {url}: {} {}",
                        response.status, response.reason
                    )));
                }
                return Ok(response);
            }
        }
    }
}

enum Depacketizer {
    H264(H264Depacketizer),
    Aac {
        depacketizer: AacDepacketizer,
        sample_rate: u32,
    },
}

struct Track {
    id: u32,
    channel: u8,
    clock_rate: u32,
    /// RTP timestamp at the start of playback, from `RTP-Info` or the first
    /// packet.
    origin: Option<u32>,
    unwrapper: TimestampUnwrapper,
    depacketizer: Depacketizer,
}

impl Track {
    fn time(&mut self, rtp_timestamp: u32) -> Duration {
        let origin = *self.origin.get_or_insert(rtp_timestamp);
        let ticks = self
            .unwrapper
            .unwrap(rtp_timestamp.wrapping_sub(origin) as u64);
        ticks_to_duration(ticks, self.clock_rate)
    }

    fn depacketize(&mut self, data: Bytes, units: &mut Vec<EsUnit>) -> IngestResult<()> {
        let packet = RtpPacket::parse(data)?;
        match &mut self.depacketizer {
            Depacketizer::H264(depacketizer) => {
                if let Some((timestamp, nalus)) = depacketizer.push(packet) {
                    let pts = self.time(timestamp);
                    units.push(EsUnit::Video {
                        track: self.id,
                        pts,
                        dts: pts,
                        nalus,
                    });
                }
            }
            Depacketizer::Aac {
                depacketizer,
                sample_rate,
            } => {
                let sample_rate = *sample_rate;
                let frames = depacketizer.push(packet.payload)?;
                let start = self.time(packet.timestamp);
                for (i, data) in frames.into_iter().enumerate() {
                    let offset = ticks_to_duration(i as u64 * SAMPLES_PER_FRAME, sample_rate);
                    units.push(EsUnit::Audio {
                        track: self.id,
                        pts: start + offset,
                        data,
                    });
                }
            }
        }
        Ok(())
    }
}

/// `RTP-Info: url=...;seq=..;rtptime=.., url=...`
fn rtp_info_origin(rtp_info: &str, track_url: &str) -> Option<u32> {
    rtp_info.split(',').find_map(|entry| {
        let mut url = None;
        let mut rtptime = None;
        for field in entry.split(';') {
            match field.trim().split_once('=') {
                Some(("url", value)) => url = Some(value.trim()),
                Some(("rtptime", value)) => rtptime = value.trim().parse().ok(),
                _ => {}
            }
        }
        let url = url?;
        (track_url.ends_with(url) || url.ends_with(track_url)).then_some(rtptime?)
    })
}

/// `Session: <id>;timeout=<seconds>`
fn parse_session(header: &str) -> (String, Duration) {
    let mut parts = header.split(';');
    let id = parts.next().unwrap_or_default().trim().to_string();
    let timeout = parts
        .find_map(|p| p.trim().strip_prefix("timeout="))
        .and_then(|t| t.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_TIMEOUT);
    (id, timeout)
}

struct Playing {
    connection: Connection,
    url: String,
    tracks: Vec<Track>,
    declared: Vec<EsUnit>,
    keepalive: Duration,
}

pub struct RtspClient {
    url: Url,
    strict_tls: bool,
    idle_timeout: Duration,
    user_agent: String,
    playing: Option<Playing>,
    production: Production,
}

impl RtspClient {
    pub fn new(url: Url, strict_tls: bool, idle_timeout: Duration, user_agent: String) -> Self {
        Self {
            url,
            strict_tls,
            idle_timeout,
            user_agent,
            playing: None,
            production: Production::new(QUEUE_CAPACITY),
        }
    }

    async fn setup(&self) -> IngestResult<Playing> {
        let tls = self.url.scheme() == "rtsps";
        let host = self
            .url
            .host_str()
            .ok_or_else(|| IngestError::InvalidLocator(format!("{} has no host", self.url)))?;
        let port = self.url.port().unwrap_or(if tls {
            DEFAULT_RTSPS_PORT
        } else {
            DEFAULT_RTSP_PORT
        });

        let authorization = if self.url.username().is_empty() {
            None
        } else {
            let user = decode_userinfo(self.url.username());
            let password = decode_userinfo(self.url.password().unwrap_or_default());
            Some(format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))))
        };
        let mut request_url = self.url.clone();
        _ = request_url.set_username("");
        _ = request_url.set_password(None);
        let request_url = request_url.to_string();

        let stream = tls::connect(host, port, tls, self.strict_tls).await?;
        let (read, write) = tokio::io::split(stream);
        let mut connection = Connection {
            reader: BufReader::new(read),
            writer: write,
            cseq: 0,
            session: None,
            authorization,
            user_agent: self.user_agent.clone(),
            idle_timeout: self.idle_timeout,
        };

        let described = connection
            .request("DESCRIBE", &request_url, &[("Accept", "application/sdp".into())])
            .await?;
        let base = described
            .header("Content-Base")
            .or_else(|| described.header("Content-Location"))
            .unwrap_or(&request_url)
            .to_string();
        let session = sdp::parse(&String::from_utf8_lossy(&described.body))?;
        let base = sdp::control_url(&base, session.control.as_deref());

        let mut tracks = Vec::new();
        let mut declared = Vec::new();
        let mut configs = Vec::new();
        let mut track_urls = Vec::new();
        let mut keepalive = DEFAULT_SESSION_TIMEOUT;
        for media in &session.media {
            let Some(codec) = media.codec()? else {
                continue;
            };
            let id = tracks.len() as u32;
            let channel = (id * 2) as u8;
            let track_url = sdp::control_url(&base, media.control.as_deref());

            let response = connection
                .request(
                    "SETUP",
                    &track_url,
                    &[(
                        "Transport",
                        format!("RTP/AVP/TCP;unicast;interleaved={}-{}", channel, channel + 1),
                    )],
                )
                .await?;
            if let Some(header) = response.header("Session") {
                let (id, timeout) = parse_session(header);
                connection.session = Some(id);
                keepalive = timeout;
            }

            let (kind, depacketizer, clock_rate) = match codec {
                TrackCodec::H264 { sps, pps } => {
                    if let (Some(sps), Some(pps)) = (sps, pps) {
                        configs.push(EsUnit::VideoConfig { track: id, sps, pps });
                    }
                    (
                        TrackKind::Video,
                        Depacketizer::H264(H264Depacketizer::default()),
                        media.clock_rate,
                    )
                }
                TrackCodec::Aac {
                    config,
                    size_length,
                    index_length,
                    index_delta_length,
                } => {
                    let sample_rate = AacConfig::parse(&config)?.sample_rate();
                    configs.push(EsUnit::AudioConfig { track: id, config });
                    (
                        TrackKind::Audio,
                        Depacketizer::Aac {
                            depacketizer: AacDepacketizer::new(
                                size_length,
                                index_length,
                                index_delta_length,
                            ),
                            sample_rate,
                        },
                        media.clock_rate,
                    )
                }
            };
            declared.push(EsUnit::Declare { track: id, kind });
            tracks.push(Track {
                id,
                channel,
                clock_rate: if clock_rate == 0 { 90_000 } else { clock_rate },
                origin: None,
                unwrapper: TimestampUnwrapper::new(32),
                depacketizer,
            });
            track_urls.push(track_url);
        }
        if tracks.is_empty() {
            return Err(IngestError::Negotiation(
                "RTSP session has no supported track".into(),
            ));
        }
        declared.extend(configs);

        let played = connection
            .request("PLAY", &base, &[("Range", "npt=0.000-".into())])
            .await?;
        if let Some(rtp_info) = played.header("RTP-Info") {
            for (track, url) in tracks.iter_mut().zip(&track_urls) {
                track.origin = rtp_info_origin(rtp_info, url);
            }
        }
        log::info!("Playing RTSP session {base} with {} tracks", tracks.len());

        Ok(Playing {
            connection,
            url: base,
            tracks,
            declared,
            keepalive: (keepalive / 2).max(Duration::from_secs(1)),
        })
    }
}

/// Percent-decoding of URL userinfo.
fn decode_userinfo(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={value}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| value.to_string())
}

impl Playing {
    /// Reads one frame and depacketizes it into `units`.
    async fn next(&mut self, units: &mut Vec<EsUnit>) -> IngestResult<()> {
        match self.connection.read_frame().await? {
            Frame::Interleaved { channel, data } => {
                if let Some(track) = self.tracks.iter_mut().find(|t| t.channel == channel) {
                    track.depacketize(data, units)?;
                }
            }
            Frame::Response(response) if response.status != 200 => {
                log::warn!("RTSP keepalive answered {} {}", response.status, response.reason);
            }
            Frame::Response(_) => {}
        }
        Ok(())
    }

    async fn keepalive(&mut self) -> IngestResult<()> {
        let url = self.url.clone();
        self.connection.send("GET_PARAMETER", &url, &[]).await?;
        Ok(())
    }

    async fn teardown(&mut self) {
        let url = self.url.clone();
        let sent = tokio::time::timeout(
            Duration::from_secs(1),
            self.connection.send("TEARDOWN", &url, &[]),
        )
        .await;
        if !matches!(sent, Ok(Ok(_))) {
            log::debug!("RTSP teardown of {url} was not sent");
        }
    }
}

impl StreamClient for RtspClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Rtsp
    }

    async fn dial(&mut self) -> IngestResult<()> {
        let playing = self.setup().await.map_err(|e| match e {
            IngestError::Negotiation(m) => IngestError::Negotiation(m),
            other => other.into_dial(),
        })?;
        self.playing = Some(playing);
        Ok(())
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        let Some(mut playing) = self.playing.take() else {
            return Err(IngestError::Negotiation("not playing".into()));
        };

        let mut pipeline = Pipeline::for_units(Readiness::Declared);
        let declared = std::mem::take(&mut playing.declared);
        let mut descriptors = pipeline.push_units(declared)?;
        let mut units = Vec::new();
        // parameter sets missing from the SDP arrive in-band
        while descriptors.is_none() {
            playing.next(&mut units).await?;
            descriptors = pipeline.push_units(units.drain(..))?;
        }
        let descriptors = descriptors.unwrap_or_default();

        self.production
            .start(|input, cancel| produce(playing, pipeline, input, cancel))?;
        Ok(descriptors)
    }

    fn take_output(&mut self) -> Option<ProducerOutput> {
        self.production.take_output()
    }

    async fn close(&mut self) {
        if let Some(mut playing) = self.playing.take() {
            playing.teardown().await;
        }
        self.production.close().await;
    }
}

async fn produce(
    mut playing: Playing,
    mut pipeline: Pipeline,
    input: ProducerInput,
    cancel: CancellationToken,
) {
    let result = async {
        let mut units = Vec::new();
        let mut last_keepalive = tokio::time::Instant::now();
        loop {
            for packet in pipeline.take_packets() {
                if !deliver(&input.packets, packet, &cancel).await {
                    return Err(IngestError::Cancelled);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                read = playing.next(&mut units) => read.map_err(IngestError::into_stream)?,
            }
            // sent between reads so an interleaved frame is never cut short
            if last_keepalive.elapsed() >= playing.keepalive {
                playing.keepalive().await.map_err(IngestError::into_stream)?;
                last_keepalive = tokio::time::Instant::now();
            }
            pipeline
                .push_units(units.drain(..))
                .map_err(IngestError::into_stream)?;
        }
    }
    .await;

    if result.as_ref().is_err_and(IngestError::is_cancelled) {
        playing.teardown().await;
    }
    input.terminal.fire(result);
}
