use crate::{
    error::IngestResult,
    packet::CodecDescriptor,
    platform::PlatformClient,
    queue::ProducerOutput,
    transport::{
        file::FileClient, hls::HlsClient, http::HttpStreamClient, rtmp::RtmpClient,
        rtsp::RtspClient, srt::SrtClient, TransportKind,
    },
    StreamClient,
};

/// Every source the dispatcher can build.
pub enum Client {
    File(FileClient),
    Http(HttpStreamClient),
    Hls(HlsClient),
    Rtmp(RtmpClient),
    Srt(SrtClient),
    Rtsp(RtspClient),
    Platform(PlatformClient),
}

impl StreamClient for Client {
    fn kind(&self) -> TransportKind {
        match self {
            Client::File(client) => client.kind(),
            Client::Http(client) => client.kind(),
            Client::Hls(client) => client.kind(),
            Client::Rtmp(client) => client.kind(),
            Client::Srt(client) => client.kind(),
            Client::Rtsp(client) => client.kind(),
            Client::Platform(client) => client.kind(),
        }
    }

    async fn dial(&mut self) -> IngestResult<()> {
        match self {
            Client::File(client) => client.dial().await,
            Client::Http(client) => client.dial().await,
            Client::Hls(client) => client.dial().await,
            Client::Rtmp(client) => client.dial().await,
            Client::Srt(client) => client.dial().await,
            Client::Rtsp(client) => client.dial().await,
            Client::Platform(client) => client.dial().await,
        }
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        match self {
            Client::File(client) => client.negotiate_codecs().await,
            Client::Http(client) => client.negotiate_codecs().await,
            Client::Hls(client) => client.negotiate_codecs().await,
            Client::Rtmp(client) => client.negotiate_codecs().await,
            Client::Srt(client) => client.negotiate_codecs().await,
            Client::Rtsp(client) => client.negotiate_codecs().await,
            Client::Platform(client) => client.negotiate_codecs().await,
        }
    }

    fn take_output(&mut self) -> Option<ProducerOutput> {
        match self {
            Client::File(client) => client.take_output(),
            Client::Http(client) => client.take_output(),
            Client::Hls(client) => client.take_output(),
            Client::Rtmp(client) => client.take_output(),
            Client::Srt(client) => client.take_output(),
            Client::Rtsp(client) => client.take_output(),
            Client::Platform(client) => client.take_output(),
        }
    }

    async fn close(&mut self) {
        match self {
            Client::File(client) => client.close().await,
            Client::Http(client) => client.close().await,
            Client::Hls(client) => client.close().await,
            Client::Rtmp(client) => client.close().await,
            Client::Srt(client) => client.close().await,
            Client::Rtsp(client) => client.close().await,
            Client::Platform(client) => client.close().await,
        }
    }
}
