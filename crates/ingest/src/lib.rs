pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod demux;
pub mod error;
pub mod fmp4;
pub mod locator;
pub mod packager;
pub mod packet;
pub mod platform;
pub mod queue;
pub mod session;
pub mod transport;
pub mod util;

pub use client::Client;
pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use locator::{dispatch, route, Connector, Dispatcher, Route};
pub use packet::{CodecDescriptor, Packet};
pub use session::{EndReason, Player, Session, SessionEvent, SessionState};
pub use transport::TransportKind;

use std::future::Future;

use queue::ProducerOutput;

///   locator ──► Dispatcher ──► Client::dial ──► Client::negotiate_codecs
///                                                      │
///                    ┌─────────────────────────────────┘
///                    ▼
///   ┌──────────────────────────┐  packets   ┌──────────────┐  fragments
///   │ production task(s) [MPSC]├───────────►│ session pump ├────────────►
///   │                          ├───────────►│  + packager  │
///   └──────────────────────────┘  terminal  └──────────────┘
///
/// A client is owned by exactly one session. `dial` and `negotiate_codecs`
/// are called at most once each, in that order, and may be abandoned at any
/// await point; `close` must still release everything afterwards.
pub trait StreamClient: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Connects or opens the source. No codec data is read yet.
    fn dial(&mut self) -> impl Future<Output = IngestResult<()>> + Send;

    /// Reads until every stream is described, then starts producing packets.
    fn negotiate_codecs(&mut self) -> impl Future<Output = IngestResult<Vec<CodecDescriptor>>> + Send;

    /// The packet receiver and terminal signal. Yields `Some` once.
    fn take_output(&mut self) -> Option<ProducerOutput>;

    /// Stops production and releases the connection. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
