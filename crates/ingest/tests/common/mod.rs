//! Fixtures shared by the integration tests: a small MPEG-TS muxer, an
//! fMP4 box reader and session event helpers.

pub mod ts;

use std::time::Duration;

use ingest::{packager::Fragment, session::EventSender, EndReason, SessionEvent};
use tokio::sync::mpsc;

pub const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1e, 0xda, 0x05, 0x07, 0xe4];
pub const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

pub const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn events() -> (EventSender, mpsc::UnboundedReceiver<SessionEvent>) {
    mpsc::unbounded_channel()
}

/// Everything a session reported, in order.
#[derive(Debug, Default)]
pub struct Recorded {
    pub init: Option<(Vec<ingest::CodecDescriptor>, ingest::packager::InitSegment)>,
    pub fragments: Vec<Fragment>,
    pub reason: Option<EndReason>,
    /// Fragments that arrived before the init segment.
    pub early_fragments: usize,
}

/// Collects events of `session` until it ends.
pub async fn record(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    session: u64,
    timeout: Duration,
) -> Recorded {
    let mut recorded = Recorded::default();
    let collect = async {
        while let Some(event) = events.recv().await {
            if event.session() != session {
                continue;
            }
            match event {
                SessionEvent::Init { codecs, init, .. } => recorded.init = Some((codecs, init)),
                SessionEvent::Fragment { fragment, .. } => {
                    if recorded.init.is_none() {
                        recorded.early_fragments += 1;
                    }
                    recorded.fragments.push(fragment);
                }
                SessionEvent::Ended { reason, .. } => {
                    recorded.reason = Some(reason);
                    break;
                }
            }
        }
    };
    tokio::time::timeout(timeout, collect)
        .await
        .expect("session did not end in time");
    recorded
}

/// Top-level boxes of `data` as `(type, body)`.
pub fn boxes(data: &[u8]) -> Vec<(String, &[u8])> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let kind = String::from_utf8_lossy(&data[pos + 4..pos + 8]).to_string();
        assert!(size >= 8 && pos + size <= data.len(), "bad box size {size}");
        out.push((kind, &data[pos + 8..pos + size]));
        pos += size;
    }
    out
}

pub fn child<'a>(data: &'a [u8], kind: &str) -> Option<&'a [u8]> {
    boxes(data)
        .into_iter()
        .find(|(k, _)| k == kind)
        .map(|(_, body)| body)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Flags of the first sample of `track_id` in a media segment.
pub fn first_sample_flags(segment: &[u8], track_id: u32) -> Option<u32> {
    let moof = child(segment, "moof")?;
    boxes(moof)
        .into_iter()
        .filter(|(k, _)| k == "traf")
        .find_map(|(_, traf)| {
            let tfhd = child(traf, "tfhd")?;
            if read_u32(tfhd, 4) != track_id {
                return None;
            }
            let trun = child(traf, "trun")?;
            // version/flags, sample count, data offset, then
            // duration/size/flags/composition per sample
            (read_u32(trun, 4) > 0).then(|| read_u32(trun, 20))
        })
}

/// Track ids present in a media segment.
pub fn track_ids(segment: &[u8]) -> Vec<u32> {
    let Some(moof) = child(segment, "moof") else {
        return Vec::new();
    };
    boxes(moof)
        .into_iter()
        .filter(|(k, _)| k == "traf")
        .filter_map(|(_, traf)| child(traf, "tfhd").map(|tfhd| read_u32(tfhd, 4)))
        .collect()
}
