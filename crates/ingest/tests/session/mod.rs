use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use ingest::{
    config::{CompositionCorrection, PackagerConfig},
    packet::VideoCodec,
    queue::{producer_channel, ProducerOutput},
    CodecDescriptor, Connector, EndReason, IngestError, IngestResult, Packet, Player,
    SessionEvent, SessionState, StreamClient, TransportKind,
};
use tokio::task::JoinHandle;

use crate::common::{self, PPS, SPS};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    /// `dial` never completes.
    StallDial,
    /// `negotiate_codecs` never completes.
    StallNegotiate,
    /// Produces a fixed number of frames, then ends cleanly.
    Frames(usize),
    /// Produces frames until closed.
    Endless,
    /// Produces a few frames, then fails.
    Broken,
}

impl Behaviour {
    fn from_locator(locator: &str) -> IngestResult<Self> {
        let (kind, _) = locator.split_once(':').unwrap_or((locator, ""));
        match kind {
            "stall-dial" => Ok(Self::StallDial),
            "stall-negotiate" => Ok(Self::StallNegotiate),
            "frames" => Ok(Self::Frames(30)),
            "endless" => Ok(Self::Endless),
            "broken" => Ok(Self::Broken),
            other => Err(IngestError::UnsupportedScheme(other.to_string())),
        }
    }
}

struct MockConnector {
    log: Log,
}

impl Connector for MockConnector {
    type Client = MockClient;

    fn connect(&self, locator: &str) -> IngestResult<MockClient> {
        Ok(MockClient {
            name: locator.to_string(),
            behaviour: Behaviour::from_locator(locator)?,
            log: self.log.clone(),
            output: None,
            producer: None,
        })
    }
}

struct MockClient {
    name: String,
    behaviour: Behaviour,
    log: Log,
    output: Option<ProducerOutput>,
    producer: Option<JoinHandle<()>>,
}

impl MockClient {
    fn record(&self, what: &str) {
        self.log.lock().unwrap().push(format!("{what} {}", self.name));
    }
}

fn frame(index: usize) -> Packet {
    let time = Duration::from_millis(40 * index as u64);
    Packet {
        stream_index: 0,
        presentation_time: time + Duration::from_millis(80),
        decode_time: time,
        is_key_frame: index % 10 == 0,
        payload: Bytes::from(vec![0, 0, 0, 2, 0x65, index as u8]),
    }
}

impl StreamClient for MockClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Rtmp
    }

    async fn dial(&mut self) -> IngestResult<()> {
        self.record("dial");
        if self.behaviour == Behaviour::StallDial {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn negotiate_codecs(&mut self) -> IngestResult<Vec<CodecDescriptor>> {
        self.record("negotiate");
        if self.behaviour == Behaviour::StallNegotiate {
            std::future::pending::<()>().await;
        }

        let (input, output) = producer_channel(4);
        let behaviour = self.behaviour;
        self.producer = Some(tokio::spawn(async move {
            let mut index = 0;
            let result = loop {
                match behaviour {
                    Behaviour::Frames(count) if index == count => break Ok(()),
                    Behaviour::Broken if index == 15 => {
                        break Err(IngestError::Stream("connection reset".into()))
                    }
                    Behaviour::Endless => tokio::time::sleep(Duration::from_millis(5)).await,
                    _ => {}
                }
                if !input.packets.send(frame(index)).await {
                    break Err(IngestError::Cancelled);
                }
                index += 1;
            };
            input.terminal.fire(result);
        }));
        self.output = Some(output);

        Ok(vec![CodecDescriptor::Video(VideoCodec::H264 {
            sps: Bytes::from_static(SPS),
            pps: Bytes::from_static(PPS),
            width: 320,
            height: 240,
        })])
    }

    fn take_output(&mut self) -> Option<ProducerOutput> {
        self.output.take()
    }

    async fn close(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
            _ = producer.await;
        }
        self.record("close");
    }
}

type Events = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;

fn player(correction: CompositionCorrection) -> (Player<MockConnector>, Log, Events) {
    common::init_logging();
    let log = Log::default();
    let (tx, rx) = common::events();
    let config = PackagerConfig {
        composition_correction: correction,
        ..Default::default()
    };
    let player = Player::new(MockConnector { log: log.clone() }, config, tx);
    (player, log, rx)
}

async fn wait_for_state(player: &Player<MockConnector>, state: SessionState) {
    let mut watch = player.current().unwrap().watch_state();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| *s == state))
        .await
        .expect("state not reached")
        .unwrap();
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Waits until the client has actually entered a call.
async fn wait_for_entry(log: &Log, entry: &str) {
    let reached = async {
        while !entries(log).iter().any(|e| e == entry) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), reached)
        .await
        .expect("client call not reached");
}

#[tokio::test]
async fn stop_while_dialing_closes_the_client() -> anyhow::Result<()> {
    let (mut player, log, mut rx) = player(CompositionCorrection::Keep);
    let session = player.play("stall-dial").await;
    wait_for_entry(&log, "dial stall-dial").await;
    assert_eq!(player.current().unwrap().state(), SessionState::Dialing);

    player.stop().await;
    assert_eq!(entries(&log), vec!["dial stall-dial", "close stall-dial"]);

    let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;
    assert!(matches!(recorded.reason, Some(EndReason::Cancelled)));
    assert!(recorded.init.is_none());
    Ok(())
}

#[tokio::test]
async fn stop_while_negotiating_closes_the_client() -> anyhow::Result<()> {
    let (mut player, log, mut rx) = player(CompositionCorrection::Keep);
    let session = player.play("stall-negotiate").await;
    wait_for_entry(&log, "negotiate stall-negotiate").await;
    assert_eq!(player.current().unwrap().state(), SessionState::Negotiating);

    player.stop().await;
    assert_eq!(
        entries(&log),
        vec![
            "dial stall-negotiate",
            "negotiate stall-negotiate",
            "close stall-negotiate"
        ]
    );

    let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;
    assert!(matches!(recorded.reason, Some(EndReason::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn finished_stream_flushes_the_tail() -> anyhow::Result<()> {
    let (mut player, log, mut rx) = player(CompositionCorrection::Keep);
    let session = player.play("frames").await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;

    assert!(matches!(recorded.reason, Some(EndReason::Finished)));
    let (_, init) = recorded.init.unwrap();
    assert_eq!(init.mime, r#"video/mp4; codecs="avc1.42c01e""#);
    // key frames at 0, 10 and 20 of 30
    assert_eq!(recorded.fragments.len(), 3);
    assert_eq!(recorded.fragments[1].decode_time, Duration::from_millis(400));
    assert_eq!(recorded.fragments[2].duration, Duration::from_millis(400));

    player.current().unwrap().join().await;
    assert_eq!(player.current().unwrap().state(), SessionState::Stopped);
    assert_eq!(entries(&log).last().map(String::as_str), Some("close frames"));
    Ok(())
}

#[tokio::test]
async fn producer_failure_ends_the_session() -> anyhow::Result<()> {
    let (mut player, log, mut rx) = player(CompositionCorrection::Keep);
    let session = player.play("broken").await;
    let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;

    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::Stream(m)) if m == "connection reset"
    ));
    // the tail after the last key frame is not flushed on failure
    assert_eq!(recorded.fragments.len(), 1);

    player.stop().await;
    assert!(entries(&log).contains(&"close broken".to_string()));
    Ok(())
}

#[tokio::test]
async fn playing_again_tears_down_the_previous_session() -> anyhow::Result<()> {
    let (mut player, log, mut rx) = player(CompositionCorrection::Keep);
    let first = player.play("endless:a").await;
    wait_for_state(&player, SessionState::Streaming).await;

    let second = player.play("endless:b").await;
    assert_ne!(first, second);

    let log = entries(&log);
    let close_a = log.iter().position(|e| e == "close endless:a").unwrap();
    let dial_b = log.iter().position(|e| e == "dial endless:b").unwrap();
    assert!(close_a < dial_b, "{log:?}");

    // the first session has ended before anything of the second arrives
    let mut first_ended = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
        match event {
            SessionEvent::Ended { session, reason } if session == first => {
                assert!(matches!(reason, EndReason::Cancelled));
                first_ended = true;
            }
            event if event.session() == second => {
                assert!(first_ended);
                break;
            }
            _ => {}
        }
    }
    assert!(first_ended);

    player.stop().await;
    Ok(())
}

#[tokio::test]
async fn connector_errors_end_the_session_immediately() -> anyhow::Result<()> {
    let (mut player, log, mut rx) = player(CompositionCorrection::Keep);
    let session = player.play("gopher:x").await;

    let recorded = common::record(&mut rx, session, Duration::from_secs(1)).await;
    assert!(matches!(
        recorded.reason.as_ref().and_then(EndReason::error),
        Some(IngestError::UnsupportedScheme(s)) if s == "gopher"
    ));
    assert_eq!(player.current().unwrap().state(), SessionState::Stopped);
    assert!(entries(&log).is_empty());
    Ok(())
}

#[tokio::test]
async fn composition_offsets_follow_the_correction_policy() -> anyhow::Result<()> {
    // `composition` is the last field of the first trun sample
    fn first_composition(fragment: &[u8]) -> u32 {
        let moof = common::child(fragment, "moof").unwrap();
        let traf = common::child(moof, "traf").unwrap();
        let trun = common::child(traf, "trun").unwrap();
        u32::from_be_bytes(trun[24..28].try_into().unwrap())
    }

    for (correction, expected) in [
        (CompositionCorrection::Keep, 7200),
        (CompositionCorrection::AdaptiveOnly, 7200),
        (CompositionCorrection::AllTransports, 0),
    ] {
        let (mut player, _, mut rx) = player(correction);
        let session = player.play("frames").await;
        let recorded = common::record(&mut rx, session, Duration::from_secs(5)).await;
        assert_eq!(
            first_composition(&recorded.fragments[0].bytes),
            expected,
            "{correction:?}"
        );
    }
    Ok(())
}
