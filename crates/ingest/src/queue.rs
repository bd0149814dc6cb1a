//! The two-stream producer contract: a bounded packet channel and a
//! single-fire terminal slot.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    oneshot,
};

use crate::{
    error::{IngestError, IngestResult},
    packet::Packet,
};

pub fn packet_queue(capacity: usize) -> (PacketSender, PacketReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PacketSender { tx },
        PacketReceiver {
            rx,
            last_decode_time: HashMap::new(),
        },
    )
}

#[derive(Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<Packet>,
}

/// Outcome of a bounded-wait send.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
    Closed,
}

impl PacketSender {
    /// Waits for queue space. Returns `false` once the consumer is gone.
    pub async fn send(&self, packet: Packet) -> bool {
        self.tx.send(packet).await.is_ok()
    }

    /// Waits at most `timeout` for queue space, then gives the packet up.
    pub async fn send_within(&self, packet: Packet, timeout: Duration) -> Delivery {
        match self.tx.send_timeout(packet, timeout).await {
            Ok(()) => Delivery::Sent,
            Err(SendTimeoutError::Timeout(_)) => Delivery::Dropped,
            Err(SendTimeoutError::Closed(_)) => Delivery::Closed,
        }
    }
}

pub struct PacketReceiver {
    rx: mpsc::Receiver<Packet>,
    last_decode_time: HashMap<usize, Duration>,
}

impl PacketReceiver {
    /// Next packet, with `decode_time` clamped so that it never goes
    /// backwards within a stream.
    pub async fn recv(&mut self) -> Option<Packet> {
        let mut packet = self.rx.recv().await?;
        let last = self
            .last_decode_time
            .entry(packet.stream_index)
            .or_insert(packet.decode_time);
        if packet.decode_time < *last {
            log::debug!(
                "Stream {} decode time went backwards ({:?} < {:?}), clamping",
                packet.stream_index,
                packet.decode_time,
                last
            );
            packet.decode_time = *last;
            if packet.presentation_time < packet.decode_time {
                packet.presentation_time = packet.decode_time;
            }
        }
        *last = packet.decode_time;
        Some(packet)
    }
}

type Slot = Arc<Mutex<Option<oneshot::Sender<IngestResult<()>>>>>;

/// Write side of the terminal signal. Every production task of a client
/// holds a clone; the first one to fire wins.
#[derive(Clone)]
pub struct Terminal {
    slot: Slot,
}

/// Read side of the terminal signal.
pub struct TerminalSignal {
    rx: oneshot::Receiver<IngestResult<()>>,
}

pub fn terminal() -> (Terminal, TerminalSignal) {
    let (tx, rx) = oneshot::channel();
    (
        Terminal {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        TerminalSignal { rx },
    )
}

impl Terminal {
    /// Returns `true` if this call delivered the result.
    pub fn fire(&self, result: IngestResult<()>) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(sender) => {
                if let Err(e) = &result {
                    log::debug!("Producer terminated with error: {e}");
                }
                // the session may already be gone
                _ = sender.send(result);
                true
            }
            None => false,
        }
    }
}

impl TerminalSignal {
    pub async fn wait(&mut self) -> IngestResult<()> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Stream(
                "producer exited without reporting a result".into(),
            )),
        }
    }
}

/// Everything the session consumes from a codec-ready client.
pub struct ProducerOutput {
    pub packets: PacketReceiver,
    pub terminal: TerminalSignal,
}

/// Producer-side halves, moved into the spawned production task.
#[derive(Clone)]
pub struct ProducerInput {
    pub packets: PacketSender,
    pub terminal: Terminal,
}

pub fn producer_channel(capacity: usize) -> (ProducerInput, ProducerOutput) {
    let (packet_tx, packet_rx) = packet_queue(capacity);
    let (terminal_tx, terminal_rx) = terminal();
    (
        ProducerInput {
            packets: packet_tx,
            terminal: terminal_tx,
        },
        ProducerOutput {
            packets: packet_rx,
            terminal: terminal_rx,
        },
    )
}
