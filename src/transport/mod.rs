//! Framed multiplexing transport — C1.
//!
//! Owns the external byte stream (stdin/stdout in production, any
//! `AsyncRead + AsyncWrite` pair in tests) and turns it into a stream of
//! [`TransportEvent`]s plus a cheap, cloneable [`TransportHandle`] that
//! channels use to send frames and observe close/pressure.
//!
//! Grounded on the teacher's `socket/server.rs` accept-loop / event-channel
//! shape (an owned I/O object driving a `tokio::select!` loop that emits
//! typed events into an `mpsc` channel for a separate dispatcher to consume)
//! and on `socket/framing.rs`'s length-prefixed codec, adapted to the
//! newline-delimited length/channel-id/payload wire format this transport
//! actually speaks.

pub mod frame;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::Problem;
use frame::{Frame, FrameDecoder};

/// Outbound queue byte count at which `pressure(true)` fires.
const PRESSURE_HIGH_WATER: usize = 1024 * 1024;
/// Outbound queue byte count below which `pressure(false)` fires. Kept below
/// the high-water mark so a queue oscillating right at 1 MiB doesn't spam
/// pressure toggles.
const PRESSURE_LOW_WATER: usize = 512 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Events the transport delivers to its driving dispatcher (the router).
#[derive(Debug)]
pub enum TransportEvent {
    /// A control-band JSON object other than `init`, which the transport
    /// handles itself.
    Control { command: String, value: serde_json::Value },
    /// A payload frame addressed to `channel`.
    Recv { channel: String, payload: Vec<u8> },
    /// The transport has closed; fires exactly once.
    Closed { problem: Option<Problem> },
    /// Outbound backpressure edge.
    Pressure(bool),
}

#[derive(Debug)]
enum OutboundMsg {
    Frame(String, Vec<u8>),
    Close(Option<Problem>),
}

/// A cheap, cloneable handle for sending frames and observing closed state.
/// This is what channels and the router actually hold — the [`Transport`]
/// itself is consumed by its own `run()` loop.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound_tx: mpsc::UnboundedSender<OutboundMsg>,
    outbound_bytes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    pressure: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Enqueue a payload frame. `channel = None` selects the control band.
    /// Returns `false` (frame dropped) if the transport is already closed.
    pub fn send(&self, channel: Option<&str>, payload: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.outbound_bytes.fetch_add(payload.len(), Ordering::AcqRel);
        let channel = channel.unwrap_or("").to_owned();
        self.outbound_tx.send(OutboundMsg::Frame(channel, payload)).is_ok()
    }

    /// Convenience over [`TransportHandle::send`] for a JSON control object.
    pub fn send_control(&self, value: &serde_json::Value) -> bool {
        let payload = serde_json::to_vec(value).expect("control objects are always valid JSON");
        self.send(None, payload)
    }

    /// Initiate a graceful close. Idempotent past the first call.
    pub fn close(&self, problem: Option<Problem>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound_tx.send(OutboundMsg::Close(problem));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn outbound_bytes(&self) -> usize {
        self.outbound_bytes.load(Ordering::Acquire)
    }

    /// The current state of the outbound backpressure edge (see
    /// [`TransportEvent::Pressure`]). Channels that relay an external input
    /// source (`stream`, `packet`) poll this directly to decide whether to
    /// keep reading from that source, rather than waiting on a dedicated
    /// inbox message — the flag is shared, so every channel observes the one
    /// transport's queue depth without the router fanning anything out.
    #[must_use]
    pub fn is_under_pressure(&self) -> bool {
        self.pressure.load(Ordering::Acquire)
    }
}

/// The transport itself. Consumed by [`Transport::run`]; everything else
/// interacts with it via [`TransportHandle`] and the [`TransportEvent`]
/// receiver returned from [`Transport::new`].
pub struct Transport<S> {
    io: S,
    decoder: FrameDecoder,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMsg>,
    outbound_bytes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    pressure: Arc<AtomicBool>,
    negotiated_version: Option<i64>,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(io: S) -> (Self, TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let outbound_bytes = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let pressure = Arc::new(AtomicBool::new(false));

        let handle = TransportHandle {
            outbound_tx,
            outbound_bytes: outbound_bytes.clone(),
            closed: closed.clone(),
            pressure: pressure.clone(),
        };
        let transport = Transport {
            io,
            decoder: FrameDecoder::new(),
            events_tx,
            outbound_rx,
            outbound_bytes,
            closed,
            pressure,
            negotiated_version: None,
        };
        (transport, handle, events_rx)
    }

    /// Drive the transport until it closes. Runs inline on the caller's
    /// task — there is no internal `tokio::spawn`, keeping the whole process
    /// one cooperative event loop.
    pub async fn run(mut self) {
        let mut read_buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                biased;
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(OutboundMsg::Frame(channel, payload)) => {
                            let encoded = Frame::encode(&channel, &payload);
                            self.outbound_bytes.fetch_sub(payload.len(), Ordering::AcqRel);
                            self.maybe_fire_pressure();
                            if let Err(err) = self.io.write_all(&encoded).await {
                                self.finish(Some(Problem::from_io_error(&err)));
                                return;
                            }
                        }
                        Some(OutboundMsg::Close(problem)) => {
                            let _ = self.io.flush().await;
                            self.finish(problem);
                            return;
                        }
                        None => {
                            // Every handle dropped; nothing left to send to.
                            self.finish(None);
                            return;
                        }
                    }
                }
                read_result = self.io.read(&mut read_buf) => {
                    match read_result {
                        Ok(0) => {
                            self.finish(Some(Problem::Disconnected));
                            return;
                        }
                        Ok(n) => {
                            if let Err(problem) = self.handle_inbound(&read_buf[..n]) {
                                self.finish(Some(problem));
                                return;
                            }
                        }
                        Err(err) => {
                            self.finish(Some(Problem::from_io_error(&err)));
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle_inbound(&mut self, data: &[u8]) -> Result<(), Problem> {
        let frames = self.decoder.feed(data)?;
        for frame in frames {
            self.dispatch_frame(frame)?;
        }
        Ok(())
    }

    fn dispatch_frame(&mut self, frame: Frame) -> Result<(), Problem> {
        if frame.is_control() {
            let value: serde_json::Value =
                serde_json::from_slice(&frame.payload).map_err(|_| Problem::ProtocolError)?;
            let command = value
                .get("command")
                .and_then(serde_json::Value::as_str)
                .ok_or(Problem::ProtocolError)?
                .to_owned();

            if command == "init" {
                let version = value.get("version").and_then(serde_json::Value::as_i64);
                self.negotiated_version = Some(version.unwrap_or(1));
                return Ok(());
            }

            let _ = self.events_tx.send(TransportEvent::Control { command, value });
        } else {
            let _ = self.events_tx.send(TransportEvent::Recv {
                channel: frame.channel,
                payload: frame.payload,
            });
        }
        Ok(())
    }

    fn maybe_fire_pressure(&mut self) {
        let bytes = self.outbound_bytes.load(Ordering::Acquire);
        let was_on = self.pressure.load(Ordering::Acquire);
        if !was_on && bytes >= PRESSURE_HIGH_WATER {
            self.pressure.store(true, Ordering::Release);
            let _ = self.events_tx.send(TransportEvent::Pressure(true));
        } else if was_on && bytes < PRESSURE_LOW_WATER {
            self.pressure.store(false, Ordering::Release);
            let _ = self.events_tx.send(TransportEvent::Pressure(false));
        }
    }

    fn finish(&mut self, problem: Option<Problem>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.events_tx.send(TransportEvent::Closed { problem });
        }
    }
}
