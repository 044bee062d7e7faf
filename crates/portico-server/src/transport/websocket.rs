//! [`Transport`] over a `tokio-tungstenite` stream.
//!
//! The stream is split. Outbound frames go through a bounded queue to a
//! single writer task, which keeps per-session order for both awaited and
//! fire-and-forget sends. A full queue drops the frame and counts it. The read half stays with the session task as a
//! [`WsReceiver`], which records pongs and the peer's close frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use portico_core::{CloseCode, CloseFrame, ConnectionState, Opcode};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WireCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WireCloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use super::{BoxedIo, Delivery, FrameCache, IncomingMessage, Transport};
use crate::errors::TransportError;
use crate::metrics::WS_MESSAGES_DROPPED_TOTAL;

/// Frames a session may have queued for its writer.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// An upgraded connection over plain TCP or TLS.
pub type WsStream = WebSocketStream<BoxedIo>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

struct Outbound {
    message: Message,
    ack: Option<oneshot::Sender<Result<(), TransportError>>>,
}

/// Write side of an upgraded connection.
pub struct WsTransport {
    outbound: mpsc::Sender<Outbound>,
    dropped: AtomicU64,
    state: Arc<AtomicU8>,
    pongs: watch::Receiver<u64>,
    teardown: CancellationToken,
    closed: CancellationToken,
}

/// Something the read half surfaced.
#[derive(Debug)]
pub enum WsEvent {
    /// A text or binary message.
    Message(IncomingMessage),
    /// Read failure; the connection is finished afterwards.
    Error(TransportError),
}

/// Read side of an upgraded connection.
pub struct WsReceiver {
    source: WsSource,
    state: Arc<AtomicU8>,
    pongs: watch::Sender<u64>,
    teardown: CancellationToken,
    closed: CancellationToken,
    peer_close: Option<CloseFrame>,
    done: bool,
    _closed_on_drop: DropGuard,
}

impl WsTransport {
    /// Split an upgraded stream and spawn its writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(stream: WsStream) -> (Arc<Self>, WsReceiver) {
        Self::with_capacity(stream, OUTBOUND_QUEUE_CAPACITY)
    }

    /// Same as [`Self::new`] with an explicit outbound queue size.
    pub fn with_capacity(stream: WsStream, capacity: usize) -> (Arc<Self>, WsReceiver) {
        let (sink, source) = stream.split();
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let (pong_tx, pong_rx) = watch::channel(0_u64);
        let state = Arc::new(AtomicU8::new(ConnectionState::Open.as_u8()));
        let teardown = CancellationToken::new();
        let closed = CancellationToken::new();

        drop(tokio::spawn(write_loop(
            sink,
            queue,
            Arc::clone(&state),
            teardown.clone(),
        )));

        let transport = Arc::new(Self {
            outbound,
            dropped: AtomicU64::new(0),
            state: Arc::clone(&state),
            pongs: pong_rx,
            teardown: teardown.clone(),
            closed: closed.clone(),
        });
        let receiver = WsReceiver {
            source,
            state,
            pongs: pong_tx,
            teardown,
            _closed_on_drop: closed.clone().drop_guard(),
            closed,
            peer_close: None,
            done: false,
        };
        (transport, receiver)
    }

    /// Frames refused because the outbound queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, message: Message) -> Delivery {
        let (ack, done) = oneshot::channel();
        let queued = self.outbound.try_send(Outbound {
            message,
            ack: Some(ack),
        });
        match queued {
            Ok(()) => {
                Box::pin(async move { done.await.unwrap_or(Err(TransportError::Closed)) })
            }
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(WS_MESSAGES_DROPPED_TOTAL).increment(1);
                trace!("outbound queue full, dropping frame");
                Box::pin(async { Err(TransportError::QueueFull) })
            }
            Err(TrySendError::Closed(_)) => Box::pin(async { Err(TransportError::Closed) }),
        }
    }

    fn encode(&self, opcode: Opcode, frame: &FrameCache) -> Result<Message, TransportError> {
        if self.state() != ConnectionState::Open {
            return Err(TransportError::NotOpen);
        }
        let payload = frame.for_method(self.compression())?;
        match opcode {
            Opcode::Text => Utf8Bytes::try_from(payload)
                .map(Message::Text)
                .map_err(|_| TransportError::Protocol("text payload is not valid UTF-8".into())),
            Opcode::Binary => Ok(Message::Binary(payload)),
            other => Err(TransportError::Protocol(format!(
                "{other} is not a data opcode"
            ))),
        }
    }

    fn tear_down(&self) {
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
        self.teardown.cancel();
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn send(&self, opcode: Opcode, frame: &FrameCache) -> Delivery {
        match self.encode(opcode, frame) {
            Ok(message) => self.enqueue(message),
            Err(err) => Box::pin(async move { Err(err) }),
        }
    }

    async fn ping(&self, payload: Bytes, timeout: Duration) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        let mut pongs = self.pongs.clone();
        let seen = *pongs.borrow_and_update();
        let queued = self.outbound.try_send(Outbound {
            message: Message::Ping(payload),
            ack: None,
        });
        if queued.is_err() {
            return false;
        }
        tokio::time::timeout(timeout, pongs.wait_for(|count| *count > seen))
            .await
            .is_ok_and(|answered| answered.is_ok())
    }

    async fn close(&self, frame: &CloseFrame, wait: Duration) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if !frame.is_sendable() {
            debug!(code = %frame.code(), "tearing down without close frame");
            self.tear_down();
            return;
        }

        let deadline = tokio::time::Instant::now() + wait;
        let opened = self.state.compare_exchange(
            ConnectionState::Open.as_u8(),
            ConnectionState::Closing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if opened.is_ok() {
            let delivery = self.enqueue(Message::Close(to_wire(frame)));
            let written = tokio::time::timeout_at(deadline, delivery).await;
            if !matches!(written, Ok(Ok(()))) {
                self.tear_down();
                return;
            }
        }

        if tokio::time::timeout_at(deadline, self.closed.cancelled())
            .await
            .is_err()
        {
            debug!(wait_ms = wait.as_millis() as u64, "close handshake timed out");
            self.tear_down();
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl WsReceiver {
    /// Next data message, or `None` once the connection is finished.
    pub async fn next(&mut self) -> Option<WsEvent> {
        if self.done {
            return None;
        }
        loop {
            let item = tokio::select! {
                () = self.teardown.cancelled() => None,
                item = self.source.next() => item,
            };
            match item {
                None => {
                    self.finish();
                    return None;
                }
                Some(Ok(message)) => match message {
                    Message::Text(text) => {
                        return Some(WsEvent::Message(IncomingMessage::Text(text.to_string())));
                    }
                    Message::Binary(bytes) => {
                        return Some(WsEvent::Message(IncomingMessage::Binary(bytes)));
                    }
                    Message::Pong(_) => {
                        self.pongs.send_modify(|count| *count += 1);
                    }
                    Message::Close(frame) => {
                        trace!(?frame, "peer sent close");
                        self.peer_close = Some(from_wire(frame));
                        let _ = self.state.compare_exchange(
                            ConnectionState::Open.as_u8(),
                            ConnectionState::Closing.as_u8(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                    // Pings are answered by tungstenite itself.
                    Message::Ping(_) | Message::Frame(_) => {}
                },
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    self.finish();
                    return None;
                }
                Some(Err(err)) => {
                    self.finish();
                    return Some(WsEvent::Error(TransportError::Protocol(err.to_string())));
                }
            }
        }
    }

    /// Close frame the peer sent, if any.
    pub fn peer_close(&self) -> Option<&CloseFrame> {
        self.peer_close.as_ref()
    }

    /// Frame describing how the connection ended: the peer's close, or 1006.
    pub fn close_frame(&self) -> CloseFrame {
        self.peer_close.clone().unwrap_or_else(CloseFrame::abnormal)
    }

    fn finish(&mut self) {
        self.done = true;
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
        self.teardown.cancel();
        self.closed.cancel();
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut queue: mpsc::Receiver<Outbound>,
    state: Arc<AtomicU8>,
    teardown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = teardown.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some(Outbound { message, ack }) = next else {
            break;
        };
        let result = sink
            .send(message)
            .await
            .map_err(|err| TransportError::Protocol(err.to_string()));
        let failed = result.is_err();
        if let Err(err) = &result {
            debug!(error = %err, "websocket write failed");
        }
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if failed {
            state.store(ConnectionState::Closed.as_u8(), Ordering::Release);
            teardown.cancel();
            break;
        }
    }
}

fn to_wire(frame: &CloseFrame) -> Option<WireCloseFrame> {
    if frame.code() == CloseCode::NO_STATUS {
        return None;
    }
    // The reason follows the two status bytes; slicing keeps the encoded
    // frame shared across every session it is sent to.
    let reason = Utf8Bytes::try_from(frame.payload().slice(2..))
        .unwrap_or_else(|_| Utf8Bytes::from_static(""));
    Some(WireCloseFrame {
        code: WireCloseCode::from(frame.code().as_u16()),
        reason,
    })
}

fn from_wire(frame: Option<WireCloseFrame>) -> CloseFrame {
    match frame {
        Some(frame) => CloseFrame::received(u16::from(frame.code), frame.reason.as_str()),
        None => CloseFrame::no_status(),
    }
}
