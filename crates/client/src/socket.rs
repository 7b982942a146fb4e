//! Client-side connection engine.
//!
//! Mirrors the server socket: one read loop, one write loop, a bounded
//! outbound queue and an ack table. The client side carries its namespace
//! as a plain path string and has no server-assigned id.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use veles_protocol::{
    codec, event_data, AckCallback, AckSender, AckTable, Callback, EventEmitter, Packet,
    PacketType, ACK_TIMEOUT,
};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const OUTBOUND_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

/// A client-side connection to a server namespace.
pub struct Socket {
    namespace: String,
    emitter: EventEmitter,
    acks: AckTable,
    out_tx: mpsc::Sender<Packet>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    state: AtomicU8,
}

impl Socket {
    pub(crate) fn new(
        namespace: &str,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>, oneshot::Receiver<()>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let socket = Arc::new(Self {
            namespace: namespace.to_owned(),
            emitter: EventEmitter::new(),
            acks: AckTable::new(),
            out_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            state: AtomicU8::new(State::Open as u8),
        });
        (socket, out_rx, shutdown_rx)
    }

    pub(crate) fn spawn_loops(
        self: &Arc<Self>,
        stream: WsStream,
        out_rx: mpsc::Receiver<Packet>,
        shutdown_rx: oneshot::Receiver<()>,
    ) {
        let (sink, source) = stream.split();
        tokio::spawn(read_loop(self.clone(), source));
        tokio::spawn(write_loop(self.clone(), sink, out_rx, shutdown_rx));
    }

    /// The namespace path this socket dialed.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Registers a persistent listener for `event`.
    pub fn on(&self, event: &str, callback: Callback) {
        self.emitter.on(event, callback);
    }

    /// Registers a one-shot listener for `event`.
    pub fn once(&self, event: &str, callback: Callback) {
        self.emitter.once(event, callback);
    }

    /// Removes a previously registered listener.
    pub fn off(&self, event: &str, callback: &Callback) {
        self.emitter.off(event, callback);
    }

    /// Emits `event` to the server.
    pub fn emit(&self, event: &str, args: &[Value]) {
        self.send_event(event, args, None);
    }

    /// Emits `event` and registers `callback` for the acknowledgment. The
    /// continuation is dropped silently if no Ack arrives within
    /// [`ACK_TIMEOUT`].
    pub fn emit_with_ack(
        &self,
        event: &str,
        args: &[Value],
        callback: impl Fn(Vec<Value>) + Send + Sync + 'static,
    ) {
        self.send_event(event, args, Some(Arc::new(callback)));
    }

    /// Asks the server to add this socket to `room`.
    pub fn join(&self, room: &str) {
        self.emit("join", &[json!(room)]);
    }

    /// Asks the server to remove this socket from `room`.
    pub fn leave(&self, room: &str) {
        self.emit("leave", &[json!(room)]);
    }

    /// Closes the socket. Idempotent.
    pub fn close(&self) {
        self.close_with_reason("forced close");
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == State::Closed as u8
    }

    pub(crate) fn emit_connect(&self) {
        self.emitter.emit("connect", &[], None);
    }

    fn send_event(&self, event: &str, args: &[Value], ack: Option<AckCallback>) {
        if self.state.load(Ordering::Acquire) != State::Open as u8 {
            return;
        }
        let id = ack.map(|callback| {
            let id = self.acks.register(callback);
            let acks = self.acks.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ACK_TIMEOUT).await;
                acks.expire(id);
            });
            id
        });
        let packet = Packet::event(self.namespace.clone(), event_data(event, args), id);
        self.enqueue_or_close(packet);
    }

    fn enqueue_or_close(&self, packet: Packet) {
        match self.out_tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("outbound queue full, closing socket");
                self.close_with_reason("write buffer full");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn close_with_reason(&self, reason: &str) {
        if self
            .state
            .compare_exchange(
                State::Open as u8,
                State::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        tracing::info!(namespace = %self.namespace, reason, "socket closing");
        self.emitter
            .emit("disconnect", &[Value::String(reason.to_owned())], None);
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.emitter.clear();
        self.acks.clear();
        self.state.store(State::Closed as u8, Ordering::Release);
    }

    fn dispatch_event(self: &Arc<Self>, packet: &Packet) {
        let Some(name) = packet.event_name() else {
            return;
        };
        let Some(args) = packet.event_args() else {
            return;
        };
        let ack = packet.id.map(|id| self.ack_sender(packet.namespace.clone(), id));
        self.emitter.emit(&name, &args, ack.as_ref());
    }

    fn ack_sender(self: &Arc<Self>, namespace: String, id: u64) -> AckSender {
        let weak = Arc::downgrade(self);
        AckSender::new(move |args| {
            let Some(socket) = weak.upgrade() else {
                return;
            };
            let data = match serde_json::to_string(&args) {
                Ok(data) => data,
                Err(_) => String::from("[]"),
            };
            socket.enqueue_or_close(Packet::ack(namespace.clone(), id, data));
        })
    }

    fn dispatch_ack(&self, packet: &Packet) {
        let Some(id) = packet.id else {
            return;
        };
        let Some(callback) = self.acks.take(id) else {
            return;
        };
        let args: Vec<Value> = serde_json::from_str(&packet.data).unwrap_or_default();
        if catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
            tracing::warn!(id, "ack continuation panicked");
        }
    }
}

async fn read_loop(socket: Arc<Socket>, mut source: WsSource) {
    let reason = loop {
        let frame = match source.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                tracing::error!(error = %err, "transport read failed");
                break "transport error";
            }
            None => break "transport close",
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break "transport close",
            _ => continue,
        };
        let packet = match codec::decode(&text) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable frame");
                continue;
            }
        };
        tracing::debug!(kind = ?packet.kind, "packet received");
        match packet.kind {
            PacketType::Event | PacketType::BinaryEvent => socket.dispatch_event(&packet),
            PacketType::Ack => socket.dispatch_ack(&packet),
            PacketType::Disconnect => break "server request",
            _ => {}
        }
    };
    socket.close_with_reason(reason);
}

async fn write_loop(
    socket: Arc<Socket>,
    mut sink: WsSink,
    mut out_rx: mpsc::Receiver<Packet>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = sink.close().await;
                break "forced close";
            }
            maybe = out_rx.recv() => match maybe {
                Some(packet) => {
                    let frame = codec::encode(&packet);
                    if let Err(err) = sink.send(Message::Text(frame)).await {
                        tracing::error!(error = %err, "transport write failed");
                        break "transport error";
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break "forced close";
                }
            }
        }
    };
    socket.close_with_reason(reason);
}
