//! Server-side connection engine.
//!
//! Each accepted connection is owned by one [`Socket`] and exactly two
//! tasks: a read loop that decodes inbound frames and dispatches them, and
//! a write loop that drains the bounded outbound queue into the transport.
//! The loops share nothing but the transport halves, the queue, and the
//! socket's thread-safe state (emitter, ack table, lifecycle flag).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use veles_protocol::{
    codec, event_data, AckCallback, AckSender, AckTable, Callback, EventEmitter, Packet,
    PacketType, ACK_TIMEOUT,
};

use crate::broadcast::BroadcastOperator;
use crate::namespace::Namespace;

pub(crate) type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Outbound queue capacity per socket. A full queue is fatal for the
/// socket's own emits and a silent skip for broadcast fan-out.
pub(crate) const OUTBOUND_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

/// A server-side connection to one client.
///
/// Obtained through the namespace's `connection` callback. Exposes event
/// registration, emits with optional acknowledgment, room membership and
/// broadcast. All methods are safe to call from any task; after the socket
/// closes, emits silently drop.
pub struct Socket {
    id: Uuid,
    namespace: Weak<Namespace>,
    namespace_name: String,
    emitter: EventEmitter,
    acks: AckTable,
    out_tx: mpsc::Sender<Packet>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    state: AtomicU8,
}

impl Socket {
    pub(crate) fn new(
        id: Uuid,
        namespace: &Arc<Namespace>,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>, oneshot::Receiver<()>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let socket = Arc::new(Self {
            id,
            namespace: Arc::downgrade(namespace),
            namespace_name: namespace.name().to_owned(),
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

    /// The server-assigned id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The namespace path this socket belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace_name
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

    /// Emits `event` to the peer.
    pub fn emit(&self, event: &str, args: &[Value]) {
        self.send_event(event, args, None);
    }

    /// Emits `event` to the peer and registers `callback` for the
    /// acknowledgment. The continuation is dropped silently if no Ack
    /// arrives within [`ACK_TIMEOUT`].
    pub fn emit_with_ack(
        &self,
        event: &str,
        args: &[Value],
        callback: impl Fn(Vec<Value>) + Send + Sync + 'static,
    ) {
        self.send_event(event, args, Some(Arc::new(callback)));
    }

    /// Adds this socket to `room`, creating the room on first join.
    /// Idempotent.
    pub fn join(&self, room: &str) {
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.join_room(room, self.id);
        }
    }

    /// Removes this socket from `room`. Idempotent.
    pub fn leave(&self, room: &str) {
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.leave_room(room, self.id);
        }
    }

    /// A broadcast over every socket in the namespace except this one.
    pub fn broadcast(&self) -> BroadcastOperator {
        match self.namespace.upgrade() {
            Some(namespace) => {
                let targets = namespace
                    .socket_ids()
                    .into_iter()
                    .filter(|id| *id != self.id)
                    .collect();
                BroadcastOperator::new(Arc::downgrade(&namespace), targets)
            }
            None => BroadcastOperator::new(self.namespace.clone(), Vec::new()),
        }
    }

    /// Closes the socket. Idempotent; the first close wins and later calls
    /// are no-ops.
    pub fn close(&self) {
        self.close_with_reason("forced close");
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == State::Closed as u8
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
        let packet = Packet::event(self.namespace_name.clone(), event_data(event, args), id);
        self.enqueue_or_close(packet);
    }

    /// Best-effort enqueue used by broadcast fan-out: a full or closed
    /// queue skips this recipient.
    pub(crate) fn try_enqueue(&self, packet: Packet) {
        if self.out_tx.try_send(packet).is_err() {
            tracing::debug!(id = %self.id, "recipient queue unavailable, skipping");
        }
    }

    fn enqueue_or_close(&self, packet: Packet) {
        match self.out_tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(id = %self.id, "outbound queue full, closing socket");
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
        tracing::info!(id = %self.id, reason, "socket closing");
        self.emitter
            .emit("disconnect", &[Value::String(reason.to_owned())], None);
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.remove_socket(self.id);
        }
        // Listeners and pending acks may hold Arcs back to this socket;
        // dropping them here breaks the cycle.
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
        // Synthesize the ack continuation only when a listener is
        // registered to receive it.
        let ack = match (packet.id, self.emitter.signature(&name)) {
            (Some(id), Some(_)) => Some(self.ack_sender(packet.namespace.clone(), id)),
            _ => None,
        };
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

pub(crate) async fn read_loop(socket: Arc<Socket>, mut source: WsSource) {
    let reason = loop {
        let frame = match source.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                tracing::error!(id = %socket.id, error = %err, "transport read failed");
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
                tracing::warn!(id = %socket.id, error = %err, "dropping undecodable frame");
                continue;
            }
        };
        tracing::debug!(id = %socket.id, kind = ?packet.kind, "packet received");
        match packet.kind {
            PacketType::Connect => {
                socket.emitter.emit("connect", &[], None);
                socket.enqueue_or_close(Packet::connect(packet.namespace.clone()));
            }
            PacketType::Event | PacketType::BinaryEvent => socket.dispatch_event(&packet),
            PacketType::Ack => socket.dispatch_ack(&packet),
            PacketType::Disconnect => break "client request",
            PacketType::Error | PacketType::BinaryAck => {}
        }
    };
    socket.close_with_reason(reason);
}

pub(crate) async fn write_loop(
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
                        tracing::error!(id = %socket.id, error = %err, "transport write failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn test_socket() -> (Arc<Socket>, mpsc::Receiver<Packet>, oneshot::Receiver<()>) {
        let namespace = Namespace::new("/");
        Socket::new(Uuid::new_v4(), &namespace)
    }

    #[test]
    fn emit_enqueues_an_event_packet() {
        let (socket, mut out_rx, _shutdown) = test_socket();
        socket.emit("chat message", &[json!("hi")]);
        let packet = out_rx.try_recv().unwrap();
        assert_eq!(packet.kind, PacketType::Event);
        assert_eq!(packet.namespace, "/");
        assert_eq!(packet.id, None);
        assert_eq!(packet.data, r#"["chat message","hi"]"#);
    }

    #[test]
    fn backpressure_closes_the_socket() {
        let (socket, _out_rx, _shutdown) = test_socket();
        let disconnected = Arc::new(AtomicBool::new(false));
        let disconnected_in = disconnected.clone();
        socket.on(
            "disconnect",
            Callback::new(move |args, _| {
                assert_eq!(args, &[json!("write buffer full")][..]);
                disconnected_in.store(true, Ordering::SeqCst);
            }),
        );

        // The queue holds 10 packets; nothing is draining it.
        for _ in 0..OUTBOUND_CAPACITY {
            socket.emit("flood", &[]);
        }
        assert!(!socket.is_closed());

        socket.emit("flood", &[]);
        assert!(socket.is_closed());
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[test]
    fn emits_after_close_are_dropped() {
        let (socket, mut out_rx, _shutdown) = test_socket();
        socket.close();
        assert!(socket.is_closed());
        socket.emit("late", &[]);
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let (socket, _out_rx, mut shutdown_rx) = test_socket();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_in = count.clone();
        socket.on(
            "disconnect",
            Callback::new(move |_, _| {
                count_in.fetch_add(1, Ordering::SeqCst);
            }),
        );
        socket.close();
        socket.close();
        assert!(socket.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(shutdown_rx.try_recv().is_ok());
    }

    #[test]
    fn close_deregisters_from_the_namespace() {
        let namespace = Namespace::new("/");
        let (socket, _out_rx, _shutdown) = Socket::new(Uuid::new_v4(), &namespace);
        namespace.insert_socket(socket.clone());
        socket.join("room1");
        assert_eq!(namespace.socket_ids(), vec![socket.id()]);

        socket.close();
        assert!(namespace.socket_ids().is_empty());
        assert!(namespace.room_members("room1").is_empty());
    }

    #[test]
    fn inbound_event_dispatches_with_ack_sender() {
        let (socket, mut out_rx, _shutdown) = test_socket();
        socket.on(
            "get_data",
            Callback::new(|args, ack| {
                let input = args[0].as_str().unwrap_or_default();
                if let Some(ack) = ack {
                    ack.send(vec![json!(format!("echo:{input}"))]);
                }
            }),
        );

        let packet = Packet::event("/", r#"["get_data","foo"]"#, Some(5));
        socket.dispatch_event(&packet);

        let reply = out_rx.try_recv().unwrap();
        assert_eq!(reply.kind, PacketType::Ack);
        assert_eq!(reply.id, Some(5));
        assert_eq!(reply.data, r#"["echo:foo"]"#);
    }

    #[test]
    fn inbound_event_without_id_gets_no_ack_sender() {
        let (socket, _out_rx, _shutdown) = test_socket();
        let saw_ack = Arc::new(AtomicBool::new(false));
        let saw_ack_in = saw_ack.clone();
        socket.on(
            "ping",
            Callback::new(move |_, ack| {
                saw_ack_in.store(ack.is_some(), Ordering::SeqCst);
            }),
        );
        socket.dispatch_event(&Packet::event("/", r#"["ping"]"#, None));
        assert!(!saw_ack.load(Ordering::SeqCst));
    }

    #[test]
    fn inbound_ack_fires_the_pending_continuation_once() {
        let (socket, _out_rx, _shutdown) = test_socket();
        let responses = Arc::new(Mutex::new(Vec::new()));
        let responses_in = responses.clone();
        // Register the continuation directly; the wire id is whatever the
        // table allocated.
        let id = socket.acks.register(Arc::new(move |args| {
            responses_in.lock().unwrap().push(args);
        }));

        socket.dispatch_ack(&Packet::ack("/", id, r#"["echo:foo"]"#));
        socket.dispatch_ack(&Packet::ack("/", id, r#"["echo:foo"]"#));

        let responses = responses.lock().unwrap();
        assert_eq!(*responses, vec![vec![json!("echo:foo")]]);
    }
}
