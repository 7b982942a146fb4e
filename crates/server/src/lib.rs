//! # Veles Server
//!
//! Accepts WebSocket upgrades, assigns socket ids, and routes each
//! connection into the namespace named by the request path. Namespaces
//! raise `connection` with the new socket; sockets expose events, rooms
//! and broadcast.
//!
//! ## Example
//!
//! ```no_run
//! use veles_server::{Callback, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new();
//!     server.of("/").on_connection(|socket| {
//!         let peer = socket.clone();
//!         socket.on("ping", Callback::new(move |_, _| peer.emit("pong", &[])));
//!     });
//!     let addr = server.listen("127.0.0.1:8080").await.unwrap();
//!     println!("listening on {addr}");
//!     std::future::pending::<()>().await;
//! }
//! ```

pub mod broadcast;
pub mod namespace;
pub mod socket;

pub use broadcast::BroadcastOperator;
pub use namespace::Namespace;
pub use socket::Socket;
pub use veles_protocol::{arg, AckSender, Callback};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// Upper bound on the upgrade request head, terminator included.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Sent verbatim to any connection whose request is not a websocket
/// upgrade.
const UPGRADE_FAILED_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 14\r\n\
    Connection: close\r\n\
    \r\n\
    upgrade failed";

/// The listening endpoint: a permissive upgrader plus the namespace index.
pub struct Server {
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            namespaces: RwLock::new(HashMap::new()),
        })
    }

    /// The namespace for `path`, created lazily on first use. Concurrent
    /// callers observe the same instance. An empty path means `"/"`.
    pub fn of(&self, path: &str) -> Arc<Namespace> {
        let path = if path.is_empty() { "/" } else { path };
        if let Some(namespace) = self.namespaces.read().unwrap().get(path) {
            return namespace.clone();
        }
        let mut namespaces = self.namespaces.write().unwrap();
        namespaces
            .entry(path.to_owned())
            .or_insert_with(|| Namespace::new(path))
            .clone()
    }

    /// Binds `addr` and accepts connections until the process exits.
    /// Returns the bound address, which carries the actual port when
    /// `addr` asked for port 0.
    pub async fn listen(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "listening");

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "inbound connection");
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.serve_stream(stream).await;
                        });
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept failed");
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Upgrades one accepted connection and binds the resulting socket to
    /// the namespace named by the request path. Public so hosts that do
    /// their own listening can hand accepted streams to the server.
    ///
    /// Non-upgradable requests are answered with HTTP 400 `upgrade failed`.
    pub async fn serve_stream(self: &Arc<Self>, mut stream: TcpStream) {
        let request = match read_request_head(&mut stream).await {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "upgrade failed");
                let _ = stream.write_all(UPGRADE_FAILED_RESPONSE).await;
                return;
            }
        };
        let Some(key) = request.websocket_key() else {
            tracing::warn!(path = %request.path, "upgrade failed");
            let _ = stream.write_all(UPGRADE_FAILED_RESPONSE).await;
            return;
        };

        let accept = derive_accept_key(key.as_bytes());
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             \r\n"
        );
        if let Err(err) = stream.write_all(response.as_bytes()).await {
            tracing::warn!(error = %err, "upgrade response write failed");
            return;
        }
        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;

        let namespace = self.of(&request.path);
        let id = Uuid::new_v4();
        let (socket, out_rx, shutdown_rx) = Socket::new(id, &namespace);
        namespace.insert_socket(socket.clone());

        // Reserved events: clients join and leave rooms by emitting them.
        let weak = Arc::downgrade(&socket);
        socket.on(
            "join",
            Callback::with_arity(1, move |args, _| {
                if let (Some(socket), Some(room)) = (weak.upgrade(), arg::<String>(args, 0)) {
                    socket.join(&room);
                }
            }),
        );
        let weak = Arc::downgrade(&socket);
        socket.on(
            "leave",
            Callback::with_arity(1, move |args, _| {
                if let (Some(socket), Some(room)) = (weak.upgrade(), arg::<String>(args, 0)) {
                    socket.leave(&room);
                }
            }),
        );

        // Run the connection listeners before the read loop starts so a
        // frame arriving right after the handshake finds its handlers
        // registered. Anything they emit waits in the outbound queue.
        tracing::info!(id = %id, namespace = %namespace.name(), "socket connected");
        namespace.emit_connection(socket.clone());
        socket.spawn_loops(ws, out_rx, shutdown_rx);
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

struct UpgradeRequest {
    path: String,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The client's `Sec-WebSocket-Key`, present only when the request is a
    /// well-formed websocket upgrade.
    fn websocket_key(&self) -> Option<&str> {
        let connection_ok = self
            .header("connection")
            .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
        let upgrade_ok = self
            .header("upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
        let version_ok = self.header("sec-websocket-version") == Some("13");
        if connection_ok && upgrade_ok && version_ok {
            self.header("sec-websocket-key").filter(|key| !key.is_empty())
        } else {
            None
        }
    }
}

/// Reads one HTTP request head (through the blank line) and parses the
/// GET target and headers. Header names are lowercased; the target's query
/// string is dropped.
async fn read_request_head(
    stream: &mut (impl AsyncRead + Unpin),
) -> std::io::Result<UpgradeRequest> {
    use std::io::{Error, ErrorKind};

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_len = loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(Error::new(ErrorKind::InvalidData, "request head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| Error::new(ErrorKind::InvalidData, "request head is not utf-8"))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    if method != "GET" || !target.starts_with('/') {
        return Err(Error::new(ErrorKind::InvalidData, "malformed request line"));
    }
    let path = match target.split_once('?') {
        Some((path, _)) => path,
        None => target,
    };

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
        .collect();

    Ok(UpgradeRequest {
        path: path.to_owned(),
        headers,
    })
}
