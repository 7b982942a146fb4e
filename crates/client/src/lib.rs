//! # Veles Client
//!
//! Dials a veles server and returns a connected [`Socket`].
//!
//! ## Example
//!
//! ```no_run
//! use veles_client::{connect, Callback};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let socket = connect("ws://localhost:8080", "/", |socket| {
//!         socket.on("pong", Callback::new(|_, _| println!("pong")));
//!     })
//!     .await
//!     .unwrap();
//!
//!     socket.emit("ping", &[]);
//!     socket.emit_with_ack("get_data", &[json!("foo")], |response| {
//!         println!("ack: {response:?}");
//!     });
//!     std::future::pending::<()>().await;
//! }
//! ```

pub mod socket;

pub use socket::Socket;
pub use veles_protocol::{arg, AckSender, Callback};

use std::sync::Arc;

use tokio_tungstenite::connect_async;
use url::Url;

/// Dials `server_url`, rewriting its path to `namespace`, and returns the
/// connected socket.
///
/// `on_connect` runs before the local `connect` event fires, so listeners
/// registered inside it observe that event. An empty namespace means `"/"`.
pub async fn connect<F>(
    server_url: &str,
    namespace: &str,
    on_connect: F,
) -> Result<Arc<Socket>, ConnectError>
where
    F: FnOnce(&Arc<Socket>),
{
    let namespace = if namespace.is_empty() { "/" } else { namespace };
    let mut url = Url::parse(server_url)?;
    url.set_path(namespace);

    tracing::info!(url = %url, "dialing");
    let (stream, _) = connect_async(url.as_str()).await?;
    tracing::info!(url = %url, "connection established");

    // Let the caller register listeners before the read loop starts, so
    // nothing the server sends right away can slip past them.
    let (socket, out_rx, shutdown_rx) = Socket::new(namespace);
    on_connect(&socket);
    socket.emit_connect();
    socket.spawn_loops(stream, out_rx, shutdown_rx);
    Ok(socket)
}

/// Dial failures, surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to dial server: {0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let result = connect("not a url", "/", |_| {}).await;
        assert!(matches!(result, Err(ConnectError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn dial_failure_is_surfaced() {
        // Bind then drop to find a port nothing is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&format!("ws://{addr}"), "/", |_| {}).await;
        assert!(matches!(result, Err(ConnectError::Dial(_))));
    }
}
