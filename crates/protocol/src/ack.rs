//! Acknowledgment plumbing shared by both socket sides.
//!
//! Outbound: an emit that requests an acknowledgment registers a
//! continuation in the socket's [`AckTable`] under a fresh id; the matching
//! Ack packet fires it, and a timeout drops it silently.
//!
//! Inbound: an event carrying an id gets an [`AckSender`] injected into
//! listener dispatch; invoking it encodes the reply as an Ack packet and
//! enqueues it on the socket's outbound queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

/// How long an outstanding acknowledgment waits before its continuation is
/// dropped.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// A pending acknowledgment continuation.
pub type AckCallback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Pending acknowledgments for one socket: a monotonic id allocator plus the
/// id → continuation map. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct AckTable {
    inner: Arc<AckTableInner>,
}

#[derive(Default)]
struct AckTableInner {
    counter: AtomicU64,
    pending: Mutex<HashMap<u64, AckCallback>>,
}

impl AckTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id and stores the continuation under it.
    pub fn register(&self, callback: AckCallback) -> u64 {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(id, callback);
        id
    }

    /// Atomically removes and returns the continuation for `id`, if still
    /// pending.
    pub fn take(&self, id: u64) -> Option<AckCallback> {
        self.inner
            .pending
            .lock()
            .unwrap()
            .remove(&id)
    }

    /// Drops the continuation for `id` without firing it.
    pub fn expire(&self, id: u64) {
        if self.take(id).is_some() {
            tracing::debug!(id, "ack timed out");
        }
    }

    /// Drops every pending continuation. Called on socket teardown.
    pub fn clear(&self) {
        self.inner.pending.lock().unwrap().clear();
    }

    /// Whether `id` still has a pending continuation.
    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap()
            .contains_key(&id)
    }
}

impl fmt::Debug for AckTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.pending.lock().unwrap();
        f.debug_struct("AckTable")
            .field("pending", &pending.len())
            .finish()
    }
}

/// Handle for answering an inbound event that requested an acknowledgment.
///
/// Injected into listener dispatch when the event carried an id; sending
/// encodes the arguments as the data of an Ack packet with that id and
/// enqueues it.
#[derive(Clone)]
pub struct AckSender {
    send: Arc<dyn Fn(Vec<Value>) + Send + Sync>,
}

impl AckSender {
    pub fn new(send: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self {
            send: Arc::new(send),
        }
    }

    /// Sends the acknowledgment with the given arguments.
    pub fn send(&self, args: Vec<Value>) {
        (self.send)(args);
    }
}

impl fmt::Debug for AckSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckSender").finish_non_exhaustive()
    }
}
