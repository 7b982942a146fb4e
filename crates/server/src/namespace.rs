//! Namespaces: logical sub-channels isolating sockets and rooms.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use crate::broadcast::BroadcastOperator;
use crate::socket::Socket;

type ConnectionListener = Arc<dyn Fn(Arc<Socket>) + Send + Sync>;

/// A logical sub-channel identified by a path.
///
/// Owns the sockets accepted into it (indexed by id) and the room index
/// (room name → member ids). Created lazily by [`Server::of`] and never
/// destroyed during the process lifetime.
///
/// [`Server::of`]: crate::Server::of
pub struct Namespace {
    name: String,
    sockets: RwLock<HashMap<Uuid, Arc<Socket>>>,
    rooms: RwLock<HashMap<String, HashSet<Uuid>>>,
    connection_listeners: Mutex<Vec<ConnectionListener>>,
}

impl Namespace {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            sockets: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            connection_listeners: Mutex::new(Vec::new()),
        })
    }

    /// The namespace path, e.g. `"/"` or `"/admin"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a listener fired with each socket accepted into this
    /// namespace.
    pub fn on_connection(&self, listener: impl Fn(Arc<Socket>) + Send + Sync + 'static) {
        self.connection_listeners
            .lock()
            .unwrap()
            .push(Arc::new(listener));
    }

    /// A broadcast over the current members of `room`.
    pub fn to(self: &Arc<Self>, room: &str) -> BroadcastOperator {
        BroadcastOperator::new(Arc::downgrade(self), self.room_members(room))
    }

    /// Looks up a socket by id.
    pub fn socket(&self, id: Uuid) -> Option<Arc<Socket>> {
        self.sockets.read().unwrap().get(&id).cloned()
    }

    pub(crate) fn emit_connection(&self, socket: Arc<Socket>) {
        let listeners = self.connection_listeners.lock().unwrap().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(socket.clone()))).is_err() {
                tracing::warn!(namespace = %self.name, "connection listener panicked");
            }
        }
    }

    pub(crate) fn insert_socket(&self, socket: Arc<Socket>) {
        self.sockets.write().unwrap().insert(socket.id(), socket);
    }

    pub(crate) fn remove_socket(&self, id: Uuid) {
        self.sockets.write().unwrap().remove(&id);
        let mut rooms = self.rooms.write().unwrap();
        for members in rooms.values_mut() {
            members.remove(&id);
        }
    }

    pub(crate) fn join_room(&self, room: &str, id: Uuid) {
        tracing::debug!(namespace = %self.name, room, id = %id, "join");
        self.rooms
            .write()
            .unwrap()
            .entry(room.to_owned())
            .or_default()
            .insert(id);
    }

    pub(crate) fn leave_room(&self, room: &str, id: Uuid) {
        tracing::debug!(namespace = %self.name, room, id = %id, "leave");
        if let Some(members) = self.rooms.write().unwrap().get_mut(room) {
            members.remove(&id);
        }
    }

    /// Snapshot of the member ids of `room`; empty when the room does not
    /// exist.
    pub(crate) fn room_members(&self, room: &str) -> Vec<Uuid> {
        self.rooms
            .read()
            .unwrap()
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every socket id in the namespace.
    pub(crate) fn socket_ids(&self) -> Vec<Uuid> {
        self.sockets.read().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_idempotent_and_creates_the_room() {
        let namespace = Namespace::new("/");
        let id = Uuid::new_v4();
        namespace.join_room("room1", id);
        namespace.join_room("room1", id);
        assert_eq!(namespace.room_members("room1"), vec![id]);
    }

    #[test]
    fn leave_is_idempotent_and_tolerates_unknown_rooms() {
        let namespace = Namespace::new("/");
        let id = Uuid::new_v4();
        namespace.leave_room("missing", id);
        namespace.join_room("room1", id);
        namespace.leave_room("room1", id);
        namespace.leave_room("room1", id);
        assert!(namespace.room_members("room1").is_empty());
    }

    #[test]
    fn remove_socket_clears_room_membership() {
        let namespace = Namespace::new("/");
        let (socket, _out_rx, _shutdown) = Socket::new(Uuid::new_v4(), &namespace);
        let id = socket.id();
        namespace.insert_socket(socket);
        namespace.join_room("room1", id);
        namespace.join_room("room2", id);

        namespace.remove_socket(id);
        assert!(namespace.socket(id).is_none());
        assert!(namespace.room_members("room1").is_empty());
        assert!(namespace.room_members("room2").is_empty());
    }

    #[test]
    fn connection_listener_panic_is_isolated() {
        let namespace = Namespace::new("/");
        namespace.on_connection(|_| panic!("boom"));
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_in = seen.clone();
        namespace.on_connection(move |_| {
            seen_in.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        let (socket, _out_rx, _shutdown) = Socket::new(Uuid::new_v4(), &namespace);
        namespace.emit_connection(socket);
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
    }
}
