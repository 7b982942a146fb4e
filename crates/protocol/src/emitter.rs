//! Concurrent event emitter with order-preserving dispatch.
//!
//! Listeners are callables over a JSON argument slice plus an optional
//! [`AckSender`] for events that requested an acknowledgment. A listener may
//! declare a fixed arity; dispatch skips it when the emitted argument count
//! does not match, and a panicking listener never prevents the remaining
//! listeners from running.
//!
//! # Example
//!
//! ```
//! use veles_protocol::{Callback, EventEmitter};
//! use serde_json::json;
//!
//! let emitter = EventEmitter::new();
//! emitter.on(
//!     "greet",
//!     Callback::with_arity(1, |args, _ack| {
//!         println!("hello, {}", args[0].as_str().unwrap_or("?"));
//!     }),
//! );
//! emitter.emit("greet", &[json!("world")], None);
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::ack::AckSender;

type ListenerFn = Arc<dyn Fn(&[Value], Option<&AckSender>) + Send + Sync>;

/// A registered listener.
///
/// Cloning shares the underlying callable; [`EventEmitter::off`] removes by
/// that shared identity, so keep a clone of the callback you registered if
/// you intend to remove it later.
#[derive(Clone)]
pub struct Callback {
    arity: Option<usize>,
    f: ListenerFn,
}

impl Callback {
    /// A variadic listener: receives every emitted argument.
    pub fn new(f: impl Fn(&[Value], Option<&AckSender>) + Send + Sync + 'static) -> Self {
        Self {
            arity: None,
            f: Arc::new(f),
        }
    }

    /// A listener declaring a fixed argument count. Dispatch with a
    /// different count faults this listener and skips it.
    pub fn with_arity(
        arity: usize,
        f: impl Fn(&[Value], Option<&AckSender>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            arity: Some(arity),
            f: Arc::new(f),
        }
    }

    fn same(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

/// Declared shape of a registered listener, exposed for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Declared argument count; `None` for variadic listeners.
    pub arity: Option<usize>,
}

#[derive(Default)]
struct Lists {
    on: Vec<Callback>,
    once: Vec<Callback>,
}

/// Event name → ordered listener lists, safe for concurrent use.
#[derive(Default)]
pub struct EventEmitter {
    events: Mutex<HashMap<String, Lists>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `callback` to the event's persistent listener list.
    pub fn on(&self, event: &str, callback: Callback) {
        let mut events = self.events.lock().unwrap();
        events.entry(event.to_owned()).or_default().on.push(callback);
    }

    /// Appends `callback` to the event's one-shot list; it fires on the
    /// next emit only.
    pub fn once(&self, event: &str, callback: Callback) {
        let mut events = self.events.lock().unwrap();
        events
            .entry(event.to_owned())
            .or_default()
            .once
            .push(callback);
    }

    /// Removes every registration of `callback` from both lists for
    /// `event`. Identity is the shared callable, not structural equality.
    pub fn off(&self, event: &str, callback: &Callback) {
        let mut events = self.events.lock().unwrap();
        if let Some(lists) = events.get_mut(event) {
            lists.on.retain(|cb| !cb.same(callback));
            lists.once.retain(|cb| !cb.same(callback));
        }
    }

    /// Dispatches `event` to its listeners: the one-shot list is drained
    /// atomically and fires first, then the persistent listeners, each in
    /// registration order. Listener faults are isolated.
    pub fn emit(&self, event: &str, args: &[Value], ack: Option<&AckSender>) {
        let (once, on) = {
            let mut events = self.events.lock().unwrap();
            match events.get_mut(event) {
                Some(lists) => (std::mem::take(&mut lists.once), lists.on.clone()),
                None => return,
            }
        };

        for callback in once.iter().chain(on.iter()) {
            Self::invoke(event, callback, args, ack);
        }
    }

    /// Removes every listener for every event. Called on socket teardown so
    /// listeners holding references back to their socket are released.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// The declared shape of the first persistent listener for `event`, or
    /// `None` when nothing is registered.
    pub fn signature(&self, event: &str) -> Option<Signature> {
        let events = self.events.lock().unwrap();
        events
            .get(event)
            .and_then(|lists| lists.on.first())
            .map(|cb| Signature { arity: cb.arity })
    }

    fn invoke(event: &str, callback: &Callback, args: &[Value], ack: Option<&AckSender>) {
        if let Some(arity) = callback.arity {
            if args.len() != arity {
                tracing::warn!(
                    event,
                    expected = arity,
                    got = args.len(),
                    "listener arity mismatch, skipping"
                );
                return;
            }
        }
        if catch_unwind(AssertUnwindSafe(|| (callback.f)(args, ack))).is_err() {
            tracing::warn!(event, "listener panicked");
        }
    }
}

/// Decodes the argument at `index` into a concrete type.
///
/// Convenience for listeners that want typed access to positional JSON
/// arguments; returns `None` on missing or non-convertible values.
pub fn arg<T: serde::de::DeserializeOwned>(args: &[Value], index: usize) -> Option<T> {
    serde_json::from_value(args.get(index)?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = count.clone();
        let callback = Callback::new(move |_, _| {
            count_in.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn listeners_fire_with_args() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        emitter.on(
            "test",
            Callback::new(move |args, _| {
                seen_in.lock().unwrap().extend_from_slice(args);
            }),
        );
        emitter.emit("test", &[json!("hello"), json!(2)], None);
        assert_eq!(*seen.lock().unwrap(), vec![json!("hello"), json!(2)]);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order_in = order.clone();
            emitter.on(
                "test",
                Callback::new(move |_, _| order_in.lock().unwrap().push(i)),
            );
        }
        emitter.emit("test", &[], None);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn once_fires_exactly_once_and_before_persistent() {
        let emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_in = order.clone();
        emitter.on(
            "test",
            Callback::new(move |_, _| order_in.lock().unwrap().push("on")),
        );
        let order_in = order.clone();
        emitter.once(
            "test",
            Callback::new(move |_, _| order_in.lock().unwrap().push("once")),
        );

        emitter.emit("test", &[], None);
        emitter.emit("test", &[], None);
        assert_eq!(*order.lock().unwrap(), vec!["once", "on", "on"]);
    }

    #[test]
    fn off_removes_from_both_lists() {
        let emitter = EventEmitter::new();
        let (count, callback) = counter();
        emitter.on("test", callback.clone());
        emitter.once("test", callback.clone());
        let (other_count, other) = counter();
        emitter.on("test", other);

        emitter.off("test", &callback);
        emitter.emit("test", &[], None);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(other_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_is_scoped_to_the_event() {
        let emitter = EventEmitter::new();
        let (count, callback) = counter();
        emitter.on("a", callback.clone());
        emitter.on("b", callback.clone());
        emitter.off("a", &callback);
        emitter.emit("a", &[], None);
        emitter.emit("b", &[], None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let emitter = EventEmitter::new();
        emitter.on("test", Callback::new(|_, _| panic!("boom")));
        let (count, callback) = counter();
        emitter.on("test", callback);
        emitter.emit("test", &[], None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arity_mismatch_is_isolated() {
        let emitter = EventEmitter::new();
        let strict_count = Arc::new(AtomicUsize::new(0));
        let strict_in = strict_count.clone();
        emitter.on(
            "test",
            Callback::with_arity(2, move |_, _| {
                strict_in.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let (variadic_count, variadic) = counter();
        emitter.on("test", variadic);

        emitter.emit("test", &[json!(1)], None);
        assert_eq!(strict_count.load(Ordering::SeqCst), 0);
        assert_eq!(variadic_count.load(Ordering::SeqCst), 1);

        emitter.emit("test", &[json!(1), json!(2)], None);
        assert_eq!(strict_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signature_reports_first_persistent_listener() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.signature("test"), None);
        emitter.on("test", Callback::with_arity(2, |_, _| {}));
        emitter.on("test", Callback::new(|_, _| {}));
        assert_eq!(emitter.signature("test"), Some(Signature { arity: Some(2) }));
    }

    #[test]
    fn concurrent_emits_reach_every_listener() {
        let emitter = Arc::new(EventEmitter::new());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count_in = count.clone();
            emitter.on(
                "test",
                Callback::new(move |_, _| {
                    count_in.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let emitter = emitter.clone();
                std::thread::spawn(move || emitter.emit("test", &[], None))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn typed_argument_access() {
        let args = [json!("room1"), json!(7)];
        assert_eq!(arg::<String>(&args, 0).as_deref(), Some("room1"));
        assert_eq!(arg::<u64>(&args, 1), Some(7));
        assert_eq!(arg::<u64>(&args, 0), None);
        assert_eq!(arg::<u64>(&args, 5), None);
    }
}
