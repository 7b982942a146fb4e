//! Broadcast fan-out over a captured target set.

use std::collections::HashSet;
use std::sync::Weak;

use serde_json::Value;
use uuid::Uuid;

use veles_protocol::{event_data, Packet};

use crate::namespace::Namespace;

/// A fan-out emit builder.
///
/// Captures a namespace and a target id set at construction; [`to`] narrows
/// the targets to a room's members, and [`emit`] delivers best-effort: a
/// recipient whose outbound queue is full or closed is skipped silently,
/// the rest proceed.
///
/// [`to`]: BroadcastOperator::to
/// [`emit`]: BroadcastOperator::emit
pub struct BroadcastOperator {
    namespace: Weak<Namespace>,
    targets: Vec<Uuid>,
}

impl BroadcastOperator {
    pub(crate) fn new(namespace: Weak<Namespace>, targets: Vec<Uuid>) -> Self {
        Self { namespace, targets }
    }

    /// Narrows the targets to those also in `room`.
    pub fn to(&self, room: &str) -> Self {
        let targets = match self.namespace.upgrade() {
            Some(namespace) => {
                let members: HashSet<Uuid> = namespace.room_members(room).into_iter().collect();
                self.targets
                    .iter()
                    .filter(|id| members.contains(id))
                    .copied()
                    .collect()
            }
            None => Vec::new(),
        };
        Self {
            namespace: self.namespace.clone(),
            targets,
        }
    }

    /// Emits `event` to every target still present in the namespace.
    pub fn emit(&self, event: &str, args: &[Value]) {
        let Some(namespace) = self.namespace.upgrade() else {
            return;
        };
        let packet = Packet::event(namespace.name(), event_data(event, args), None);
        tracing::debug!(
            namespace = %namespace.name(),
            event,
            targets = self.targets.len(),
            "broadcast"
        );
        for id in &self.targets {
            if let Some(socket) = namespace.socket(*id) {
                socket.try_enqueue(packet.clone());
            }
        }
    }

    /// The captured target ids.
    pub fn targets(&self) -> &[Uuid] {
        &self.targets
    }
}
