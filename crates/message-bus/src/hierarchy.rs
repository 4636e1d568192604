//! Type hierarchy registry: dense type ids plus descendant closures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::message::{MessageKind, MsgTypeId, ACK_COMMAND, COMMAND, COMMAND_RESPONSE, MESSAGE};

pub type ObserverId = u64;

type TypesAdded = Arc<dyn Fn() + Send + Sync>;

/// Maps [`MessageKind`]s to [`MsgTypeId`]s and answers "which registered
/// types count as this type" for dispatch.
///
/// Observers registered with [`observe`](Self::observe) run after new types
/// are added, on the registering thread, with no registry lock held.
pub struct MessageHierarchy {
    state: RwLock<HierarchyState>,
    observers: Mutex<Vec<(ObserverId, TypesAdded)>>,
    next_observer: AtomicU64,
}

#[derive(Default)]
struct HierarchyState {
    ids: HashMap<&'static str, MsgTypeId>,
    kinds: Vec<&'static MessageKind>,
    // indexed by type id; ascending ids, self included
    descendants: Vec<Vec<MsgTypeId>>,
}

impl HierarchyState {
    fn insert(&mut self, kind: &'static MessageKind) -> (MsgTypeId, bool) {
        if let Some(id) = self.ids.get(kind.name()).copied() {
            let existing = self.kinds[id.index()];
            if existing.parent().map(MessageKind::name) != kind.parent().map(MessageKind::name) {
                warn!(
                    target = "message_bus.hierarchy",
                    kind = kind.name(),
                    "message kind re-declared with a different parent; keeping the first"
                );
            }
            return (id, false);
        }
        if let Some(parent) = kind.parent() {
            self.insert(parent);
        }
        let id = MsgTypeId(self.kinds.len());
        self.kinds.push(kind);
        self.ids.insert(kind.name(), id);
        (id, true)
    }

    fn rebuild_descendants(&mut self) {
        let mut descendants = vec![Vec::new(); self.kinds.len()];
        for (index, kind) in self.kinds.iter().enumerate() {
            for ancestor in kind.lineage() {
                if let Some(id) = self.ids.get(ancestor.name()) {
                    descendants[id.index()].push(MsgTypeId(index));
                }
            }
        }
        self.descendants = descendants;
    }
}

impl MessageHierarchy {
    pub fn new() -> Arc<Self> {
        let hierarchy = Self {
            state: RwLock::new(HierarchyState::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        };
        {
            let mut state = hierarchy.state.write();
            for kind in [&MESSAGE, &COMMAND, &ACK_COMMAND, &COMMAND_RESPONSE] {
                state.insert(kind);
            }
            state.rebuild_descendants();
        }
        Arc::new(hierarchy)
    }

    pub fn type_id(&self, kind: &MessageKind) -> Option<MsgTypeId> {
        self.state.read().ids.get(kind.name()).copied()
    }

    /// Registers `kind` and its ancestors; returns the existing id when
    /// already known.
    pub fn register(&self, kind: &'static MessageKind) -> MsgTypeId {
        if let Some(id) = self.type_id(kind) {
            return id;
        }
        let (id, added) = {
            let mut state = self.state.write();
            let (id, added) = state.insert(kind);
            if added {
                state.rebuild_descendants();
            }
            (id, added)
        };
        if added {
            debug!(
                target = "message_bus.hierarchy",
                kind = kind.name(),
                type_id = id.index(),
                "registered message type"
            );
            self.notify_types_added();
        }
        id
    }

    /// Registers every kind, notifying observers at most once.
    pub fn register_all(&self, kinds: &[&'static MessageKind]) -> Vec<MsgTypeId> {
        let (ids, added) = {
            let mut state = self.state.write();
            let mut added = false;
            let ids = kinds
                .iter()
                .map(|&kind| {
                    let (id, new) = state.insert(kind);
                    added |= new;
                    id
                })
                .collect::<Vec<_>>();
            if added {
                state.rebuild_descendants();
            }
            (ids, added)
        };
        if added {
            self.notify_types_added();
        }
        ids
    }

    pub fn type_id_or_register(&self, kind: &'static MessageKind) -> MsgTypeId {
        self.register(kind)
    }

    /// Descendant closure of `kind`, itself included. Empty when `kind` is
    /// not registered.
    pub fn descendants(&self, kind: &MessageKind) -> Vec<MsgTypeId> {
        let state = self.state.read();
        state
            .ids
            .get(kind.name())
            .and_then(|id| state.descendants.get(id.index()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn descendants_of(&self, id: MsgTypeId) -> Vec<MsgTypeId> {
        self.state
            .read()
            .descendants
            .get(id.index())
            .cloned()
            .unwrap_or_default()
    }

    pub fn kind_of(&self, id: MsgTypeId) -> Option<&'static MessageKind> {
        self.state.read().kinds.get(id.index()).copied()
    }

    /// Highest id handed out so far; tables sized `max_type_id + 1` cover
    /// every registered type.
    pub fn max_type_id(&self) -> MsgTypeId {
        MsgTypeId(self.state.read().kinds.len().saturating_sub(1))
    }

    pub fn len(&self) -> usize {
        self.state.read().kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn observe(&self, on_types_added: impl Fn() + Send + Sync + 'static) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(on_types_added)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(observer, _)| *observer != id);
        observers.len() != before
    }

    fn notify_types_added(&self) {
        let observers: Vec<TypesAdded> = self
            .observers
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in observers {
            callback();
        }
    }
}
