use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// An append-only list of registered callbacks. Registration may race with delivery: delivery
/// works from a snapshot, so a listener added mid-broadcast is picked up by the next one.
pub(crate) struct ListenerList<L: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Arc<L>)>>,
}

trait Unregister: Send + Sync {
    fn unregister(&self, id: u64) -> bool;
}

impl<L: ?Sized + Send + Sync> Unregister for ListenerList<L> {
    fn unregister(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}

impl<L: ?Sized + Send + Sync + 'static> ListenerList<L> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ListenerList {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn add(self: &Arc<Self>, listener: Arc<L>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, listener));
        let list: Arc<dyn Unregister> = self.clone();
        ListenerHandle {
            id,
            list: Arc::downgrade(&list),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Returned by every listener registration. Dropping the handle leaves the listener registered;
/// call [ListenerHandle::remove] to unregister it.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    list: Weak<dyn Unregister>,
}

impl ListenerHandle {
    /// Unregisters the listener. Returns false if it was already removed or its owner is gone.
    pub fn remove(self) -> bool {
        self.list
            .upgrade()
            .map(|list| list.unregister(self.id))
            .unwrap_or(false)
    }
}
