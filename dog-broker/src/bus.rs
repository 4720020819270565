use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::{CompletionRecord, JobRecord, JobRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Persistent listener on a namespace topic
pub type NamespaceListener = Arc<dyn Fn(&JobRecord) + Send + Sync>;

/// One-shot waiter on a reference topic
pub type RefWaiter = Box<dyn FnOnce(&CompletionRecord) + Send>;

/// In-process dispatch with two tables: namespace topics and reference topics.
///
/// Emission snapshots listeners under the lock and calls them after it is
/// released, so a listener may subscribe or publish without deadlocking.
#[derive(Default)]
pub struct EventBus {
    namespaces: Mutex<HashMap<String, Vec<(ListenerId, NamespaceListener)>>>,
    refs: Mutex<HashMap<JobRef, Vec<(ListenerId, RefWaiter)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_namespace(&self, namespace: impl Into<String>, listener: NamespaceListener) -> ListenerId {
        let id = next_listener_id();
        self.namespaces
            .lock()
            .entry(namespace.into())
            .or_default()
            .push((id, listener));
        id
    }

    /// Deliver a job to every listener of its namespace. Returns the listener count.
    pub fn emit_namespace(&self, record: &JobRecord) -> usize {
        let snapshot: Vec<NamespaceListener> = self
            .namespaces
            .lock()
            .get(&record.namespace)
            .map(|entries| entries.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default();

        for listener in &snapshot {
            listener(record);
        }
        snapshot.len()
    }

    /// Remove one namespace listener
    pub fn off_namespace(&self, id: ListenerId) -> bool {
        let mut namespaces = self.namespaces.lock();
        let mut removed = false;
        namespaces.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Remove every listener of a namespace. Returns how many were removed.
    pub fn remove_namespace(&self, namespace: &str) -> usize {
        self.namespaces
            .lock()
            .remove(namespace)
            .map_or(0, |entries| entries.len())
    }

    pub fn namespace_listeners(&self, namespace: &str) -> usize {
        self.namespaces.lock().get(namespace).map_or(0, Vec::len)
    }

    /// Register a one-shot waiter for a job ref
    pub fn once_ref(&self, job_ref: JobRef, waiter: RefWaiter) -> ListenerId {
        let id = next_listener_id();
        self.refs.lock().entry(job_ref).or_default().push((id, waiter));
        id
    }

    /// Fire and discard every waiter for the completion's ref. Returns how many fired.
    pub fn emit_ref(&self, record: &CompletionRecord) -> usize {
        let waiters = self.refs.lock().remove(&record.job_ref).unwrap_or_default();
        let fired = waiters.len();
        for (_, waiter) in waiters {
            waiter(record);
        }
        fired
    }

    /// Take back a waiter that has not fired yet
    pub fn take_ref(&self, job_ref: &JobRef, id: ListenerId) -> Option<RefWaiter> {
        let mut refs = self.refs.lock();
        let entries = refs.get_mut(job_ref)?;
        let index = entries.iter().position(|(entry_id, _)| *entry_id == id)?;
        let (_, waiter) = entries.remove(index);
        if entries.is_empty() {
            refs.remove(job_ref);
        }
        Some(waiter)
    }

    pub fn pending_refs(&self) -> usize {
        self.refs.lock().values().map(Vec::len).sum()
    }
}
