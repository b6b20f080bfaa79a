//! Transaction Context
//!
//! One logical unit of work. Objects are tracked in attachment order and
//! flushed in that order on commit; rollback walks them in reverse.

use super::{Binding, TransactionObject};
use crate::error::{Error, Result};
use crate::repository::RepositoryStats;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Atomic write scope offered by a backing store
pub trait TransactionalStore: Send + Sync {
    /// Run `flush` so that either all of its writes become durable or none do
    fn write_batch(&self, flush: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

type Tracked = Arc<dyn TransactionObject>;

fn identity(obj: &Tracked) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

// =============================================================================
// Context Inner
// =============================================================================

/// Object list shared (weakly) with every attached anchor
pub(crate) struct ContextInner {
    id: u64,
    objects: Mutex<IndexMap<usize, Tracked>>,
}

impl std::fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextInner").field("id", &self.id).finish()
    }
}

impl ContextInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn track(&self, obj: Tracked) {
        self.objects.lock().entry(identity(&obj)).or_insert(obj);
    }

    fn untrack(&self, obj: &Tracked) {
        self.objects.lock().shift_remove(&identity(obj));
    }

    fn snapshot(&self) -> Vec<Tracked> {
        self.objects.lock().values().cloned().collect()
    }

    fn release(&self, objects: &[Tracked]) {
        for obj in objects {
            obj.anchor().unbind(self);
        }
        let mut tracked = self.objects.lock();
        for obj in objects {
            tracked.shift_remove(&identity(obj));
        }
    }
}

// =============================================================================
// Transaction Context
// =============================================================================

/// Request-scoped unit of work
pub struct TransactionContext {
    inner: Arc<ContextInner>,
    store: Arc<dyn TransactionalStore>,
    stats: Option<Arc<RepositoryStats>>,
}

impl TransactionContext {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                objects: Mutex::new(IndexMap::new()),
            }),
            store,
            stats: None,
        }
    }

    pub(crate) fn with_stats(store: Arc<dyn TransactionalStore>, stats: Arc<RepositoryStats>) -> Self {
        let mut ctx = Self::new(store);
        ctx.stats = Some(stats);
        ctx
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Attach `obj` to this context.
    ///
    /// A clean object attached to another context moves here. A dirty one
    /// fails with [`Error::Implementation`].
    pub fn attach<T: TransactionObject + 'static>(&self, obj: &Arc<T>) -> Result<()> {
        let tracked: Tracked = obj.clone();
        match obj.anchor().bind(&self.inner)? {
            Binding::Unchanged | Binding::Bound => {}
            Binding::Moved(previous) => {
                debug!(
                    object = %tracked.describe(),
                    from = previous.id(),
                    to = self.inner.id,
                    "Moved clean object between transaction contexts"
                );
                previous.untrack(&tracked);
            }
        }
        self.inner.track(tracked);
        Ok(())
    }

    pub fn size_of_tracked_objects(&self) -> usize {
        self.inner.objects.lock().len()
    }

    /// True if any tracked object has pending changes
    pub fn is_dirty(&self) -> bool {
        self.inner.snapshot().iter().any(|obj| obj.is_dirty())
    }

    /// Flush every dirty object inside one store batch, then accept the
    /// pending state of every tracked object and detach them.
    ///
    /// On a store failure the error is returned and every object stays
    /// dirty and attached; the caller is expected to roll back.
    pub fn commit(&self) -> Result<()> {
        let objects = self.inner.snapshot();

        if let Some(obj) = objects.iter().find(|obj| obj.is_dirty_without_context()) {
            return Err(Error::implementation(format!(
                "{} was modified without a transaction context",
                obj.describe()
            )));
        }

        let dirty = objects.iter().filter(|obj| obj.is_dirty()).count();
        self.store
            .write_batch(&mut || {
                for obj in &objects {
                    if obj.is_dirty() {
                        obj.flush()?;
                    }
                }
                Ok(())
            })
            .map_err(|e| {
                error!(ctx = self.inner.id, error = %e, "Transaction commit failed");
                e
            })?;

        for obj in &objects {
            obj.commit_pending();
            obj.anchor().settle_commit();
        }
        self.inner.release(&objects);

        if let Some(stats) = &self.stats {
            stats.commits.fetch_add(1, Ordering::Relaxed);
        }
        debug!(ctx = self.inner.id, tracked = objects.len(), dirty, "Transaction committed");
        Ok(())
    }

    /// Restore every tracked object to its last committed state and detach it
    pub fn rollback(&self) {
        let objects = self.inner.snapshot();
        for obj in objects.iter().rev() {
            obj.rollback_pending();
            obj.anchor().settle_rollback();
        }
        self.inner.release(&objects);

        if let Some(stats) = &self.stats {
            stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        debug!(ctx = self.inner.id, tracked = objects.len(), "Transaction rolled back");
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.inner.id)
            .field("tracked", &self.size_of_tracked_objects())
            .finish()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let objects = self.inner.snapshot();
        if objects.is_empty() {
            return;
        }
        if objects.iter().any(|obj| obj.is_dirty()) {
            warn!(
                ctx = self.inner.id,
                tracked = objects.len(),
                "Transaction context dropped with uncommitted changes, rolling back"
            );
            self.rollback();
        } else {
            self.inner.release(&objects);
        }
    }
}
