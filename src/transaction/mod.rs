//! Transaction Machinery
//!
//! Every persisted entity is a [`TransactionObject`]. Its mutable parts
//! (flags, properties, fields) share one [`TxAnchor`]
//! that records dirtiness, the owning [`TransactionContext`] and the
//! entity's presence in the backing store.
//!
//! # Lock order
//!
//! Component lock, then anchor lock, then context object list. A context
//! never holds its object list while calling into an object.

mod cell;
mod context;

pub use cell::TxCell;
pub use context::{TransactionContext, TransactionalStore};

pub(crate) use context::ContextInner;

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

// =============================================================================
// Presence
// =============================================================================

/// Where an entity stands relative to the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Not in the store
    Absent,
    /// In the store (or pending insertion)
    Live,
    /// Pending removal
    Deleted,
}

/// What a flush has to do for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Create,
    Update,
    Delete,
    Nothing,
}

// =============================================================================
// Anchor
// =============================================================================

#[derive(Debug)]
struct AnchorState {
    ctx: Option<Weak<ContextInner>>,
    dirty: bool,
    detached_mutation: bool,
    committed: Presence,
    current: Presence,
}

impl AnchorState {
    fn live_context(&self) -> Option<Arc<ContextInner>> {
        self.ctx.as_ref().and_then(Weak::upgrade)
    }
}

pub(crate) enum Binding {
    Unchanged,
    Bound,
    Moved(Arc<ContextInner>),
}

/// Shared transactional state of one entity
#[derive(Debug)]
pub struct TxAnchor {
    state: Mutex<AnchorState>,
}

impl TxAnchor {
    fn with(committed: Presence, current: Presence, dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AnchorState {
                ctx: None,
                dirty,
                detached_mutation: false,
                committed,
                current,
            }),
        })
    }

    /// Anchor of an entity that does not exist in the store yet
    pub fn created() -> Arc<Self> {
        Self::with(Presence::Absent, Presence::Live, true)
    }

    /// Anchor of an entity restored from the store
    pub fn loaded() -> Arc<Self> {
        Self::with(Presence::Live, Presence::Live, false)
    }

    /// Record a mutation. Without a context the mutation is remembered and
    /// rejected at the next commit.
    pub fn touch(&self) {
        let mut st = self.state.lock();
        st.dirty = true;
        if st.live_context().is_none() {
            st.detached_mutation = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_dirty_without_context(&self) -> bool {
        self.state.lock().detached_mutation
    }

    pub fn has_context(&self) -> bool {
        self.state.lock().live_context().is_some()
    }

    /// Committed and current presence
    pub fn presence(&self) -> (Presence, Presence) {
        let st = self.state.lock();
        (st.committed, st.current)
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().current == Presence::Live
    }

    pub fn transition(&self) -> Transition {
        match self.presence() {
            (Presence::Absent, Presence::Live) => Transition::Create,
            (Presence::Live, Presence::Live) => Transition::Update,
            (Presence::Live, Presence::Deleted) => Transition::Delete,
            _ => Transition::Nothing,
        }
    }

    pub(crate) fn mark_deleted(&self) {
        self.state.lock().current = Presence::Deleted;
        self.touch();
    }

    pub(crate) fn bind(&self, ctx: &Arc<ContextInner>) -> Result<Binding> {
        let mut st = self.state.lock();
        match st.live_context() {
            Some(current) if Arc::ptr_eq(&current, ctx) => Ok(Binding::Unchanged),
            Some(current) => {
                if st.dirty {
                    return Err(Error::implementation(format!(
                        "attempt to replace an active transaction context ({} with {})",
                        current.id(),
                        ctx.id()
                    )));
                }
                st.ctx = Some(Arc::downgrade(ctx));
                Ok(Binding::Moved(current))
            }
            None => {
                st.ctx = Some(Arc::downgrade(ctx));
                Ok(Binding::Bound)
            }
        }
    }

    pub(crate) fn unbind(&self, ctx: &ContextInner) {
        let mut st = self.state.lock();
        let bound_here = st
            .ctx
            .as_ref()
            .map(|weak| std::ptr::eq(weak.as_ptr(), ctx))
            .unwrap_or(false);
        if bound_here {
            st.ctx = None;
        }
    }

    pub(crate) fn settle_commit(&self) {
        let mut st = self.state.lock();
        if st.current == Presence::Deleted {
            st.current = Presence::Absent;
        }
        st.committed = st.current;
        st.dirty = false;
        st.detached_mutation = false;
    }

    pub(crate) fn settle_rollback(&self) {
        let mut st = self.state.lock();
        st.current = st.committed;
        st.dirty = false;
        st.detached_mutation = false;
    }
}

// =============================================================================
// Transaction Object
// =============================================================================

/// The mutation and dirty-tracking protocol of every persisted entity
pub trait TransactionObject: Send + Sync {
    /// Shared transactional state
    fn anchor(&self) -> &TxAnchor;

    /// Human readable identification for log and error messages
    fn describe(&self) -> String;

    /// Write pending changes to the persistence drivers. Called only from
    /// inside a context commit.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Accept pending changes of all components as the new baseline
    fn commit_pending(&self);

    /// Restore all components to their last committed values
    fn rollback_pending(&self);

    fn is_dirty(&self) -> bool {
        self.anchor().is_dirty()
    }

    fn is_dirty_without_context(&self) -> bool {
        self.anchor().is_dirty_without_context()
    }

    fn has_transaction_context(&self) -> bool {
        self.anchor().has_context()
    }

    /// Accept pending in-memory changes. Persisting is the context's job.
    fn commit(&self) -> Result<()> {
        let anchor = self.anchor();
        if anchor.is_dirty_without_context() {
            return Err(Error::implementation(format!(
                "{} was modified without a transaction context",
                self.describe()
            )));
        }
        if anchor.is_dirty() && !anchor.has_context() {
            return Err(Error::implementation(format!(
                "commit called on dirty {} without a transaction context",
                self.describe()
            )));
        }
        self.commit_pending();
        anchor.settle_commit();
        Ok(())
    }

    fn rollback(&self) {
        self.rollback_pending();
        self.anchor().settle_rollback();
    }
}

/// `set_transaction_context` for any shared transaction object
pub trait TransactionalExt: TransactionObject + Sized + 'static {
    fn set_transaction_context(self: &Arc<Self>, ctx: &TransactionContext) -> Result<()> {
        ctx.attach(self)
    }
}

impl<T: TransactionObject + 'static> TransactionalExt for T {}
