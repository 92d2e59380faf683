//! Per-cache view state
//!
//! [`CacheViewInfo`] holds everything the manager knows about one cache:
//! the committed view, at most one pending view, the change ledger and the
//! registered listener. A prepared pending view only ever leaves through
//! an explicit commit or rollback.

use std::sync::Arc;

use crate::changes::PendingViewChanges;
use crate::listener::CacheMembershipListener;
use crate::types::CacheView;

/// View state tracked for a single cache
pub struct CacheViewInfo {
    cache_name: String,
    committed_view: CacheView,
    pending_view: Option<CacheView>,
    pending_changes: PendingViewChanges,
    listener: Option<Arc<dyn CacheMembershipListener>>,
}

impl CacheViewInfo {
    /// Bootstrap state for a cache nobody has installed a view for yet
    pub fn new(cache_name: impl Into<String>) -> Self {
        let cache_name = cache_name.into();
        let pending_changes = PendingViewChanges::new(cache_name.clone());
        Self {
            cache_name,
            committed_view: CacheView::empty(),
            pending_view: None,
            pending_changes,
            listener: None,
        }
    }

    /// The cache this state belongs to
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// The last committed view (the empty view until one commits)
    pub fn committed_view(&self) -> &CacheView {
        &self.committed_view
    }

    /// The prepared view awaiting commit or rollback, if any
    pub fn pending_view(&self) -> Option<&CacheView> {
        self.pending_view.as_ref()
    }

    /// Whether a prepared view is awaiting resolution
    pub fn has_pending_view(&self) -> bool {
        self.pending_view.is_some()
    }

    /// Store a prepared view and raise the id floor to match
    pub fn prepare_view(&mut self, pending: CacheView) {
        self.pending_changes.update_latest_view_id(pending.view_id);
        self.pending_view = Some(pending);
    }

    /// Promote the pending view with this id to committed.
    ///
    /// Returns the new committed view, or `None` when the pending view's id
    /// does not match (a stale or misdirected commit leaves state untouched).
    pub fn commit_view(&mut self, view_id: i64) -> Option<CacheView> {
        match self.pending_view.take() {
            Some(pending) if pending.view_id == view_id => {
                self.committed_view = pending;
                Some(self.committed_view.clone())
            }
            other => {
                self.pending_view = other;
                None
            }
        }
    }

    /// Discard the pending view; the committed view stays in effect.
    /// The rollback's fresh id raises the floor so it is never reused.
    pub fn rollback_view(&mut self, new_view_id: i64) {
        self.pending_view = None;
        self.pending_changes.update_latest_view_id(new_view_id);
    }

    /// The change ledger for this cache
    pub fn pending_changes(&self) -> &PendingViewChanges {
        &self.pending_changes
    }

    /// Mutable access to the change ledger
    pub fn pending_changes_mut(&mut self) -> &mut PendingViewChanges {
        &mut self.pending_changes
    }

    /// Register or clear the membership listener
    pub fn set_listener(&mut self, listener: Option<Arc<dyn CacheMembershipListener>>) {
        self.listener = listener;
    }

    /// The registered listener, if any
    pub fn listener(&self) -> Option<Arc<dyn CacheMembershipListener>> {
        self.listener.clone()
    }
}

impl std::fmt::Debug for CacheViewInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheViewInfo")
            .field("cache_name", &self.cache_name)
            .field("committed_view", &self.committed_view)
            .field("pending_view", &self.pending_view)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
