//! Pending membership changes for a single cache
//!
//! [`PendingViewChanges`] accumulates join and leave requests between
//! installations and decides when a new view is worth proposing. It also
//! owns the cache's view id counter: ids only ever move forward, and every
//! rollback attempt burns a fresh one.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::types::{CacheView, NodeAddress, EMPTY_VIEW_ID};

/// Ledger of requested membership changes and the view id counter
#[derive(Debug)]
pub struct PendingViewChanges {
    cache_name: String,
    /// Nodes that asked to join since the last committed view
    joiners: HashSet<NodeAddress>,
    /// Nodes that left or asked to leave and are still in the committed view
    leavers: HashSet<NodeAddress>,
    /// Highest view id handed out or observed for this cache
    last_view_id: i64,
    /// Highest committed id seen by reset_changes, used to tell a rollback
    /// echo apart from a genuinely newer commit
    committed_view_id: i64,
    /// Set while a proposed view awaits commit or rollback
    install_in_progress: bool,
    /// Reconciled base membership seeded by recovery; forces one unified
    /// proposal even when the membership would otherwise be unchanged
    recovered_members: Option<Vec<NodeAddress>>,
}

impl PendingViewChanges {
    /// Create an empty ledger for the named cache
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            joiners: HashSet::new(),
            leavers: HashSet::new(),
            last_view_id: 0,
            committed_view_id: EMPTY_VIEW_ID,
            install_in_progress: false,
            recovered_members: None,
        }
    }

    /// Record a join request. Idempotent; cancels a pending leave.
    pub fn request_join(&mut self, joiner: NodeAddress) {
        self.leavers.remove(&joiner);
        self.joiners.insert(joiner);
    }

    /// Record leave requests. Idempotent; cancels pending joins.
    pub fn request_leave(&mut self, leavers: impl IntoIterator<Item = NodeAddress>) {
        for leaver in leavers {
            self.joiners.remove(&leaver);
            self.leavers.insert(leaver);
        }
    }

    /// Seed a forced view change after this node took over as coordinator.
    ///
    /// `members` is the reconciled membership the cluster agreed on during
    /// recovery; `joiners` are recovered nodes that belonged to no partition.
    pub fn request_coord_change(
        &mut self,
        members: Vec<NodeAddress>,
        joiners: impl IntoIterator<Item = NodeAddress>,
    ) {
        debug!(
            cache = %self.cache_name,
            base_members = members.len(),
            "seeding forced view change after coordinator change"
        );
        self.recovered_members = Some(members);
        for joiner in joiners {
            self.request_join(joiner);
        }
    }

    /// Compute the next view to install, if one is due.
    ///
    /// The proposed membership is the committed membership (or the recovery
    /// base) with leavers removed and new joiners appended in address order.
    /// Yields nothing while an installation is in flight, and nothing when
    /// the result would equal the committed membership without a forced
    /// change. A returned view consumes a fresh id and marks the
    /// installation as in progress.
    pub fn create_pending_view(&mut self, committed: &CacheView) -> Option<CacheView> {
        if self.install_in_progress {
            trace!(
                cache = %self.cache_name,
                "not proposing a view, another installation is in progress"
            );
            return None;
        }

        let base = match &self.recovered_members {
            Some(members) => members.as_slice(),
            None => committed.members.as_slice(),
        };

        let mut members: Vec<NodeAddress> = base
            .iter()
            .copied()
            .filter(|member| !self.leavers.contains(member))
            .collect();
        let mut new_joiners: Vec<NodeAddress> = self
            .joiners
            .iter()
            .copied()
            .filter(|joiner| !members.contains(joiner))
            .collect();
        new_joiners.sort();
        members.extend(new_joiners);

        if self.recovered_members.is_none() && members == committed.members {
            return None;
        }

        self.last_view_id += 1;
        self.install_in_progress = true;
        Some(CacheView::new(self.last_view_id, members))
    }

    /// Absorb the outcome of an installation.
    ///
    /// Joiners now inside the committed view and leavers now outside it are
    /// satisfied and dropped; requests that arrived mid-installation stay
    /// for the next cycle. The recovery seed is discharged only by a commit
    /// with a strictly newer id, so a rolled-back unified view is proposed
    /// again later.
    pub fn reset_changes(&mut self, new_committed: &CacheView) {
        self.install_in_progress = false;
        self.joiners.retain(|joiner| !new_committed.contains(joiner));
        self.leavers.retain(|leaver| new_committed.contains(leaver));
        if new_committed.view_id > self.committed_view_id {
            self.recovered_members = None;
            self.committed_view_id = new_committed.view_id;
        }
    }

    /// Consume a fresh id for a rollback attempt
    pub fn rollback_view_id(&mut self) -> i64 {
        self.last_view_id += 1;
        self.last_view_id
    }

    /// Raise the id floor to at least `view_id`
    pub fn update_latest_view_id(&mut self, view_id: i64) {
        if view_id > self.last_view_id {
            self.last_view_id = view_id;
        }
    }

    /// Nodes recorded as leaving and not yet reflected in a committed view
    pub fn leavers(&self) -> &HashSet<NodeAddress> {
        &self.leavers
    }

    /// Whether a proposed view is still awaiting commit or rollback
    pub fn is_install_in_progress(&self) -> bool {
        self.install_in_progress
    }
}
