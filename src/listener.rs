//! Per-cache listener notified of view installation phases
//!
//! The component that actually moves cache data registers one listener
//! per cache at join time and reacts to the protocol transitions.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::ViewsResult;
use crate::types::{CacheView, NodeAddress};

/// Callbacks a cache receives while views are installed for it
#[async_trait]
pub trait CacheMembershipListener: Send + Sync {
    /// First installation phase. Returning an error vetoes the pending
    /// view cluster-wide and makes the coordinator roll it back.
    async fn prepare_view(
        &self,
        pending_view: &CacheView,
        committed_view: &CacheView,
    ) -> ViewsResult<()>;

    /// The prepared view with this id is now the committed view
    async fn commit_view(&self, view_id: i64);

    /// The prepared view was abandoned; the view with `committed_view_id`
    /// stays in effect
    async fn rollback_view(&self, committed_view_id: i64);

    /// Nodes that left the cluster while the committed view still lists them
    async fn update_leavers(&self, leavers: HashSet<NodeAddress>);
}
