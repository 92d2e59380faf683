//! Core types for cache view coordination
//!
//! This module defines the fundamental data structures shared by the
//! protocol engine, the trigger loop and the recovery procedure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress(pub Uuid);

impl NodeAddress {
    /// Generate a new random node address
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeAddress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// View id used before a cache has installed any view
pub const EMPTY_VIEW_ID: i64 = -1;

/// An agreed, numbered membership list for one cache.
///
/// Views are immutable snapshots: an installation replaces the whole view,
/// so readers never observe a partially updated member list. Two views for
/// the same cache are compared by id alone, the larger id always wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheView {
    /// Monotonically increasing view identifier, unique per cache
    pub view_id: i64,
    /// Ordered member list; the order is part of the agreement
    pub members: Vec<NodeAddress>,
}

impl CacheView {
    /// Create a view with the given id and members
    pub fn new(view_id: i64, members: Vec<NodeAddress>) -> Self {
        Self { view_id, members }
    }

    /// The bootstrap view a cache starts from before any installation
    pub fn empty() -> Self {
        Self {
            view_id: EMPTY_VIEW_ID,
            members: Vec::new(),
        }
    }

    /// True while the cache has never committed a real view
    pub fn is_empty_view(&self) -> bool {
        self.view_id <= 0
    }

    /// Whether the given node is a member of this view
    pub fn contains(&self, node: &NodeAddress) -> bool {
        self.members.contains(node)
    }
}

impl std::fmt::Display for CacheView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheView{{id={}, members=[", self.view_id)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", member)?;
        }
        write!(f, "]}}")
    }
}

/// A membership change notification from the group transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterViewEvent {
    /// The new cluster member list
    pub members: Vec<NodeAddress>,
    /// True when this view is the result of a partition merge
    pub is_merge: bool,
    /// True for the very first view a node observes
    pub is_initial: bool,
}

/// Configuration for the cache views manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheViewsConfig {
    /// Timeout applied to every remote invocation and to shutdown joins
    pub timeout: Duration,
    /// Minimum pacing between trigger cycles, batching join/leave bursts
    pub view_change_cooldown: Duration,
}

impl Default for CacheViewsConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            view_change_cooldown: Duration::from_secs(1),
        }
    }
}

/// Counters describing the manager's protocol activity
#[derive(Debug, Default, Clone)]
pub struct CacheViewsStats {
    /// Views successfully committed cluster-wide
    pub views_installed: u64,
    /// View installations resolved by rollback
    pub views_rolled_back: u64,
    /// Recovery procedures completed
    pub recoveries_completed: u64,
    /// Recovery procedures abandoned on a transport failure
    pub recoveries_failed: u64,
}
