//! # CacheViews: coordinated membership views for distributed caches
//!
//! Every named cache in a cluster runs on an explicitly agreed membership
//! view. This crate lets the cluster coordinator install new views through
//! a two-phase prepare/commit protocol, batch join and leave requests,
//! evict crashed nodes, and reconcile diverged views after a partition
//! merge or a coordinator change.

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod changes;
pub mod error;
pub mod info;
pub mod listener;
pub mod manager;
pub mod protocol;
pub mod transport;
pub mod types;

mod trigger;

// Re-export main types
pub use changes::PendingViewChanges;
pub use error::{TransportError, TransportResult, ViewsError, ViewsResult};
pub use info::CacheViewInfo;
pub use listener::CacheMembershipListener;
pub use manager::CacheViewsManager;
pub use protocol::{CommandResponse, PeerResponse, ViewControlCommand, MAX_MESSAGE_SIZE};
pub use transport::{CommandHandler, ResponseMode, Transport};
pub use types::{
    CacheView, CacheViewsConfig, CacheViewsStats, ClusterViewEvent, NodeAddress, EMPTY_VIEW_ID,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
