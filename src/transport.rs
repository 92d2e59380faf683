//! Transport abstraction for the group communication layer
//!
//! The manager never talks to the network directly. It sends commands
//! through [`Transport`] and receives them through [`CommandHandler`],
//! so tests can drive a whole cluster in memory.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{TransportResult, ViewsResult};
use crate::protocol::{CommandResponse, PeerResponse, ViewControlCommand};
use crate::types::{ClusterViewEvent, NodeAddress};

/// Delivery guarantee requested for a remote invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Wait for every target's response or the timeout
    Synchronous,
    /// Fire and forget; the returned map is empty
    Asynchronous,
}

/// Group communication used by the cache views manager
///
/// Implementations provide request/response delivery to cluster members
/// plus membership change notifications. The deterministic coordinator
/// rule (for example oldest member) belongs to the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's address
    fn local_address(&self) -> NodeAddress;

    /// Current raw cluster member list
    fn members(&self) -> Vec<NodeAddress>;

    /// The current coordinator, once a cluster view has been received
    fn coordinator(&self) -> Option<NodeAddress>;

    /// Whether this node is the cluster coordinator
    fn is_coordinator(&self) -> bool;

    /// Invoke a command on the given targets, or on every other member
    /// when `targets` is `None`. The local node is always skipped; callers
    /// run their own handler directly. Synchronous mode waits up to
    /// `timeout` and returns one outcome per target.
    async fn invoke_remotely(
        &self,
        targets: Option<Vec<NodeAddress>>,
        command: ViewControlCommand,
        mode: ResponseMode,
        timeout: Duration,
    ) -> TransportResult<HashMap<NodeAddress, PeerResponse>>;

    /// Subscribe to membership change events
    fn subscribe_view_events(&self) -> broadcast::Receiver<ClusterViewEvent>;
}

/// Receiver side of the control protocol
///
/// The transport delivers every incoming [`ViewControlCommand`] to one
/// handler; the result becomes the sender's [`PeerResponse`].
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one control command
    async fn handle_command(&self, command: ViewControlCommand) -> ViewsResult<CommandResponse>;
}
