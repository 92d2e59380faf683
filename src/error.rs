//! Error types for cache view coordination

use std::time::Duration;

use thiserror::Error;

use crate::types::NodeAddress;

/// Main error type for cache view operations
#[derive(Error, Debug)]
pub enum ViewsError {
    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The named cache is not registered on this node
    #[error("Cache {0} not found")]
    CacheNotFound(String),

    /// A remote node answered a synchronous command with a failure
    #[error("Error executing command on node {node}: {details}")]
    RemoteFailure {
        /// The node that produced the failure
        node: NodeAddress,
        /// The failure reported by that node
        details: String,
    },

    /// A membership listener rejected or failed a callback
    #[error("Listener error: {0}")]
    Listener(String),

    /// The manager has been stopped or never started
    #[error("Cache views manager is not running")]
    NotRunning,

    /// The recovery procedure could not gather state from the cluster
    #[error("View recovery failed: {0}")]
    RecoveryFailed(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

/// Transport-specific errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// A synchronous invocation did not complete in time
    #[error("Remote invocation timed out after {0:?}")]
    Timeout(Duration),

    /// The target node cannot be reached
    #[error("Node {0} is unreachable")]
    NodeUnreachable(NodeAddress),

    /// An encoded command exceeds the wire limit
    #[error("Message exceeds maximum size: {0} bytes")]
    MessageTooLarge(usize),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The transport has shut down its channels
    #[error("Transport channel closed")]
    ChannelClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache view operations
pub type ViewsResult<T> = Result<T, ViewsError>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
