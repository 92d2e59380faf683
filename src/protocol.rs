//! Control commands and wire codec for the view installation protocol
//!
//! Every cluster-level interaction between a coordinator and the other
//! members travels as a [`ViewControlCommand`] answered by a
//! [`CommandResponse`]. Commands are dispatched through a single handler
//! regardless of variant.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{TransportError, TransportResult};
use crate::types::{CacheView, NodeAddress};

/// Maximum size of an encoded command or response on the wire
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Control command for the cache view installation protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ViewControlCommand {
    /// A node asks to be added to a cache's next view
    RequestJoin {
        cache_name: String,
        sender: NodeAddress,
    },
    /// A node asks to be removed from a cache's next view
    RequestLeave {
        cache_name: String,
        sender: NodeAddress,
    },
    /// First phase: store the pending view and ask the listener to accept it
    PrepareView {
        cache_name: String,
        sender: NodeAddress,
        /// The view being installed
        pending_view: CacheView,
        /// The sender's committed view, for divergence detection
        committed_view: CacheView,
    },
    /// Second phase: promote the pending view with this id to committed
    CommitView {
        cache_name: String,
        sender: NodeAddress,
        view_id: i64,
    },
    /// Second phase: discard the pending view and advance the id floor
    RollbackView {
        cache_name: String,
        sender: NodeAddress,
        /// Fresh id consumed by this rollback attempt
        new_view_id: i64,
        /// The id of the view the receiver should still consider committed
        committed_view_id: i64,
    },
    /// A new coordinator asks for the receiver's committed views
    RecoverViews { sender: NodeAddress },
}

impl ViewControlCommand {
    /// The cache this command addresses, if any
    pub fn cache_name(&self) -> Option<&str> {
        match self {
            ViewControlCommand::RequestJoin { cache_name, .. }
            | ViewControlCommand::RequestLeave { cache_name, .. }
            | ViewControlCommand::PrepareView { cache_name, .. }
            | ViewControlCommand::CommitView { cache_name, .. }
            | ViewControlCommand::RollbackView { cache_name, .. } => Some(cache_name),
            ViewControlCommand::RecoverViews { .. } => None,
        }
    }

    /// The node that issued this command
    pub fn sender(&self) -> NodeAddress {
        match self {
            ViewControlCommand::RequestJoin { sender, .. }
            | ViewControlCommand::RequestLeave { sender, .. }
            | ViewControlCommand::PrepareView { sender, .. }
            | ViewControlCommand::CommitView { sender, .. }
            | ViewControlCommand::RollbackView { sender, .. }
            | ViewControlCommand::RecoverViews { sender } => *sender,
        }
    }
}

/// Successful payload of a handled command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandResponse {
    /// Command applied, nothing to report
    Ack,
    /// Answer to RecoverViews: committed view per cache this node runs
    RecoveredViews(HashMap<String, CacheView>),
}

/// Per-target outcome of a remote invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerResponse {
    /// The target handled the command
    Success(CommandResponse),
    /// The target rejected or failed the command
    Failed(String),
}

impl PeerResponse {
    /// Whether the target handled the command
    pub fn is_success(&self) -> bool {
        matches!(self, PeerResponse::Success(_))
    }
}

/// Send a length-prefixed message over the wire
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Serialize message
    let data = bincode::serialize(message)
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;

    if data.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(data.len()));
    }

    // Write length prefix
    let len = data.len() as u32;
    writer.write_u32(len).await?;

    // Write message data
    writer.write_all(&data).await?;
    writer.flush().await?;

    Ok(())
}

/// Read a length-prefixed message from the wire
///
/// Returns `Ok(None)` on a cleanly closed stream.
pub async fn read_message<R, T>(reader: &mut R) -> TransportResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // Read length prefix
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None); // Connection closed
        }
        Err(e) => return Err(TransportError::Io(e)),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(len));
    }

    // Read message data
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;

    // Deserialize message
    let message = bincode::deserialize(&buffer)
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;

    Ok(Some(message))
}
