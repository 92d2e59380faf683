//! Wake-up signalling for the view trigger loop
//!
//! The trigger loop paces itself with a single-slot channel: wake-ups
//! coalesce while a cycle is running, and each cycle waits at most the
//! configured cooldown, so bursts of joins and leaves batch into one
//! installation round.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Sending side of the trigger loop's wake channel
pub struct ViewTrigger {
    sender: Mutex<Option<mpsc::Sender<()>>>,
}

impl ViewTrigger {
    /// Create a trigger with no channel installed yet
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    /// Install a fresh wake channel and hand back the receiving end
    pub fn open(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        *self.sender.lock() = Some(tx);
        rx
    }

    /// Request a trigger cycle. A full slot already means one is due, so
    /// concurrent wake-ups collapse into a single cycle.
    pub fn wake(&self) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.try_send(());
        }
    }

    /// Drop the sender; the loop's current wait ends right away
    pub fn close(&self) {
        *self.sender.lock() = None;
    }
}

impl Default for ViewTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait up to `cooldown` for a wake-up.
///
/// Returns `false` once the channel is closed and the loop should exit.
/// An elapsed cooldown without a wake-up still runs a cycle, which keeps
/// the loop re-evaluating pending changes on a timer.
pub async fn wait_for_wake(rx: &mut mpsc::Receiver<()>, cooldown: Duration) -> bool {
    match tokio::time::timeout(cooldown, rx.recv()).await {
        Ok(Some(())) => true,
        Ok(None) => false,
        Err(_) => true,
    }
}
