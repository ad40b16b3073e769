//! The tunnel end-of-life signal.
//!
//! A tunnel ends exactly once, for exactly one reason, and any number of
//! waiters (readers, writers, the owner) may need to observe it. The signal
//! stores the first reason and wakes everyone; later signals are ignored,
//! making cancellation idempotent.

use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;

/// Why a tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EndReason {
    #[error("closed cleanly")]
    Closed,
    #[error("reset by peer")]
    Reset,
    #[error("keepalive expired")]
    KeepaliveExpired,
    #[error("connection establishment timed out")]
    ConnectTimeout,
    #[error("retransmission limit reached")]
    RetransLimit,
    #[error("the packet channel closed underneath the tunnel")]
    ChannelClosed,
}

/// A terminal signal carrying an [`EndReason`]. Cloning produces another
/// handle on the same signal.
#[derive(Debug, Clone)]
pub(crate) struct EndSignal {
    reason: Arc<OnceLock<EndReason>>,
    notify: broadcast::Sender<()>,
}

impl EndSignal {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            reason: Arc::new(OnceLock::new()),
            notify,
        }
    }

    /// Records the reason and wakes all waiters. Only the first call has
    /// any effect.
    pub fn signal(&self, reason: EndReason) {
        let _ = self.reason.set(reason);
        let _ = self.notify.send(());
    }

    /// The reason, if the tunnel has already ended.
    pub fn try_get(&self) -> Option<EndReason> {
        self.reason.get().copied()
    }

    /// Waits for the tunnel to end.
    pub async fn wait(&self) -> EndReason {
        let mut recv = self.notify.subscribe();
        loop {
            match self.try_get() {
                Some(reason) => return reason,
                None => _ = recv.recv().await,
            }
        }
    }
}
