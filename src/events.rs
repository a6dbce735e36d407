//! Engine event broadcasting
//!
//! The engine pushes coarse notifications to any number of subscribers (a
//! UI, a logger) over a tokio broadcast channel. Events carry wallet ids
//! and summary figures only; subscribers read full state through the
//! engine's query API.

use tokio::sync::broadcast;
use tracing::debug;

use crate::types::SyncStatus;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A wallet's sync lifecycle moved to a new status.
    SyncStatusChanged {
        wallet_id: String,
        status: SyncStatus,
    },
    /// A validated snapshot was committed; balances may have changed.
    SnapshotCommitted {
        wallet_id: String,
        tip_height: u32,
        confirmed_balance_sat: u64,
        unconfirmed_balance_sat: u64,
    },
    /// A wallet crossed its staleness threshold without a fresh sync.
    WalletStale { wallet_id: String },
    /// A transaction built by this engine was broadcast.
    TxBroadcast {
        wallet_id: String,
        txid: bitcoin::Txid,
    },
}

/// Owns the broadcast sender. Cheap to clone handles from; dropping every
/// receiver is not an error, sends just go nowhere.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!("Engine event: {:?}", event);
        // A send error just means no subscribers are listening right now.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(EngineEvent::SyncStatusChanged {
            wallet_id: "w1".to_string(),
            status: SyncStatus::Syncing,
        });

        let event = rx1.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::SyncStatusChanged { .. }));
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::WalletStale {
            wallet_id: "w1".to_string(),
        });
    }
}
