// Offline-first Bitcoin wallet engine: Electrum sync with validated
// snapshot promotion, coin selection, transaction construction and fee
// bumping. Host applications embed this crate and subscribe to its events.

pub mod address;
pub mod coin_selection;
pub mod config;
pub mod electrum;
pub mod engine;
pub mod events;
pub mod fee_bump;
pub mod payment_uri;
pub mod store;
pub mod tx_builder;
pub mod types;

pub use address::{AddressDeriver, AddressRecord, Chain, ScriptType};
pub use config::EngineConfig;
pub use engine::{CancelToken, EngineError, SyncReport, SyncToken, WalletEngine};
pub use events::EngineEvent;
pub use types::{Balances, LkgSnapshot, StagingSnapshot, TxDetail, TxSummary, Utxo};
