//! Offline-first encrypted record store for ReliefNet field clients
//!
//! Provides:
//! - Local SQLite storage with payloads sealed under versioned AES-256-GCM
//!   keys
//! - Sync queue with priority drain order and exponential retry backoff
//! - Last-write-wins conflict reconciliation with a full audit log
//! - Key rotation gated on an empty queue, with historical key retention
//! - CSV conflict report export

pub mod api;
pub mod error;
pub mod export;
pub mod keyring;
pub mod local_db;
pub mod models;
pub mod queue;
pub mod reconciler;
pub mod store;

pub use api::{HttpSyncApi, PushOutcome, ServerRecord, SyncApi};
pub use error::{StoreError, StoreResult};
pub use export::{CancelToken, ConflictExporter, ConflictFilter, ConflictReport, ExportProgress, ExportStage};
pub use keyring::Keyring;
pub use local_db::{LocalDatabase, StoreConfig};
pub use models::{
    ConflictRecord, ConflictSummary, KeyRotationStatus, PendingOperation, Record, RecordKind,
    StorageInfo, SyncAction, SyncStatus,
};
pub use queue::MAX_SYNC_ATTEMPTS;
pub use reconciler::{DrainReport, Reconciler};
pub use store::OfflineStore;
