//! # folio-history — version history and revert for co-edited documents
//!
//! Turns a continuously mutating replicated document into a durable,
//! append-only version log, and rolls the live document back to any saved
//! version without discarding edits other users made in the meantime.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────┐   WebSocket (binary sync + JSON API)
//!                 │  HistoryServer   │ ◄────────────────────────────────────── clients
//!                 └────────┬─────────┘
//!                          ▼
//!                 ┌──────────────────┐
//!                 │ VersioningService│  per-document operation lock
//!                 └──┬─────┬──────┬──┘
//!          ┌─────────┘     │      └──────────────┐
//!          ▼               ▼                     ▼
//! ┌────────────────┐ ┌──────────────┐   ┌──────────────────┐
//! │ DocumentMeta   │ │ RevertEngine │──►│ ConnectionRegistry│──► Reload
//! │ Store (counter)│ └──────┬───────┘   └──────────────────┘
//! └───────┬────────┘        │
//!         │        ┌────────┴────────┐
//!         │        ▼                 ▼
//!         │ ┌──────────────┐  ┌──────────────┐
//!         │ │ VersionHistory│ │ LiveDocuments │──► BroadcastGroup
//!         │ │ Store         │ │ (yrs replicas)│
//!         │ └──────┬───────┘  └──────┬───────┘
//!         └────────┴────────┬────────┘
//!                           ▼
//!                  HistoryBackend (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Document ids, version records, document metadata
//! - [`storage`] — Backend trait, RocksDB and in-memory implementations
//! - [`history`] — Append-only version ledger
//! - [`meta`] — Version counter and title, two-phase version allocation
//! - [`doc`] — Narrow adapter over the `yrs` CRDT engine
//! - [`live`] — Live document hub with durable update log
//! - [`revert`] — CRDT-aware rollback
//! - [`registry`] — Per-document connections for control signals
//! - [`service`] — Save / list / revert / rename / info
//! - [`api`] — JSON envelope with stable `errno` codes
//! - [`protocol`] — Binary sync frames (bincode-encoded SyncMessage)
//! - [`server`] — WebSocket server

pub mod api;
pub mod broadcast;
pub mod doc;
pub mod error;
pub mod history;
pub mod live;
pub mod locks;
pub mod meta;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod revert;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use api::{ApiRequest, ApiResponse};
pub use doc::{DocError, SharedDoc, TrackedDoc};
pub use error::{ErrorCode, ServiceError};
pub use history::VersionHistoryStore;
pub use live::{LiveConfig, LiveDocuments};
pub use meta::{DocumentMetadataStore, VersionAllocation};
pub use model::{Author, DocumentId, DocumentMeta, VersionRecord, VersionSummary};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use registry::{Connection, ConnectionRegistry, Signal};
pub use revert::{RevertEngine, RevertError, RevertOutcome, RevertPlan};
pub use server::{HistoryServer, ServerConfig, ServerStats};
pub use service::VersioningService;
pub use storage::{HistoryBackend, MemoryBackend, RocksStore, StorageError, StoreConfig};
