//! Persistent storage and index management.
//!
//! ```text
//! ┌──────────────┐  LogSink::persist   ┌────────────────────────────────┐
//! │ MemoryTxLog  │ ──────────────────► │ WorkspaceStore (one workspace) │
//! └──────────────┘                     └──────────────┬─────────────────┘
//!        ▲ recover on open                            │ column families
//!        │                                            ▼
//! ┌──────────────┐      ┌────────────────────────────────────────────────┐
//! │  MemoryDb    │      │ documents     : docs by domain (LZ4 JSON)     │
//! └──────────────┘      │ collections   : domain markers                │
//!                       │ indexes       : index catalog                 │
//!                       │ index_entries : secondary index entries       │
//!                       │ collaborative : yrs snapshots (LZ4)           │
//!                       │ txlog         : committed transactions        │
//!                       └────────────────────────────────────────────────┘
//! ```
//!
//! All workspaces share one RocksDB instance; every key starts with the
//! workspace name.

pub mod advisor;
pub mod rocks;

pub use advisor::{
    index_name, DomainIndexAdvisor, DomainIndexConfiguration, DomainOperations, IndexInfo,
    INDEX_DOCUMENT_THRESHOLD, PRIMARY_INDEX,
};
pub use rocks::{DomainStore, StoreConfig, StoreError, WorkspaceStore};
