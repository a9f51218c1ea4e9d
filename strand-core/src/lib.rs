//! # strand-core: Document model for the Strand platform
//!
//! Everything the trigger layer and the server share:
//!
//! ```text
//! ┌──────────────┐   apply(batch)   ┌──────────────┐
//! │ Tx / TxFactory│ ───────────────► │ MemoryTxLog  │──► subscribers
//! └──────────────┘                  └──────┬───────┘
//!                                          │ overlay + commit
//!                                          ▼
//!                                   ┌──────────────┐
//!                                   │  MemoryDb    │◄── TriggerStore
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: document, class, domain and workspace identifiers
//! - [`tx`]: transactions, the generic `Doc`, `TxFactory`
//! - [`records`]: typed views (references, mention markers, spaces, ...)
//! - [`schema`]: class hierarchy, attribute kinds, index hints
//! - [`markup`]: content trees and reference extraction
//! - [`store`]: read-side traits and queries
//! - [`memdb`]: in-memory document store with atomic batches
//! - [`txlog`]: ordered transaction log with subscribers

pub mod error;
pub mod ids;
pub mod markup;
pub mod memdb;
pub mod records;
pub mod schema;
pub mod store;
pub mod tx;
pub mod txlog;

pub use error::{CoreError, CoreResult};
pub use ids::{class, mixin, ClassId, DocId, Domain, WorkspaceId};
pub use markup::{
    excerpt_equal, extract_references, parse_markup, references_in, to_markup, Content,
    ExtractedReference, MarkupNode,
};
pub use memdb::{ChangeSet, MemoryDb};
pub use records::{
    DocNotifyContext, MentionMarker, PersonAccount, Reference, Space, MENTIONS_COLLECTION,
    REFERENCES_COLLECTION,
};
pub use schema::{
    AttributeDef, ClassDef, FieldIndex, Hierarchy, IndexKey, IndexKind, IndexOrder, IndexSpec,
    SchemaDescriptor, SchemaFile, TypeKind,
};
pub use store::{CollaborativeRef, CollaborativeStore, MemoryCollaborativeStore, Query, TriggerStore};
pub use tx::{Attributes, Doc, Tx, TxBody, TxFactory, TxKind};
pub use txlog::{LogEntry, LogSink, MemoryTxLog, TransactionLog};
