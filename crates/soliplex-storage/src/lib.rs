//! Persistence layer for the Soliplex ingestion engine.
//!
//! Two backends implement the same [`IngestStore`] contract:
//!
//! - [`PostgresStore`] — the concurrent client/server backend. Step claims
//!   use `FOR UPDATE SKIP LOCKED`; suitable for multi-worker production.
//! - [`MemoryStore`] — the embedded single-writer backend used for
//!   development and tests. Claims use a conditional update under one
//!   writer lock, which yields the same claim invariant.
//!
//! The artifact store lives here too, as a capability trait with
//! filesystem, object-store, and database backends.

pub mod artifacts;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use artifacts::{ArtifactError, ArtifactStore, DbArtifactStore, FsArtifactStore, S3ArtifactStore};
pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PostgresStore;
pub use store::{IngestStore, StoreError};
