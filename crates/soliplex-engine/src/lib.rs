//! The Soliplex workflow execution engine.
//!
//! Ties the persistence layer to the handler contract: the registry loads
//! declarative workflow definitions and parameter sets, the ingest service
//! records documents, the launcher materializes run groups, the dispatcher
//! executes claimed steps and advances the state machine, and the worker
//! runtime drives it all with bounded concurrency, heartbeats, and crash
//! recovery.

pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod launch;
pub mod registry;
pub mod worker;

pub use dispatch::Dispatcher;
pub use error::EngineError;
pub use handlers::builtin_handlers;
pub use ingest::{IngestService, IngestedDocument};
pub use launch::{start_workflows, StartOptions};
pub use registry::{Origin, Registry, RegistryError};
pub use worker::{Worker, WorkerConfig};
