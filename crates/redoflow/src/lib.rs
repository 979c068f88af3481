//! # redoflow: change data capture from physical redo logs
//!
//! redoflow tails a relational database's redo (write-ahead) log files,
//! reconstructs committed row-level changes in transaction order, and
//! streams them as JSON or binary messages to a consumer with
//! exactly-one-consumer-ack checkpointing.
//!
//! ## Pipeline
//!
//! ```text
//! ┌────────┐   ┌────────┐   ┌──────────────┐   ┌─────────┐   ┌────────┐
//! │ Reader │──▶│ Parser │──▶│ Transactions │──▶│ Builder │──▶│ Writer │──▶ sink
//! └────────┘   └────────┘   └──────────────┘   └─────────┘   └────────┘
//!   blocks      LWN drain     per-XID chunks     messages      acks
//! ```
//!
//! Data flows strictly forward; back-pressure flows backward as condvar
//! waits on the shared chunk pool. Every stage runs on its own thread and
//! resumes exactly from the persisted checkpoint after a restart.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use redoflow::config::Config;
//! use redoflow::context::Ctx;
//! use redoflow::replicator::Replicator;
//! use std::sync::Arc;
//!
//! # fn main() -> redoflow::error::Result<()> {
//! let config = Config::load(std::path::Path::new("redoflow.json"))?;
//! let ctx = Arc::new(Ctx::new(config.database.clone()).with_flags(&config.flags));
//! let mut replicator = Replicator::new(ctx, config)?;
//! replicator.run()
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod memory;
pub mod metadata;
pub mod parser;
pub mod reader;
pub mod replicator;
pub mod synth;
pub mod transaction;
pub mod types;
pub mod writer;

pub use config::Config;
pub use context::Ctx;
pub use error::{ErrorCategory, RedoError, Result};
pub use replicator::Replicator;
pub use types::{FileOffset, RowId, Scn, Seq, Xid};
