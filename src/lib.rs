//! Ingestion of Brazilian bank and card exports into deduplicated,
//! classified transactions.
//!
//! [`pipeline::Pipeline`] is the entry point: open an upload session with the
//! file bytes, `process` it into a preview, then `confirm` to persist.

pub mod batches;
pub mod classifier;
pub mod db;
pub mod detector;
pub mod error;
pub mod exclusion;
pub mod extractor;
pub mod fingerprint;
pub mod fmt;
pub mod identity;
pub mod installments;
pub mod migration;
pub mod models;
pub mod money;
pub mod normalizer;
pub mod pipeline;
pub mod propagation;
pub mod scopes;
pub mod session;
pub mod settings;

pub use error::{ExtratoError, Result};
pub use pipeline::Pipeline;
