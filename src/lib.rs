//! veridex library surface.
//!
//! Off-chain orchestration for a verified data-artifact market: providers
//! commit hash-locked artifacts and reveal them against paying escrows,
//! independent oracle nodes score revealed artifacts, and settlement follows
//! the score the ledger's aggregation contract finalizes. The ledger is the
//! single source of truth; everything here reads it, reacts, and submits.

pub mod config;
pub mod consensus;
pub mod content;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod lifecycle;
pub mod oracle;
pub mod runtime;
pub mod submit;
pub mod types;
pub mod utils;
