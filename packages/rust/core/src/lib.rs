//! Core ingestion and enrichment workflows for boxoffice.
//!
//! This crate ties the store and the metadata client together into the two
//! top-level operations invoked by an external trigger:
//! - [`loader::load_incremental`]: watermark-based append of new feed rows
//! - [`enrichment::EnrichmentScheduler::run`]: bounded-concurrency metadata fetch
//!
//! plus the candidate refresh and backlog selection that feed the scheduler.

pub mod backlog;
pub mod candidates;
pub mod enrichment;
pub mod loader;
