//! Shared types, error model, and configuration for boxoffice.
//!
//! This crate is the foundation depended on by all other boxoffice crates.
//! It provides:
//! - [`BoxOfficeError`]: the unified error type
//! - Domain types ([`EntityToEnrich`], [`IngestionLogEntry`], [`TableName`], ...)
//! - Configuration ([`AppConfig`], runtime configs, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DatabaseConfig, EnrichConfig, EnrichmentConfig, LoadConfig, LoaderConfig,
    MetadataConfig, OmdbConfig, StoreConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, resolve_api_key,
};
pub use error::{BoxOfficeError, Result};
pub use types::{
    ApiUsageLogEntry, EnrichmentRecord, EntityToEnrich, IngestionLogEntry, RawRevenueRecord,
    SourceRevenueRow, TableName, normalize_title, watermark_floor,
};
