//! Metadata API client and outcome classification.
//!
//! This crate provides:
//! - [`Outcome`]: the closed set of results of one metadata fetch
//! - [`MetadataSource`]: the seam the enrichment scheduler calls through
//! - [`OmdbClient`]: the HTTP implementation against an OMDb-style API

mod client;

use async_trait::async_trait;

pub use client::{OmdbClient, classify_response};

/// Error string the API puts in a 200 body once the request quota is spent.
pub const LIMIT_REACHED_ERROR: &str = "Request limit reached!";

/// A well-formed positive API response.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPayload {
    /// Unique external catalog id (e.g. `tt1049413`).
    pub external_id: String,
    /// Full response document.
    pub document: serde_json::Value,
}

/// Classified result of one fetch attempt. Every response maps to exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// HTTP 200 with a matching entity.
    Success(MetadataPayload),
    /// HTTP 200 but the API found no match.
    NotFound,
    /// HTTP 401, or a 200 whose body reports the request limit. Halts the batch.
    QuotaExceeded,
    /// Timeout, connection failure, or any other non-200 status.
    TransientError(String),
    /// A response that could not be parsed or classified.
    UnexpectedError(String),
}

impl Outcome {
    /// Short label for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::NotFound => "not_found",
            Self::QuotaExceeded => "quota_exceeded",
            Self::TransientError(_) => "transient_error",
            Self::UnexpectedError(_) => "unexpected_error",
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded)
    }
}

/// Anything that can look up metadata for an entity key.
///
/// Implementations must not fail: every failure mode is an [`Outcome`].
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch metadata for one entity key.
    async fn fetch(&self, entity_key: &str) -> Outcome;
}
