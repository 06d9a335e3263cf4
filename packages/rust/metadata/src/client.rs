//! HTTP client for an OMDb-style metadata API.
//!
//! One GET per entity: `?apikey=<key>&t=<title>&plot=full`. The client never
//! retries; a timeout is reported as a transient outcome and left to the next
//! scheduled run.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use boxoffice_shared::{BoxOfficeError, MetadataConfig, Result};

use crate::{LIMIT_REACHED_ERROR, MetadataPayload, MetadataSource, Outcome};

/// User-Agent string for metadata requests.
const USER_AGENT: &str = concat!("boxoffice/", env!("CARGO_PKG_VERSION"));

/// Longest body excerpt carried in an error outcome.
const MAX_EXCERPT: usize = 200;

/// Metadata client bound to one API key and endpoint.
pub struct OmdbClient {
    client: Client,
    api_key: String,
    base_url: Url,
}

impl OmdbClient {
    /// Create a client with the configured per-request timeout.
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| BoxOfficeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl MetadataSource for OmdbClient {
    async fn fetch(&self, entity_key: &str) -> Outcome {
        debug!(entity = entity_key, "fetching metadata");

        let response = match self
            .client
            .get(self.base_url.clone())
            .query(&[
                ("apikey", self.api_key.as_str()),
                ("t", entity_key),
                ("plot", "full"),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let outcome = classify_transport_error(&e);
                warn!(entity = entity_key, error = %e, outcome = outcome.label(), "metadata request failed");
                return outcome;
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(entity = entity_key, error = %e, "metadata body read failed");
                return Outcome::TransientError(format!("body read failed: {e}"));
            }
        };

        let outcome = classify_response(status, &body);
        match &outcome {
            Outcome::QuotaExceeded => info!(entity = entity_key, %status, "API request limit reached"),
            Outcome::NotFound => warn!(entity = entity_key, "no metadata found"),
            Outcome::TransientError(reason) | Outcome::UnexpectedError(reason) => {
                warn!(entity = entity_key, reason = %reason, outcome = outcome.label(), "metadata fetch failed")
            }
            Outcome::Success(payload) => {
                debug!(entity = entity_key, external_id = %payload.external_id, "metadata fetched")
            }
        }
        outcome
    }
}

/// Map a transport-level failure to an outcome.
fn classify_transport_error(err: &reqwest::Error) -> Outcome {
    if err.is_builder() {
        Outcome::UnexpectedError(format!("invalid request: {err}"))
    } else {
        // timeouts, connect/DNS failures, resets
        Outcome::TransientError(err.to_string())
    }
}

/// Classify an HTTP status and body. Total over all inputs.
pub fn classify_response(status: StatusCode, body: &str) -> Outcome {
    if status == StatusCode::UNAUTHORIZED {
        return Outcome::QuotaExceeded;
    }
    if status != StatusCode::OK {
        return Outcome::TransientError(format!("HTTP {status}"));
    }

    let document: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            return Outcome::UnexpectedError(format!(
                "unparseable body: {e} (got: {})",
                excerpt(body)
            ));
        }
    };

    match document.get("Response").and_then(|v| v.as_str()) {
        Some("True") => match document.get("imdbID").and_then(|v| v.as_str()) {
            Some(id) if !id.trim().is_empty() => Outcome::Success(MetadataPayload {
                external_id: id.trim().to_string(),
                document,
            }),
            _ => Outcome::UnexpectedError("positive response without imdbID".into()),
        },
        Some("False") => {
            if document.get("Error").and_then(|v| v.as_str()) == Some(LIMIT_REACHED_ERROR) {
                Outcome::QuotaExceeded
            } else {
                Outcome::NotFound
            }
        }
        _ => Outcome::UnexpectedError(format!(
            "missing Response flag (got: {})",
            excerpt(body)
        )),
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(MAX_EXCERPT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, timeout: Duration) -> MetadataConfig {
        MetadataConfig {
            api_key: "test-key".into(),
            base_url: Url::parse(&format!("{}/", server.uri())).unwrap(),
            timeout,
        }
    }

    async fn fetch_with(template: ResponseTemplate, timeout: Duration) -> Outcome {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("apikey", "test-key"))
            .and(query_param("t", "the dark knight"))
            .and(query_param("plot", "full"))
            .respond_with(template)
            .mount(&server)
            .await;

        let client = OmdbClient::new(&config_for(&server, timeout)).unwrap();
        client.fetch("the dark knight").await
    }

    #[tokio::test]
    async fn success_carries_external_id_and_document() {
        let body = serde_json::json!({
            "Title": "The Dark Knight",
            "Year": "2008",
            "imdbID": "tt0468569",
            "Response": "True"
        });
        let outcome = fetch_with(
            ResponseTemplate::new(200).set_body_json(&body),
            Duration::from_secs(5),
        )
        .await;

        match outcome {
            Outcome::Success(payload) => {
                assert_eq!(payload.external_id, "tt0468569");
                assert_eq!(payload.document["Year"], "2008");
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_match_is_not_found() {
        let body = serde_json::json!({"Response": "False", "Error": "Movie not found!"});
        let outcome = fetch_with(
            ResponseTemplate::new(200).set_body_json(&body),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome, Outcome::NotFound);
    }

    #[tokio::test]
    async fn limit_string_is_quota() {
        let body = serde_json::json!({"Response": "False", "Error": "Request limit reached!"});
        let outcome = fetch_with(
            ResponseTemplate::new(200).set_body_json(&body),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome, Outcome::QuotaExceeded);
    }

    #[tokio::test]
    async fn unauthorized_is_quota() {
        let body = serde_json::json!({"Response": "False", "Error": "Invalid API key!"});
        let outcome = fetch_with(
            ResponseTemplate::new(401).set_body_json(&body),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome, Outcome::QuotaExceeded);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let outcome = fetch_with(ResponseTemplate::new(503), Duration::from_secs(5)).await;
        assert!(matches!(outcome, Outcome::TransientError(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let body = serde_json::json!({"Response": "True", "imdbID": "tt1"});
        let outcome = fetch_with(
            ResponseTemplate::new(200)
                .set_body_json(&body)
                .set_delay(Duration::from_millis(500)),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(outcome, Outcome::TransientError(_)));
    }

    #[tokio::test]
    async fn garbage_body_is_unexpected() {
        let outcome = fetch_with(
            ResponseTemplate::new(200).set_body_string("<html>oops</html>"),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(outcome, Outcome::UnexpectedError(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        // Bind then drop a listener so the port is closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = MetadataConfig {
            api_key: "test-key".into(),
            base_url: Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap(),
            timeout: Duration::from_secs(2),
        };

        let client = OmdbClient::new(&config).unwrap();
        let outcome = client.fetch("up").await;
        assert!(matches!(outcome, Outcome::TransientError(_)));
    }

    #[test]
    fn classification_is_total() {
        let ok = StatusCode::OK;
        assert_eq!(
            classify_response(ok, r#"{"Response":"True"}"#).label(),
            "unexpected_error"
        );
        assert_eq!(
            classify_response(ok, r#"{"Response":"True","imdbID":"  "}"#).label(),
            "unexpected_error"
        );
        assert_eq!(classify_response(ok, r#"{"Title":"x"}"#).label(), "unexpected_error");
        assert_eq!(classify_response(ok, "[]").label(), "unexpected_error");
        assert_eq!(classify_response(ok, "").label(), "unexpected_error");
        assert_eq!(
            classify_response(ok, r#"{"Response":"False"}"#).label(),
            "not_found"
        );
        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, "").label(),
            "transient_error"
        );
        assert_eq!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, "").label(),
            "transient_error"
        );
        assert_eq!(
            classify_response(StatusCode::UNAUTHORIZED, "not json").label(),
            "quota_exceeded"
        );
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let long = "é".repeat(500);
        assert_eq!(excerpt(&long).chars().count(), MAX_EXCERPT);
        assert_eq!(excerpt("short"), "short");
    }
}
