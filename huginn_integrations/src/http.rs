//! Shared HTTP plumbing for the enrichment services.

use huginn_core::sources::LookupError;
use huginn_core::{Error, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(Error::backend_reqwest)
}

pub(crate) fn normalize_base(base_url: &str) -> Result<String> {
    let base = base_url.trim().trim_end_matches('/');
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(Error::Config(format!(
            "enrichment base url must be http(s): '{base_url}'"
        )));
    }
    Ok(base.to_string())
}

/// Map a non-success status onto a lookup failure. `None` means the status is a success.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<LookupError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(LookupError::RateLimited {
            retry_after: retry_after(headers),
        });
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Some(LookupError::Transient(format!("upstream returned {status}")));
    }
    // 404 and friends: the service will answer the same way until it re-publishes.
    Some(LookupError::Malformed(format!("upstream returned {status}")))
}

/// Retry-After in delta-seconds; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub fn classify_transport(e: &reqwest::Error) -> LookupError {
    if e.is_decode() {
        LookupError::Malformed(e.to_string())
    } else {
        LookupError::Transient(e.to_string())
    }
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, LookupError> {
    serde_json::from_slice(body).map_err(|e| LookupError::Malformed(format!("decode body: {e}")))
}

/// GET `url` with `query` and return the body of a successful response.
pub(crate) async fn get_bytes(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
) -> std::result::Result<Vec<u8>, LookupError> {
    let resp = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| classify_transport(&e))?;
    if let Some(err) = classify_status(resp.status(), resp.headers()) {
        return Err(err);
    }
    let body = resp.bytes().await.map_err(|e| classify_transport(&e))?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn statuses_map_onto_the_failure_taxonomy() {
        let mut headers = HeaderMap::new();
        assert_eq!(classify_status(StatusCode::OK, &headers), None);
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &headers),
            Some(LookupError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &headers),
            Some(LookupError::Malformed(_))
        ));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(LookupError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(LookupError::RateLimited { retry_after: None })
        );
    }

    #[test]
    fn base_urls_are_normalized() {
        assert_eq!(
            normalize_base("https://example.test/api/").unwrap(),
            "https://example.test/api"
        );
        assert!(normalize_base("ftp://example.test").is_err());
    }
}
