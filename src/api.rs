//! Signed transport to the ingest API.
//!
//! Both the sender and the pinger POST JSON with the same authentication:
//! a bearer token plus an HMAC-SHA256 of the exact body bytes in the
//! `X-Signature` header. The caller hands over the already-serialized body
//! string; it is signed and sent as-is so the signature always covers the
//! bytes on the wire.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use sha2::Sha256;

use crate::config::ApiConfig;
use crate::errors::ClientError;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of one POST, pre-classified for the caller.
#[derive(Debug)]
pub enum PostOutcome {
    /// 2xx
    Accepted,
    /// 4xx: the server rejected this payload; retrying is pointless.
    Rejected { status: StatusCode, body: String },
    /// 5xx, timeout or transport failure; retry later.
    Transient { reason: String },
}

/// Shared HTTP client with the credentials for both endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    secret_key: String,
    bearer_token: String,
}

/// Response bodies quoted in track errors are capped at this length.
const ERROR_BODY_LIMIT: usize = 512;

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            secret_key: config.secret_key.clone(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    /// HMAC-SHA256 over `body`, base64 without line breaks.
    pub fn sign(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(body.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// POST `body` to `url` with signature headers, classifying the result.
    ///
    /// `timeout` overrides the client default per request (the status
    /// endpoint uses a tighter bound than the ingest endpoint).
    pub async fn post_signed(&self, url: &str, body: String, timeout: Duration) -> PostOutcome {
        let signature = self.sign(&body);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", self.bearer_token);
        match HeaderValue::from_str(&bearer) {
            Ok(value) => headers.insert(AUTHORIZATION, value),
            Err(e) => {
                return PostOutcome::Transient {
                    reason: format!("invalid bearer token: {}", e),
                }
            }
        };
        match HeaderValue::from_str(&signature) {
            Ok(value) => headers.insert("X-Signature", value),
            Err(e) => {
                return PostOutcome::Transient {
                    reason: format!("invalid signature header: {}", e),
                }
            }
        };

        let result = self
            .http
            .post(url)
            .headers(headers)
            .timeout(timeout)
            .body(body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return PostOutcome::Transient {
                    reason: e.to_string(),
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            PostOutcome::Accepted
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let body = body.chars().take(ERROR_BODY_LIMIT).collect();
            PostOutcome::Rejected { status, body }
        } else {
            PostOutcome::Transient {
                reason: format!("HTTP {}", status),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_client(secret: &str) -> ApiClient {
        ApiClient::new(&ApiConfig {
            url: "https://ingest.example.com/tracks".to_string(),
            status_url: "https://ingest.example.com/status".to_string(),
            client_id: 1,
            secret_key: secret.to_string(),
            bearer_token: "token".to_string(),
            timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
        })
        .unwrap()
    }

    #[test]
    fn signature_is_stable_for_identical_bytes() {
        let client = test_client("secret");
        let body = r#"{"client_id":1,"tracks":[]}"#;
        assert_eq!(client.sign(body), client.sign(body));
    }

    #[test]
    fn signature_depends_on_body_and_key() {
        let a = test_client("secret-a");
        let b = test_client("secret-b");
        let body = r#"{"client_id":1,"tracks":[]}"#;
        assert_ne!(a.sign(body), b.sign(body));
        assert_ne!(a.sign(body), a.sign(r#"{"client_id":2,"tracks":[]}"#));
    }

    #[test]
    fn signature_matches_known_vector() {
        // hmac_sha256("key", "The quick brown fox jumps over the lazy dog"),
        // RFC 2104 style test vector, base64 of the well-known hex digest
        // f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8.
        let client = test_client("key");
        assert_eq!(
            client.sign("The quick brown fox jumps over the lazy dog"),
            "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg="
        );
    }
}
