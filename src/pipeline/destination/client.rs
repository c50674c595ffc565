// Authenticated Graph-style HTTP client
//
// Shared by the uploader, the verifier and the credential check.

use std::fmt;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::pipeline::errors::{PipelineError, Result};

/// Graph error codes that mean "try again"
const TRANSIENT_CODES: &[i64] = &[1, 2, 4, 17, 32, 341, 368];

/// Graph error code for an invalid or expired token
const INVALID_TOKEN_CODE: i64 = 190;

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<i64>,
    is_transient: Option<bool>,
}

/// A failed Graph call
#[derive(Debug, Clone, PartialEq)]
pub struct GraphFailure {
    pub status: Option<u16>,
    pub code: Option<i64>,
    pub message: String,
    /// Worth retrying the same request
    pub transient: bool,
}

impl GraphFailure {
    /// Token rejected: retrying cannot help
    pub fn is_auth(&self) -> bool {
        self.status == Some(401) || self.code == Some(INVALID_TOKEN_CODE)
    }

    /// Client-side rejection that the same request will keep getting
    pub fn is_permanent(&self) -> bool {
        self.is_auth() || (!self.transient && self.status.is_some_and(|s| (400..500).contains(&s)))
    }

    fn transport(e: &reqwest::Error) -> Self {
        Self {
            status: e.status().map(|s| s.as_u16()),
            code: None,
            message: e.to_string(),
            transient: true,
        }
    }
}

impl fmt::Display for GraphFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "HTTP {}: ", status)?;
        }
        if let Some(code) = self.code {
            write!(f, "(#{}) ", code)?;
        }
        f.write_str(&self.message)
    }
}

/// Extract a Graph error from a response body, if it carries one
pub fn parse_graph_error(status: StatusCode, body: &str) -> Option<GraphFailure> {
    let parsed = serde_json::from_str::<GraphErrorEnvelope>(body).ok();

    if parsed.is_none() && status.is_success() {
        return None;
    }

    let server_side = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
    let failure = match parsed {
        Some(GraphErrorEnvelope { error }) => {
            let transient = error.is_transient.unwrap_or(false)
                || error.code.is_some_and(|c| TRANSIENT_CODES.contains(&c))
                || server_side;
            let message = match (error.message, error.kind) {
                (Some(m), Some(k)) => format!("{}: {}", k, m),
                (Some(m), None) => m,
                (None, Some(k)) => k,
                (None, None) => "unknown Graph error".to_string(),
            };
            GraphFailure {
                status: Some(status.as_u16()),
                code: error.code,
                message,
                transient,
            }
        }
        None => GraphFailure {
            status: Some(status.as_u16()),
            code: None,
            message: body.chars().take(300).collect(),
            transient: server_side,
        },
    };
    Some(failure)
}

/// Result of the credential check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialReport {
    pub id: String,
    pub name: Option<String>,
}

/// HTTP client carrying the bearer credential
#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    token: String,
}

impl fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphClient").field("token", &"<redacted>").finish()
    }
}

impl GraphClient {
    pub fn new(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
        }
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.http.get(url).bearer_auth(&self.token)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.http.post(url).bearer_auth(&self.token)
    }

    /// Send and decode a JSON body, mapping HTTP and Graph errors to `GraphFailure`
    pub async fn send_json(&self, request: RequestBuilder) -> std::result::Result<Value, GraphFailure> {
        let response = request.send().await.map_err(|e| GraphFailure::transport(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| GraphFailure::transport(&e))?;

        if let Some(failure) = parse_graph_error(status, &body) {
            debug!(%failure, "graph call failed");
            return Err(failure);
        }

        serde_json::from_str(&body).map_err(|e| GraphFailure {
            status: Some(status.as_u16()),
            code: None,
            message: format!("invalid JSON response: {}", e),
            transient: false,
        })
    }

    /// Check that the token can read `container_id` ("Test Token")
    pub async fn check_credentials(
        &self,
        graph_url: &str,
        container_id: &str,
        timeout: Duration,
    ) -> Result<CredentialReport> {
        let url = format!("{}/{}", graph_url.trim_end_matches('/'), container_id);
        let value = self
            .send_json(self.get(&url).query(&[("fields", "id,name")]).timeout(timeout))
            .await
            .map_err(|f| PipelineError::UploadSessionRejected {
                status: f.status,
                message: f.to_string(),
            })?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if id != container_id {
            return Err(PipelineError::UploadSessionRejected {
                status: None,
                message: format!("token resolved to `{}`, not to container `{}`", id, container_id),
            });
        }

        Ok(CredentialReport {
            id,
            name: value.get("name").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Read a Graph id that may be encoded as a string or a number
pub fn id_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_body() {
        let body = r#"{"error":{"message":"Error validating access token","type":"OAuthException","code":190}}"#;
        let failure = parse_graph_error(StatusCode::BAD_REQUEST, body).unwrap();
        assert!(failure.is_auth());
        assert!(!failure.transient);
        assert_eq!(failure.to_string(), "HTTP 400: (#190) OAuthException: Error validating access token");
    }

    #[test]
    fn test_transient_codes() {
        let body = r#"{"error":{"message":"Please retry","code":2,"is_transient":true}}"#;
        assert!(parse_graph_error(StatusCode::BAD_REQUEST, body).unwrap().transient);
        let failure = parse_graph_error(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>").unwrap();
        assert!(failure.transient);
        assert_eq!(failure.code, None);
    }

    #[test]
    fn test_permanent_failures() {
        let invalid = r#"{"error":{"message":"Invalid parameter","type":"OAuthException","code":100}}"#;
        assert!(parse_graph_error(StatusCode::BAD_REQUEST, invalid).unwrap().is_permanent());

        let retry = r#"{"error":{"message":"Please retry","code":2,"is_transient":true}}"#;
        assert!(!parse_graph_error(StatusCode::BAD_REQUEST, retry).unwrap().is_permanent());
        assert!(!parse_graph_error(StatusCode::SERVICE_UNAVAILABLE, "").unwrap().is_permanent());
        assert!(!parse_graph_error(StatusCode::TOO_MANY_REQUESTS, "").unwrap().is_permanent());
        assert!(parse_graph_error(StatusCode::UNAUTHORIZED, "").unwrap().is_permanent());
    }

    #[test]
    fn test_success_body_is_not_an_error() {
        assert!(parse_graph_error(StatusCode::OK, r#"{"id":"123"}"#).is_none());
        // a 200 with an error envelope still counts as a failure
        assert!(parse_graph_error(StatusCode::OK, r#"{"error":{"message":"x","code":100}}"#).is_some());
    }

    #[test]
    fn test_id_field_accepts_numbers() {
        let v: Value = serde_json::json!({"a": "42", "b": 43, "c": ""});
        assert_eq!(id_field(&v, "a").as_deref(), Some("42"));
        assert_eq!(id_field(&v, "b").as_deref(), Some("43"));
        assert_eq!(id_field(&v, "c"), None);
    }

    #[test]
    fn test_debug_hides_token() {
        let client = GraphClient::new(reqwest::Client::new(), "EAAB-secret");
        assert!(!format!("{:?}", client).contains("EAAB"));
    }
}
