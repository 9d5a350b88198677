//! NIP-46 envelope codec
//!
//! Requests and responses travel inside kind-24133 relay events whose
//! content is the NIP-04/NIP-44 encryption of these JSON envelopes.
//! Parameters are positional strings; each method validates arity and
//! shape itself.

use serde::{Deserialize, Serialize};

/// Result string used to hand an approval URL back to a waiting client.
///
/// Clients recognise a response whose `result` is exactly this sentinel
/// and open the URL carried in the secondary slot.
pub const AUTH_URL_RESULT: &str = "auth_url";

/// An inbound RPC envelope: `{id, method, params[]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).expect("request envelope serializes")
    }
}

/// An outbound RPC envelope: `{id, result, error?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A successful response carrying a plain or JSON-encoded result.
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: result.into(),
            error: None,
        }
    }

    /// A failure: `result` is the literal string `"error"` and the
    /// human-readable message rides in the secondary slot.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: "error".to_string(),
            error: Some(message.into()),
        }
    }

    /// The `auth_url` sentinel pointing the client at an approval page.
    pub fn auth_url(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: AUTH_URL_RESULT.to_string(),
            error: Some(url.into()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).expect("response envelope serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let req = Request::new("abc", "sign_event", vec!["{\"kind\":1}".to_string()]);
        let parsed = Request::from_json(&req.as_json()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_request_missing_params_defaults_empty() {
        let parsed = Request::from_json(r#"{"id":"1","method":"ping"}"#).unwrap();
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn test_response_error_shape() {
        let resp = Response::error("1", "unknown method");
        let json = resp.as_json();
        assert!(json.contains(r#""result":"error""#));
        assert!(json.contains(r#""error":"unknown method""#));
    }

    #[test]
    fn test_response_ok_omits_error_field() {
        let json = Response::ok("1", "pong").as_json();
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_auth_url_sentinel() {
        let resp = Response::auth_url("9", "https://bunker.example/requests/42");
        assert_eq!(resp.result, AUTH_URL_RESULT);
        assert_eq!(
            resp.error.as_deref(),
            Some("https://bunker.example/requests/42")
        );
    }
}
