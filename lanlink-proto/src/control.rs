//! Control-message bodies shared by the switch and the point client.
//!
//! Bodies are UTF-8 JSON; the codec treats them as opaque bytes.

use serde::{Deserialize, Serialize};

/// `login` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// Tenant to join; optional when the username is `user@tenant`
    /// qualified or only one tenant is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Human-readable endpoint alias, for observability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// One static route pushed with an address lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub prefix: String,
    pub nexthop: String,
}

/// `login` / `ipaddr` response body: the address lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseReply {
    pub address: String,
    pub netmask: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteEntry>,
}

/// Error response body for any action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Try to pull an `error` field out of a response body.
///
/// Responses carry either the action's reply object or `{"error": ...}`;
/// clients use this to tell the two apart.
pub fn response_error(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorReply>(body).ok().map(|e| e.error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_optional_fields() {
        let req: LoginRequest = serde_json::from_str(r#"{"username":"u","password":"p"}"#).unwrap();
        assert_eq!(req.username, "u");
        assert!(req.network.is_none());

        let text = serde_json::to_string(&req).unwrap();
        assert!(!text.contains("network"));
    }

    #[test]
    fn test_lease_reply_roundtrip() {
        let reply = LeaseReply {
            address: "10.0.0.2".into(),
            netmask: "255.255.255.0".into(),
            routes: vec![RouteEntry {
                prefix: "192.168.10.0/24".into(),
                nexthop: "10.0.0.1".into(),
            }],
        };
        let text = serde_json::to_string(&reply).unwrap();
        let back: LeaseReply = serde_json::from_str(&text).unwrap();
        assert_eq!(back.address, "10.0.0.2");
        assert_eq!(back.routes, reply.routes);
    }

    #[test]
    fn test_response_error_detection() {
        assert_eq!(
            response_error(br#"{"error":"bad password"}"#).as_deref(),
            Some("bad password")
        );
        assert_eq!(response_error(br#"{"address":"10.0.0.2"}"#), None);
        assert_eq!(response_error(b"not json"), None);
    }
}
