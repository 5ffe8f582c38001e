// Stratum JSON-RPC messages exchanged with miners and the node
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code the node uses for a rejected login
pub const LOGIN_ERROR_CODE: i64 = -32500;

/// Exact reply sent to a miner whose password does not match
const LOGIN_ERROR_REPLY: &str =
    r#"{"id":"5","jsonrpc":"2.0","method":"login","error":{"code":-32500,"message":"login incorrect"}}"#;

/// Request sent by a miner, or injected by the relay towards the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub jsonrpc: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Response or notification pushed by the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumResponse {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub jsonrpc: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub method: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Map<String, Value>>,
}

/// String, number or null id; numbers keep their textual form, null becomes empty
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!("invalid id: {}", other))),
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl StratumRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Parse a frame read from the wire
    pub fn from_slice(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| Error::Protocol(format!("Failed to parse request: {}", e)))
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn is_login(&self) -> bool {
        self.method == "login"
    }
}

impl StratumResponse {
    pub fn from_slice(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| Error::Protocol(format!("Failed to parse response: {}", e)))
    }
}

/// Raw `login` parameters as the miner sent them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoginParams {
    pub login: String,
    pub pass: String,
    pub agent: String,
}

impl LoginParams {
    /// Extract the known login fields. Missing or non-string values read as empty.
    pub fn from_params(params: Option<&Value>) -> Self {
        let field = |name: &str| {
            params
                .and_then(|p| p.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Self {
            login: field("login"),
            pass: field("pass"),
            agent: field("agent"),
        }
    }

    /// Trim every field and substitute a generated agent name when none was given
    pub fn normalize(&self) -> LoginCredentials {
        let agent = self.agent.trim();
        LoginCredentials {
            login: self.login.trim().to_string(),
            pass: self.pass.trim().to_string(),
            agent: if agent.is_empty() {
                placeholder_agent()
            } else {
                agent.to_string()
            },
        }
    }
}

/// Login fields after trimming, ready for verification
#[derive(Clone, PartialEq)]
pub struct LoginCredentials {
    pub login: String,
    pub pass: String,
    pub agent: String,
}

impl std::fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("login", &self.login)
            .field("pass", &"[REDACTED]")
            .field("agent", &self.agent)
            .finish()
    }
}

fn placeholder_agent() -> String {
    format!("NoNameMiner{}", rand::random::<u64>() >> 1)
}

/// Bytes of the error reply for a wrong password
pub fn login_error_reply() -> Bytes {
    Bytes::from_static(LOGIN_ERROR_REPLY.as_bytes())
}

/// Zero-parameter status poll injected towards the node
pub fn status_request() -> Result<Bytes> {
    StratumRequest::new("0", "status", None).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_request_parsing() {
        let frame = br#"{"id":"1","jsonrpc":"2.0","method":"submit","params":{"nonce":42,"job_id":7}}"#;
        let req = StratumRequest::from_slice(frame).unwrap();
        assert_eq!(req.id, "1");
        assert_eq!(req.method, "submit");
        assert_eq!(req.params, Some(json!({"nonce": 42, "job_id": 7})));
        assert!(!req.is_login());
    }

    #[test]
    fn test_numeric_and_missing_ids() {
        let req = StratumRequest::from_slice(br#"{"id":12,"method":"getjobtemplate"}"#).unwrap();
        assert_eq!(req.id, "12");
        let req = StratumRequest::from_slice(br#"{"method":"keepalive"}"#).unwrap();
        assert_eq!(req.id, "");
    }

    #[test]
    fn test_null_jsonrpc_and_method_read_as_empty() {
        let req = StratumRequest::from_slice(br#"{"id":"2","jsonrpc":null,"method":"getjobtemplate","params":null}"#).unwrap();
        assert_eq!(req.jsonrpc, "");
        assert_eq!(req.method, "getjobtemplate");
        assert_eq!(req.params, None);

        let req = StratumRequest::from_slice(br#"{"id":"3","method":null}"#).unwrap();
        assert_eq!(req.method, "");

        let res = StratumResponse::from_slice(br#"{"id":"4","jsonrpc":null,"method":null,"result":true}"#).unwrap();
        assert_eq!(res.method, "");
        assert_eq!(res.jsonrpc, "");
    }

    #[test]
    fn test_malformed_requests_rejected() {
        assert!(StratumRequest::from_slice(b"[1,2,3]").is_err());
        assert!(StratumRequest::from_slice(br#"{"id":{"nested":true},"method":"login"}"#).is_err());
        assert!(StratumRequest::from_slice(br#"{"id":"1","method":5}"#).is_err());
    }

    #[test]
    fn test_response_parsing() {
        let frame = br#"{"id":"3","jsonrpc":"2.0","method":"submit","result":null,"error":{"code":-32502,"message":"Failed to validate solution"}}"#;
        let res = StratumResponse::from_slice(frame).unwrap();
        assert_eq!(res.method, "submit");
        assert_eq!(res.result, None);
        assert_eq!(res.error.unwrap()["code"], json!(-32502));

        let res = StratumResponse::from_slice(br#"{"id":"0","method":"status","result":{"height":1}}"#).unwrap();
        assert_eq!(res.error, None);
    }

    #[test]
    fn test_login_params_trimmed() {
        let params = json!({"login": " alice ", "pass": "\tp\n", "agent": " rig-01 ", "extra": 1});
        let creds = LoginParams::from_params(Some(&params)).normalize();
        assert_eq!(creds.login, "alice");
        assert_eq!(creds.pass, "p");
        assert_eq!(creds.agent, "rig-01");
    }

    #[test]
    fn test_login_params_missing_or_wrong_type() {
        let params = json!({"login": 7, "pass": null});
        let raw = LoginParams::from_params(Some(&params));
        assert_eq!(raw, LoginParams::default());
        assert_eq!(LoginParams::from_params(None), LoginParams::default());
    }

    #[test]
    fn test_blank_agent_gets_unique_placeholder() {
        let params = json!({"login": "alice", "pass": "p", "agent": "   "});
        let raw = LoginParams::from_params(Some(&params));

        let agents: HashSet<String> = (0..64).map(|_| raw.normalize().agent).collect();
        assert_eq!(agents.len(), 64);
        assert!(agents.iter().all(|a| a.starts_with("NoNameMiner") && a.len() > "NoNameMiner".len()));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = LoginParams {
            login: "alice".to_string(),
            pass: "hunter2".to_string(),
            agent: "rig".to_string(),
        }
        .normalize();
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_login_error_reply_shape() {
        let reply: Value = serde_json::from_slice(&login_error_reply()).unwrap();
        assert_eq!(
            reply,
            json!({"id":"5","jsonrpc":"2.0","method":"login","error":{"code":LOGIN_ERROR_CODE,"message":"login incorrect"}})
        );
    }

    #[test]
    fn test_status_request_shape() {
        let bytes = status_request().unwrap();
        assert_eq!(&bytes[..], br#"{"id":"0","jsonrpc":"2.0","method":"status","params":null}"#);
    }
}
