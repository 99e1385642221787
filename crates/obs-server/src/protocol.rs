//! Wire format.
//!
//! One request and one response per connection, each a single line of JSON:
//!
//! ```text
//! -> {"id": 7, "method": "open_dome", "params": {"side": "a_side", "frac": 0.5}}
//! <- {"id": 7, "result": "Opening dome (a_side 0.5)"}
//! <- {"id": 7, "error": {"kind": "hardware_status", "message": "Dome is in lockdown"}}
//! ```
//!
//! The error `kind` is the stable [`ErrorKind`] label, so the client rebuilds the same
//! [`ObsError`] variant the daemon raised.

use obs_core::{ErrorKind, ObsError, ObsResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Longest request or response line accepted.
pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> ObsResult<String> {
        encode_line(self)
    }

    pub fn decode(line: &str) -> ObsResult<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| ObsError::InvalidArgument(format!("Malformed request: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ObsError> for RpcError {
    fn from(err: &ObsError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message(),
        }
    }
}

impl From<RpcError> for ObsError {
    fn from(err: RpcError) -> Self {
        ObsError::from_kind(err.kind, err.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn from_result(id: u64, result: ObsResult<Value>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                id,
                result: None,
                error: Some(RpcError::from(&err)),
            },
        }
    }

    /// The call's outcome. A response with neither field is a successful `null`.
    pub fn into_result(self) -> ObsResult<Value> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    pub fn encode(&self) -> ObsResult<String> {
        encode_line(self)
    }

    pub fn decode(line: &str) -> ObsResult<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| ObsError::Rpc(format!("Malformed response: {}", e)))
    }
}

fn encode_line<T: Serialize>(message: &T) -> ObsResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Named call parameters.
///
/// `null` and a missing `params` both read as an empty object.
#[derive(Debug, Clone, Default)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn from_value(value: Value) -> ObsResult<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Ok(Self(map)),
            other => Err(ObsError::InvalidArgument(format!(
                "Parameters must be an object, got {}",
                other
            ))),
        }
    }

    /// A required parameter.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> ObsResult<T> {
        self.opt(name)?
            .ok_or_else(|| ObsError::InvalidArgument(format!("Missing parameter '{}'", name)))
    }

    /// An optional parameter. `null` counts as absent.
    pub fn opt<T: DeserializeOwned>(&self, name: &str) -> ObsResult<Option<T>> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                ObsError::InvalidArgument(format!("Invalid parameter '{}': {}", name, e))
            }),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> ObsResult<T> {
        Ok(self.opt(name)?.unwrap_or(default))
    }

    /// An `"on"`/`"off"` switch.
    pub fn switch(&self, name: &str) -> ObsResult<bool> {
        match self.get::<String>(name)?.as_str() {
            "on" => Ok(true),
            "off" => Ok(false),
            _ => Err(ObsError::InvalidArgument(
                "Command must be 'on' or 'off'".to_string(),
            )),
        }
    }

    /// The whole parameter object as one struct.
    pub fn parse<T: DeserializeOwned>(&self) -> ObsResult<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| ObsError::InvalidArgument(format!("Invalid parameters: {}", e)))
    }
}
