//! Wire message shapes.
//!
//! Every message is one JSON object tagged by `type`:
//!
//! ```text
//! {"type":"request","id":7,"target":3,"method":"card.transmit","args":[{"kind":"bytes","value":[0,164,4,0]}]}
//! {"type":"response","id":7,"result":{"kind":"bytes","value":[144,0]}}
//! {"type":"event","source":2,"name":"card-removed","payload":{"kind":"text","value":"r0"}}
//! ```
//!
//! Dispatch uses the flat `scope.method` string on the wire. [`Method`] is the
//! typed view of that table; unknown strings are rejected by the server with
//! `InvalidRequest` rather than at decode time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::apdu::{CommandApdu, ResponseApdu};
use crate::core::error::{BridgeError, Result, RpcError};
use crate::core::platform::DeviceDescriptor;

/// Correlation id of a call, unique per client connection
pub type CallId = u64;

/// Opaque reference to a stateful server-side object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h:{}", self.0)
    }
}

/// Argument and result values
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(u64),
    Text(String),
    Bytes(Vec<u8>),
    Handle(HandleId),
    CommandApdu(CommandApdu),
    ResponseApdu(ResponseApdu),
    Device(DeviceDescriptor),
    Devices(Vec<DeviceDescriptor>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Handle(_) => "handle",
            Value::CommandApdu(_) => "commandApdu",
            Value::ResponseApdu(_) => "responseApdu",
            Value::Device(_) => "device",
            Value::Devices(_) => "devices",
        }
    }

    fn mismatch(self, expected: &str) -> BridgeError {
        BridgeError::Internal(format!("Expected {expected} result, got {}", self.kind()))
    }

    pub fn into_unit(self) -> Result<()> {
        match self {
            Value::Null => Ok(()),
            other => Err(other.mismatch("null")),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(other.mismatch("bytes")),
        }
    }

    pub fn into_handle(self) -> Result<HandleId> {
        match self {
            Value::Handle(handle) => Ok(handle),
            other => Err(other.mismatch("handle")),
        }
    }

    pub fn into_response_apdu(self) -> Result<ResponseApdu> {
        match self {
            Value::ResponseApdu(response) => Ok(response),
            other => Err(other.mismatch("responseApdu")),
        }
    }

    pub fn into_devices(self) -> Result<Vec<DeviceDescriptor>> {
        match self {
            Value::Devices(devices) => Ok(devices),
            other => Err(other.mismatch("devices")),
        }
    }
}

/// Which kind of object a method is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The connection's single platform; no target handle
    Platform,
    Device,
    Card,
}

/// Every method the bridge dispatches, with its fixed wire string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    PlatformInit,
    PlatformGetDeviceInfo,
    PlatformAcquireDevice,
    DeviceIsDeviceAvailable,
    DeviceIsCardPresent,
    DeviceStartSession,
    DeviceWaitForCardPresence,
    DeviceRelease,
    CardGetAtr,
    CardTransmit,
    CardReset,
    CardRelease,
}

impl Method {
    pub const ALL: [Method; 12] = [
        Method::PlatformInit,
        Method::PlatformGetDeviceInfo,
        Method::PlatformAcquireDevice,
        Method::DeviceIsDeviceAvailable,
        Method::DeviceIsCardPresent,
        Method::DeviceStartSession,
        Method::DeviceWaitForCardPresence,
        Method::DeviceRelease,
        Method::CardGetAtr,
        Method::CardTransmit,
        Method::CardReset,
        Method::CardRelease,
    ];

    pub fn scope(&self) -> Scope {
        match self {
            Method::PlatformInit | Method::PlatformGetDeviceInfo | Method::PlatformAcquireDevice => {
                Scope::Platform
            }
            Method::DeviceIsDeviceAvailable
            | Method::DeviceIsCardPresent
            | Method::DeviceStartSession
            | Method::DeviceWaitForCardPresence
            | Method::DeviceRelease => Scope::Device,
            Method::CardGetAtr | Method::CardTransmit | Method::CardReset | Method::CardRelease => {
                Scope::Card
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::PlatformInit => "platform.init",
            Method::PlatformGetDeviceInfo => "platform.getDeviceInfo",
            Method::PlatformAcquireDevice => "platform.acquireDevice",
            Method::DeviceIsDeviceAvailable => "device.isDeviceAvailable",
            Method::DeviceIsCardPresent => "device.isCardPresent",
            Method::DeviceStartSession => "device.startSession",
            Method::DeviceWaitForCardPresence => "device.waitForCardPresence",
            Method::DeviceRelease => "device.release",
            Method::CardGetAtr => "card.getAtr",
            Method::CardTransmit => "card.transmit",
            Method::CardReset => "card.reset",
            Method::CardRelease => "card.release",
        }
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| BridgeError::InvalidRequest(format!("Unknown method: {s}")))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<HandleId>,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(id: CallId, target: Option<HandleId>, method: Method, args: Vec<Value>) -> Self {
        Self {
            id,
            target,
            method: method.as_str().to_string(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: CallId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: CallId, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// An error field always wins over a result field.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(BridgeError::from_rpc(error)),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Handle the event concerns; absent for platform-level events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<HandleId>,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Envelope {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| BridgeError::Internal(format!("Failed to encode envelope: {e}")))
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::InvalidRequest(format!("Failed to decode envelope: {e}")))
    }
}
