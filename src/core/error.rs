use serde::{Deserialize, Serialize};

/// Error codes carried on the wire inside a failed response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    HandleNotFound,
    DeviceNotAvailable,
    DeviceBusy,
    CardNotPresent,
    TransmissionFailed,
    ConnectionClosed,
    Timeout,
    InvalidRequest,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::HandleNotFound => "HandleNotFound",
            ErrorCode::DeviceNotAvailable => "DeviceNotAvailable",
            ErrorCode::DeviceBusy => "DeviceBusy",
            ErrorCode::CardNotPresent => "CardNotPresent",
            ErrorCode::TransmissionFailed => "TransmissionFailed",
            ErrorCode::ConnectionClosed => "ConnectionClosed",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::InternalError => "InternalError",
        }
    }
}

impl From<String> for ErrorCode {
    /// Codes this build does not know about degrade to `InternalError`.
    fn from(code: String) -> Self {
        match code.as_str() {
            "HandleNotFound" => ErrorCode::HandleNotFound,
            "DeviceNotAvailable" => ErrorCode::DeviceNotAvailable,
            "DeviceBusy" => ErrorCode::DeviceBusy,
            "CardNotPresent" => ErrorCode::CardNotPresent,
            "TransmissionFailed" => ErrorCode::TransmissionFailed,
            "ConnectionClosed" => ErrorCode::ConnectionClosed,
            "Timeout" => ErrorCode::Timeout,
            "InvalidRequest" => ErrorCode::InvalidRequest,
            _ => ErrorCode::InternalError,
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error object of a failed response: `{code, message, data?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Domain errors surfaced by the bridge, identical on both sides of the wire
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Handle not found: {0}")]
    HandleNotFound(String),

    #[error("Device not available: {0}")]
    DeviceNotAvailable(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Card not present: {0}")]
    CardNotPresent(String),

    #[error("Transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn connection_closed() -> Self {
        BridgeError::ConnectionClosed("transport closed".to_string())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::HandleNotFound(_) => ErrorCode::HandleNotFound,
            BridgeError::DeviceNotAvailable(_) => ErrorCode::DeviceNotAvailable,
            BridgeError::DeviceBusy(_) => ErrorCode::DeviceBusy,
            BridgeError::CardNotPresent(_) => ErrorCode::CardNotPresent,
            BridgeError::TransmissionFailed(_) => ErrorCode::TransmissionFailed,
            BridgeError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
            BridgeError::Timeout(_) => ErrorCode::Timeout,
            BridgeError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            BridgeError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Detail text without the kind prefix added by `Display`
    pub fn message(&self) -> &str {
        match self {
            BridgeError::HandleNotFound(m)
            | BridgeError::DeviceNotAvailable(m)
            | BridgeError::DeviceBusy(m)
            | BridgeError::CardNotPresent(m)
            | BridgeError::TransmissionFailed(m)
            | BridgeError::ConnectionClosed(m)
            | BridgeError::Timeout(m)
            | BridgeError::InvalidRequest(m)
            | BridgeError::Internal(m) => m,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        RpcError::new(self.code(), self.message())
    }

    pub fn from_rpc(error: RpcError) -> Self {
        let message = error.message;
        match error.code {
            ErrorCode::HandleNotFound => BridgeError::HandleNotFound(message),
            ErrorCode::DeviceNotAvailable => BridgeError::DeviceNotAvailable(message),
            ErrorCode::DeviceBusy => BridgeError::DeviceBusy(message),
            ErrorCode::CardNotPresent => BridgeError::CardNotPresent(message),
            ErrorCode::TransmissionFailed => BridgeError::TransmissionFailed(message),
            ErrorCode::ConnectionClosed => BridgeError::ConnectionClosed(message),
            ErrorCode::Timeout => BridgeError::Timeout(message),
            ErrorCode::InvalidRequest => BridgeError::InvalidRequest(message),
            ErrorCode::InternalError => BridgeError::Internal(message),
        }
    }
}

impl From<RpcError> for BridgeError {
    fn from(error: RpcError) -> Self {
        BridgeError::from_rpc(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_strings() {
        let json = serde_json::to_string(&ErrorCode::HandleNotFound).unwrap();
        assert_eq!(json, "\"HandleNotFound\"");

        let code: ErrorCode = serde_json::from_str("\"CardNotPresent\"").unwrap();
        assert_eq!(code, ErrorCode::CardNotPresent);
    }

    #[test]
    fn test_unknown_code_degrades_to_internal() {
        let code: ErrorCode = serde_json::from_str("\"SomethingNew\"").unwrap();
        assert_eq!(code, ErrorCode::InternalError);
    }

    #[test]
    fn test_rpc_mapping_preserves_kind_and_message() {
        let errors = vec![
            BridgeError::HandleNotFound("h:7".to_string()),
            BridgeError::DeviceNotAvailable("r0".to_string()),
            BridgeError::DeviceBusy("r0".to_string()),
            BridgeError::CardNotPresent("r0".to_string()),
            BridgeError::TransmissionFailed("parity".to_string()),
            BridgeError::connection_closed(),
            BridgeError::Timeout("500ms".to_string()),
            BridgeError::InvalidRequest("bad".to_string()),
            BridgeError::Internal("boom".to_string()),
        ];

        for error in errors {
            let rpc = error.to_rpc();
            assert_eq!(rpc.code, error.code());
            assert_eq!(BridgeError::from_rpc(rpc), error);
        }
    }

    #[test]
    fn test_rpc_error_serialization() {
        let rpc = RpcError::new(ErrorCode::Timeout, "no card")
            .with_data(serde_json::json!({ "waitedMs": 250 }));
        let json = serde_json::to_string(&rpc).unwrap();
        assert!(json.contains("\"code\":\"Timeout\""));
        assert!(json.contains("waitedMs"));

        let plain = serde_json::to_string(&RpcError::new(ErrorCode::Timeout, "x")).unwrap();
        assert!(!plain.contains("data"));
    }

    #[test]
    fn test_display_includes_detail() {
        let error = BridgeError::CardNotPresent("Mock Reader 2".to_string());
        assert_eq!(error.to_string(), "Card not present: Mock Reader 2");
        assert_eq!(error.message(), "Mock Reader 2");
    }
}
