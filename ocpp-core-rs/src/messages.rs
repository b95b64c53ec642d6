//! OCPP 2.0.1 JSON-RPC message framing
//!
//! OCPP-J frames every message as a JSON array:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding never panics on peer input. A frame that cannot be decoded
//! produces a [`CodecError`] which carries the message id when it could be
//! recovered, so the receiver can answer with a `FormatViolation` CALLERROR
//! and keep the connection open.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message id used in a CALLERROR when the offending frame's id is unknown
pub const UNKNOWN_MESSAGE_ID: &str = "-1";

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_i64(value: i64) -> Option<Self> {
        match value {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Parse a wire error code, falling back to `GenericError`
    pub fn parse_lenient(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

macro_rules! actions {
    ($($name:ident),* $(,)?) => {
        /// OCPP 2.0.1 action names
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Action {
            $($name,)*
        }

        impl Action {
            /// Every action defined by OCPP 2.0.1
            pub const ALL: &'static [Action] = &[$(Action::$name,)*];

            /// Wire name of the action
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Action::$name => stringify!($name),)*
                }
            }
        }

        impl FromStr for Action {
            type Err = UnknownAction;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($name) => Ok(Action::$name),)*
                    _ => Err(UnknownAction(s.to_string())),
                }
            }
        }
    };
}

actions! {
    Authorize,
    BootNotification,
    CancelReservation,
    CertificateSigned,
    ChangeAvailability,
    ClearCache,
    ClearChargingProfile,
    ClearDisplayMessage,
    ClearedChargingLimit,
    ClearVariableMonitoring,
    CostUpdated,
    CustomerInformation,
    DataTransfer,
    DeleteCertificate,
    FirmwareStatusNotification,
    Get15118EVCertificate,
    GetBaseReport,
    GetCertificateStatus,
    GetChargingProfiles,
    GetCompositeSchedule,
    GetDisplayMessages,
    GetInstalledCertificateIds,
    GetLocalListVersion,
    GetLog,
    GetMonitoringReport,
    GetReport,
    GetTransactionStatus,
    GetVariables,
    Heartbeat,
    InstallCertificate,
    LogStatusNotification,
    MeterValues,
    NotifyChargingLimit,
    NotifyCustomerInformation,
    NotifyDisplayMessages,
    NotifyEVChargingNeeds,
    NotifyEVChargingSchedule,
    NotifyEvent,
    NotifyMonitoringReport,
    NotifyReport,
    PublishFirmware,
    PublishFirmwareStatusNotification,
    ReportChargingProfiles,
    RequestStartTransaction,
    RequestStopTransaction,
    ReservationStatusUpdate,
    ReserveNow,
    Reset,
    SecurityEventNotification,
    SendLocalList,
    SetChargingProfile,
    SetDisplayMessage,
    SetMonitoringBase,
    SetMonitoringLevel,
    SetNetworkProfile,
    SetVariableMonitoring,
    SetVariables,
    SignCertificate,
    StatusNotification,
    TransactionEvent,
    TriggerMessage,
    UnlockConnector,
    UnpublishFirmware,
    UpdateFirmware,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Action name that is not part of OCPP 2.0.1
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

/// Errors decoding an OCPP-J frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("format violation: {reason}")]
    FormatViolation {
        /// Id of the offending frame, when it could be recovered
        message_id: Option<String>,
        reason: String,
    },
}

impl CodecError {
    fn violation(message_id: Option<String>, reason: impl Into<String>) -> Self {
        CodecError::FormatViolation {
            message_id,
            reason: reason.into(),
        }
    }

    /// Recovered message id of the offending frame
    pub fn message_id(&self) -> Option<&str> {
        match self {
            CodecError::FormatViolation { message_id, .. } => message_id.as_deref(),
        }
    }

    /// CALLERROR to send back to the peer for this failure
    pub fn to_call_error(&self) -> CallError {
        let id = self.message_id().unwrap_or(UNKNOWN_MESSAGE_ID).to_string();
        match self {
            CodecError::FormatViolation { reason, .. } => {
                CallError::new(id, ErrorCode::FormatViolation, reason.clone())
            }
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    pub fn new(message_id: impl Into<String>, action: Action, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action,
            payload,
        }
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Decode an OCPP message from a JSON frame
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::violation(None, format!("invalid JSON: {}", e)))?;

        let array = match value {
            Value::Array(array) => array,
            _ => return Err(CodecError::violation(None, "frame is not a JSON array")),
        };

        let message_id = array.get(1).and_then(Value::as_str).map(str::to_string);

        if !(3..=5).contains(&array.len()) {
            return Err(CodecError::violation(
                message_id,
                format!("frame has {} elements", array.len()),
            ));
        }

        let message_type = array[0]
            .as_i64()
            .and_then(MessageType::from_i64)
            .ok_or_else(|| {
                CodecError::violation(message_id.clone(), format!("unknown message type {}", array[0]))
            })?;

        let message_id = message_id
            .ok_or_else(|| CodecError::violation(None, "message id is not a string"))?;

        let mut array = array;
        match message_type {
            MessageType::Call => {
                if array.len() != 4 {
                    return Err(CodecError::violation(Some(message_id), "CALL must have 4 elements"));
                }
                let action = array[2]
                    .as_str()
                    .ok_or_else(|| CodecError::violation(Some(message_id.clone()), "action is not a string"))?
                    .parse::<Action>()
                    .map_err(|e| CodecError::violation(Some(message_id.clone()), e.to_string()))?;
                let payload = take_object(&mut array, 3, &message_id)?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            MessageType::CallResult => {
                if array.len() != 3 {
                    return Err(CodecError::violation(
                        Some(message_id),
                        "CALLRESULT must have 3 elements",
                    ));
                }
                let payload = take_object(&mut array, 2, &message_id)?;

                Ok(OcppMessage::CallResult(CallResult { message_id, payload }))
            }
            MessageType::CallError => {
                if array.len() < 4 {
                    return Err(CodecError::violation(
                        Some(message_id),
                        "CALLERROR must have 5 elements",
                    ));
                }
                let error_code = array[2]
                    .as_str()
                    .map(ErrorCode::parse_lenient)
                    .ok_or_else(|| CodecError::violation(Some(message_id.clone()), "error code is not a string"))?;
                let error_description = array[3].as_str().unwrap_or_default().to_string();
                let error_details = array
                    .get_mut(4)
                    .map(Value::take)
                    .unwrap_or_else(|| Value::Object(Map::new()));

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
        }
    }

    /// Encode to the OCPP-J wire format
    pub fn encode(&self) -> String {
        let array = match self {
            OcppMessage::Call(c) => serde_json::json!([
                MessageType::Call as i32,
                &c.message_id,
                c.action.as_str(),
                &c.payload
            ]),
            OcppMessage::CallResult(r) => serde_json::json!([
                MessageType::CallResult as i32,
                &r.message_id,
                &r.payload
            ]),
            OcppMessage::CallError(e) => serde_json::json!([
                MessageType::CallError as i32,
                &e.message_id,
                e.error_code.to_string(),
                &e.error_description,
                &e.error_details
            ]),
        };
        array.to_string()
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }
}

impl From<Call> for OcppMessage {
    fn from(call: Call) -> Self {
        OcppMessage::Call(call)
    }
}

impl From<CallResult> for OcppMessage {
    fn from(result: CallResult) -> Self {
        OcppMessage::CallResult(result)
    }
}

impl From<CallError> for OcppMessage {
    fn from(error: CallError) -> Self {
        OcppMessage::CallError(error)
    }
}

fn take_object(array: &mut [Value], index: usize, message_id: &str) -> Result<Value, CodecError> {
    match array[index].take() {
        payload @ Value::Object(_) => Ok(payload),
        _ => Err(CodecError::violation(
            Some(message_id.to_string()),
            "payload is not a JSON object",
        )),
    }
}
