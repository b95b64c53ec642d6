//! Tagged outcomes for CSMS-initiated commands
//!
//! The wire responses carry a status enum plus optional fields whose
//! presence depends on the status. These types make the valid combinations
//! the only representable ones.

use serde::Serialize;

use crate::types::{
    ChangeAvailabilityResponse, ChangeAvailabilityStatus, RequestStartStopStatus,
    RequestStartTransactionResponse, RequestStopTransactionResponse, StatusInfo,
};

/// Reason used when a rejection carries no status info
const UNSPECIFIED: &str = "Unspecified";

fn reason_of(status_info: Option<StatusInfo>) -> String {
    status_info
        .map(|info| info.reason_code)
        .unwrap_or_else(|| UNSPECIFIED.to_string())
}

/// Result of RequestStartTransaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status")]
pub enum StartOutcome {
    Accepted { transaction_id: Option<String> },
    Rejected { reason: String },
}

impl StartOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        StartOutcome::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, StartOutcome::Accepted { .. })
    }
}

impl From<RequestStartTransactionResponse> for StartOutcome {
    fn from(response: RequestStartTransactionResponse) -> Self {
        match response.status {
            RequestStartStopStatus::Accepted => StartOutcome::Accepted {
                transaction_id: response.transaction_id,
            },
            RequestStartStopStatus::Rejected => StartOutcome::Rejected {
                reason: reason_of(response.status_info),
            },
        }
    }
}

impl From<StartOutcome> for RequestStartTransactionResponse {
    fn from(outcome: StartOutcome) -> Self {
        match outcome {
            StartOutcome::Accepted { transaction_id } => Self {
                status: RequestStartStopStatus::Accepted,
                transaction_id,
                status_info: None,
            },
            StartOutcome::Rejected { reason } => Self {
                status: RequestStartStopStatus::Rejected,
                transaction_id: None,
                status_info: Some(StatusInfo::reason(reason)),
            },
        }
    }
}

/// Result of RequestStopTransaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status")]
pub enum StopOutcome {
    Accepted,
    Rejected { reason: String },
}

impl StopOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        StopOutcome::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, StopOutcome::Accepted)
    }
}

impl From<RequestStopTransactionResponse> for StopOutcome {
    fn from(response: RequestStopTransactionResponse) -> Self {
        match response.status {
            RequestStartStopStatus::Accepted => StopOutcome::Accepted,
            RequestStartStopStatus::Rejected => StopOutcome::Rejected {
                reason: reason_of(response.status_info),
            },
        }
    }
}

impl From<StopOutcome> for RequestStopTransactionResponse {
    fn from(outcome: StopOutcome) -> Self {
        match outcome {
            StopOutcome::Accepted => Self {
                status: RequestStartStopStatus::Accepted,
                status_info: None,
            },
            StopOutcome::Rejected { reason } => Self {
                status: RequestStartStopStatus::Rejected,
                status_info: Some(StatusInfo::reason(reason)),
            },
        }
    }
}

/// Result of ChangeAvailability
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status")]
pub enum AvailabilityOutcome {
    Accepted,
    /// Takes effect once the running transaction ends
    Scheduled,
    Rejected { reason: String },
}

impl From<ChangeAvailabilityResponse> for AvailabilityOutcome {
    fn from(response: ChangeAvailabilityResponse) -> Self {
        match response.status {
            ChangeAvailabilityStatus::Accepted => AvailabilityOutcome::Accepted,
            ChangeAvailabilityStatus::Scheduled => AvailabilityOutcome::Scheduled,
            ChangeAvailabilityStatus::Rejected => AvailabilityOutcome::Rejected {
                reason: reason_of(response.status_info),
            },
        }
    }
}

impl From<AvailabilityOutcome> for ChangeAvailabilityResponse {
    fn from(outcome: AvailabilityOutcome) -> Self {
        match outcome {
            AvailabilityOutcome::Accepted => Self {
                status: ChangeAvailabilityStatus::Accepted,
                status_info: None,
            },
            AvailabilityOutcome::Scheduled => Self {
                status: ChangeAvailabilityStatus::Scheduled,
                status_info: None,
            },
            AvailabilityOutcome::Rejected { reason } => Self {
                status: ChangeAvailabilityStatus::Rejected,
                status_info: Some(StatusInfo::reason(reason)),
            },
        }
    }
}
