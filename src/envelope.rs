//! Standardized task result envelope
//!
//! Every task result, successful or not, is normalized into a single shape:
//! `{success, result, error, error_code, error_details, status}`. Executors
//! that already emit this shape have it adopted as-is; anything else is
//! wrapped as a successful result.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::WeftError;

/// Human-readable status label, redundant with `success` by design
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Completed,
    Failed,
    Skipped,
    Warning,
}

impl EnvelopeStatus {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EnvelopeStatus::Completed => "completed",
            EnvelopeStatus::Failed => "failed",
            EnvelopeStatus::Skipped => "skipped",
            EnvelopeStatus::Warning => "warning",
        };
        write!(f, "{}", label)
    }
}

/// The canonical result envelope stored as a task's write-once `output_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    pub status: EnvelopeStatus,
}

impl TaskEnvelope {
    pub fn completed(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            error_code: None,
            error_details: None,
            status: EnvelopeStatus::Completed,
        }
    }

    pub fn failed(error: &WeftError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
            error_code: Some(error.code().to_string()),
            error_details: None,
            status: EnvelopeStatus::Failed,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            success: false,
            result: None,
            error: None,
            error_code: None,
            error_details: Some(json!({ "reason": reason })),
            status: EnvelopeStatus::Skipped,
        }
    }

    /// Merge extra details into `error_details` (object-merge, last wins)
    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = Some(match (self.error_details.take(), details) {
            (Some(Value::Object(mut existing)), Value::Object(new)) => {
                existing.extend(new);
                Value::Object(existing)
            }
            (_, new) => new,
        });
        self
    }

    /// Normalize a raw executor value into the envelope
    ///
    /// Objects carrying a boolean `success` key are adopted field-by-field;
    /// any other value becomes the `result` of a successful envelope.
    pub fn from_raw(value: Value) -> Self {
        if let Value::Object(map) = &value {
            if let Some(Value::Bool(success)) = map.get("success") {
                let success = *success;
                let status = map
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(EnvelopeStatus::from_label)
                    .unwrap_or(if success {
                        EnvelopeStatus::Completed
                    } else {
                        EnvelopeStatus::Failed
                    });
                return Self {
                    success,
                    result: map.get("result").cloned(),
                    error: map
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    error_code: map
                        .get("error_code")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    error_details: map.get("error_details").cloned(),
                    status,
                };
            }
        }
        Self::completed(value)
    }

    /// Envelope as a JSON value (for the resolution context)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Entry for the `error.<task_id>` namespace
    pub fn error_entry(&self) -> Value {
        json!({
            "message": self.error.clone().unwrap_or_default(),
            "code": self.error_code,
            "details": self.error_details,
        })
    }
}
