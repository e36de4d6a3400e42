//! Result document model and the output validator.

use std::{fs, io, path::Path};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AttemptFailure;

pub const FALLBACK_ERROR_CODE: &str = "SCRIPT_EXECUTION_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// A parsed result document: the `status` plus every other top-level field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultDocument {
    pub status: Status,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResultDocument {
    /// The synthetic document written when every attempt failed.
    pub fn execution_failed(max_attempts: u32) -> Self {
        Self::error(format!(
            "Overlay network script failed after {} attempts",
            max_attempts
        ))
    }

    /// An error document carrying the standard failure code.
    pub fn error(message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("message".into(), Value::from(message.into()));
        fields.insert("error_code".into(), Value::from(FALLBACK_ERROR_CODE));
        Self {
            status: Status::Error,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// A string field with surrounding whitespace removed; `None` when absent,
    /// empty, or not a string.
    pub fn non_empty_str(&self, name: &str) -> Option<&str> {
        self.field(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Run the checks in order and stop at the first failure:
/// file exists, JSON object, required keys present, `status == "success"`.
pub fn validate_output(
    path: &Path,
    required: &IndexSet<String>,
) -> Result<ResultDocument, AttemptFailure> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AttemptFailure::OutputMissing {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(AttemptFailure::OutputNotJson {
                message: format!("unreadable: {}", e),
            })
        }
    };

    let mut object = parse_object(&text)?;

    for name in required {
        if !object.contains_key(name) {
            return Err(AttemptFailure::MissingRequiredField { name: name.clone() });
        }
    }

    let status = match object.remove("status") {
        Some(Value::String(s)) if s == "success" => Status::Success,
        Some(other) => {
            return Err(AttemptFailure::StatusNotSuccess {
                status: other.to_string(),
            })
        }
        None => {
            return Err(AttemptFailure::MissingRequiredField {
                name: "status".to_string(),
            })
        }
    };

    Ok(ResultDocument {
        status,
        fields: object,
    })
}

/// True when `path` holds a JSON object. The fallback reporter uses this to
/// decide whether a leftover document is a script's own report.
pub fn is_json_document(path: &Path) -> bool {
    fs::read_to_string(path)
        .ok()
        .map(|text| parse_object(&text).is_ok())
        .unwrap_or(false)
}

fn parse_object(text: &str) -> Result<Map<String, Value>, AttemptFailure> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(AttemptFailure::OutputNotJson {
            message: format!("expected an object, found {}", json_kind(&other)),
        }),
        Err(e) => Err(AttemptFailure::OutputNotJson {
            message: e.to_string(),
        }),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
