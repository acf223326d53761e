//! Tool output envelope shared by the agent loop, the call tree and the
//! output targets.
//!
//! What the model sees:
//! - Success: the tool's `data`, serialized as-is.
//! - Failure: `{"error": "<message>", "code": "...", "details": "..."}` where
//!   `code` and `details` are omitted when absent.
//!
//! Files attached to a successful output are never serialized; the agent loop
//! forwards them to the job's output targets instead.

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

/// A file produced by a tool, delivered next to the conversation rather than
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutput {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl FileOutput {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Success {
        data: Value,
        /// Auxiliary files (not serialized).
        files: Vec<FileOutput>,
    },
    Failure {
        error: ToolError,
    },
}

/// Error details for failed tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolError {
    #[serde(rename = "error")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Optional context for the model (e.g. the list of valid tool names).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Serialize for ToolOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ToolOutput::Success { data, .. } => data.serialize(serializer),
            ToolOutput::Failure { error } => error.serialize(serializer),
        }
    }
}

impl ToolOutput {
    /// Creates a successful tool output.
    pub fn success(data: Value) -> Self {
        ToolOutput::Success {
            data,
            files: Vec::new(),
        }
    }

    /// Creates a successful tool output that also delivers files.
    pub fn success_with_files(data: Value, files: Vec<FileOutput>) -> Self {
        ToolOutput::Success { data, files }
    }

    /// Creates a failed tool output with a machine-readable code.
    pub fn failure(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        ToolOutput::Failure {
            error: ToolError {
                message: message.into(),
                code: Some(code.into()),
                details,
            },
        }
    }

    /// Convenience method equivalent to `failure(code, message, Some(details))`.
    pub fn failure_with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::failure(code, message, Some(details.into()))
    }

    /// Failure raised by a tool that broke its contract (returned `Err`).
    ///
    /// Serializes as a bare `{"error": "<message>"}`.
    pub fn error(message: impl Into<String>) -> Self {
        ToolOutput::Failure {
            error: ToolError {
                message: message.into(),
                code: None,
                details: None,
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { data, .. } => Some(data),
            ToolOutput::Failure { .. } => None,
        }
    }

    pub fn files(&self) -> &[FileOutput] {
        match self {
            ToolOutput::Success { files, .. } => files,
            ToolOutput::Failure { .. } => &[],
        }
    }

    /// Returns the error code (if any) and message if this is a failure.
    pub fn error_info(&self) -> Option<(Option<&str>, &str)> {
        match self {
            ToolOutput::Failure { error } => Some((error.code.as_deref(), error.message.as_str())),
            ToolOutput::Success { .. } => None,
        }
    }

    /// Takes the attached files out, leaving the data in place.
    pub fn take_files(&mut self) -> Vec<FileOutput> {
        match self {
            ToolOutput::Success { files, .. } => std::mem::take(files),
            ToolOutput::Failure { .. } => Vec::new(),
        }
    }

    /// JSON value stored on the call node.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"error": "unserializable tool output"}))
    }

    /// Converts the tool output to a JSON string for sending to the model.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":"Failed to serialize tool output","code":"serialize_error"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn success_serializes_data_verbatim() {
        let output = ToolOutput::success(json!({"sum": 5}));
        assert_eq!(output.to_json_string(), r#"{"sum":5}"#);
        assert!(output.is_ok());
    }

    #[test]
    fn thrown_error_serializes_as_bare_error_object() {
        let output = ToolOutput::error("rate limited");
        assert_eq!(output.to_json_string(), r#"{"error":"rate limited"}"#);
        assert_eq!(output.error_info(), Some((None, "rate limited")));
    }

    #[test]
    fn failure_keeps_code_and_details() {
        let output =
            ToolOutput::failure_with_details("unknown_tool", "Unknown tool: x", "Available: a");
        let value: Value = serde_json::from_str(&output.to_json_string()).unwrap();
        assert_eq!(
            value,
            json!({"error": "Unknown tool: x", "code": "unknown_tool", "details": "Available: a"})
        );
    }

    #[test]
    fn files_are_not_serialized() {
        let mut output = ToolOutput::success_with_files(
            json!({"written": true}),
            vec![FileOutput::new("a.txt", "text/plain", b"hi".to_vec())],
        );
        assert_eq!(output.to_json_string(), r#"{"written":true}"#);
        assert_eq!(output.take_files().len(), 1);
        assert!(output.files().is_empty());
    }
}
