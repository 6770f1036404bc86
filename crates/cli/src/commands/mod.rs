pub mod config;
pub mod doctor;
pub mod key;
pub mod migrate;
pub mod policy;
pub mod reconcile;
pub mod run;
pub mod team;

mod session;

use runwarden_core::errors::{ApplicationError, InterfaceError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data: None,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    /// Success carrying a JSON rendering of `data`.
    pub fn success_with(command: &str, message: impl Into<String>, data: &impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => {
                let payload = CommandOutcome {
                    command: command.to_string(),
                    status: "ok".to_string(),
                    error_class: None,
                    message: message.into(),
                    data: Some(data),
                };
                Self { exit_code: 0, output: serialize_payload(payload) }
            }
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    /// Governance failures keep their interface class; the message stays
    /// detailed because the operator is the caller.
    pub fn from_application(command: &str, error: ApplicationError) -> Self {
        let message = error.to_string();
        let (error_class, exit_code) = match InterfaceError::from(error) {
            InterfaceError::BadRequest { .. } => ("invalid_input", 6),
            InterfaceError::Unauthorized { .. } => ("unauthorized", 6),
            InterfaceError::NotFound { .. } => ("not_found", 6),
            InterfaceError::Conflict { .. } => ("conflict", 6),
            InterfaceError::ServiceUnavailable { .. } => ("persistence", 7),
            InterfaceError::Internal { .. } => ("internal", 1),
        };
        Self::failure(command, error_class, message, exit_code)
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
