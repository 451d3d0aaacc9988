//! Error taxonomy carried by task results.
//!
//! Lower layers return their own typed errors; the launcher maps them into
//! `TaskError` and decides which ones are fatal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category a scheduler uses to tell infrastructure failures from user-code failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Setup,
    UserCode,
    Transfer,
    ForkedProcess,
    Aborted,
    Notification,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum TaskError {
    /// Space resolution or credential decryption failed; no retry.
    #[error("Task setup failed: {message}")]
    Setup { message: String },

    /// Script or payload failure.
    #[error("{message}")]
    UserCode {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    #[error("Data transfer failed: {message}")]
    Transfer { message: String },

    /// Spawn failure, registration timeout or a dead child.
    #[error("Forked process error: {message}")]
    ForkedProcess { message: String },

    /// Killed explicitly or by the walltime timer.
    #[error("{}", aborted_message(.walltime))]
    Aborted { walltime: bool },

    #[error("Termination notification failed: {message}")]
    Notification { message: String },
}

fn aborted_message(walltime: &bool) -> &'static str {
    if *walltime {
        "Walltime exceeded, task aborted"
    } else {
        "Task aborted"
    }
}

impl TaskError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }

    pub fn user_code(message: impl Into<String>) -> Self {
        Self::UserCode {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
        }
    }

    pub fn forked(message: impl Into<String>) -> Self {
        Self::ForkedProcess {
            message: message.into(),
        }
    }

    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification {
            message: message.into(),
        }
    }

    pub fn aborted(walltime: bool) -> Self {
        Self::Aborted { walltime }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Setup { .. } => ErrorCategory::Setup,
            Self::UserCode { .. } => ErrorCategory::UserCode,
            Self::Transfer { .. } => ErrorCategory::Transfer,
            Self::ForkedProcess { .. } => ErrorCategory::ForkedProcess,
            Self::Aborted { .. } => ErrorCategory::Aborted,
            Self::Notification { .. } => ErrorCategory::Notification,
        }
    }

    /// Exit code of the failed process, when the failure came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::UserCode { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_match_variants() {
        assert_eq!(TaskError::setup("x").category(), ErrorCategory::Setup);
        assert_eq!(TaskError::forked("x").category(), ErrorCategory::ForkedProcess);
        assert_eq!(TaskError::aborted(true).category(), ErrorCategory::Aborted);
        assert_eq!(
            TaskError::notification("x").category(),
            ErrorCategory::Notification
        );
    }

    #[test]
    fn aborted_message_mentions_walltime() {
        assert_eq!(TaskError::aborted(false).to_string(), "Task aborted");
        assert!(TaskError::aborted(true).to_string().contains("Walltime"));
    }

    #[test]
    fn serialized_form_is_tagged_by_category() {
        let err = TaskError::UserCode {
            message: "boom".to_string(),
            exit_code: Some(2),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["category"], "user_code");
        assert_eq!(json["exit_code"], 2);
        let back: TaskError = serde_json::from_value(json).unwrap();
        assert_eq!(back.exit_code(), Some(2));
    }
}
