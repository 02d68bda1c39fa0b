//! Persisted status codes for queue entries, print jobs and in-flight commands.
//!
//! Each status serializes as its short upper-case code (`QUEUED`, `RUNNING`,
//! `TIMED_OUT`, ...). `code()` and `FromStr` give the same mapping for stores
//! that keep the code in a plain text column.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} status code: {code}")]
pub struct StatusCodeError {
    pub kind: &'static str,
    pub code: String,
}

macro_rules! status_codes {
    ($name:ident, $kind:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(self) -> &'static str {
                match self {
                    $($name::$variant => $code),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.code())
            }
        }

        impl FromStr for $name {
            type Err = StatusCodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($code => Ok($name::$variant),)+
                    other => Err(StatusCodeError { kind: $kind, code: other.to_string() }),
                }
            }
        }
    };
}

/// Lifecycle of a slicing queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

status_codes!(QueueStatus, "queue", {
    Queued => "QUEUED",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            QueueStatus::Queued | QueueStatus::Processing => false,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled => true,
        }
    }
}

/// Lifecycle of a print job on one printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

status_codes!(JobStatus, "job", {
    Created => "CREATED",
    Queued => "QUEUED",
    Running => "RUNNING",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            JobStatus::Created
            | JobStatus::Queued
            | JobStatus::Running
            | JobStatus::Paused => false,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => true,
        }
    }
}

/// Delivery state of a single command owned by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acked,
    TimedOut,
    Failed,
}

status_codes!(CommandStatus, "command", {
    Pending => "PENDING",
    Sent => "SENT",
    Acked => "ACKED",
    TimedOut => "TIMED_OUT",
    Failed => "FAILED",
});

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            CommandStatus::Pending | CommandStatus::Sent => false,
            CommandStatus::Acked | CommandStatus::TimedOut | CommandStatus::Failed => true,
        }
    }
}
