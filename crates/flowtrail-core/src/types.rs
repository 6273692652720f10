//! Closed enums shared by the entity model and the stores.
//!
//! Every enum has a stable small-integer code (what the stores persist) and a
//! lowercase string alias (what serde and the CLI use).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Flow execution status
///
/// `Running` is the only initial state and the only state with outgoing
/// transitions; the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Skipped,
}

impl FlowStatus {
    pub const ALL: [FlowStatus; 4] = [
        FlowStatus::Running,
        FlowStatus::Completed,
        FlowStatus::Failed,
        FlowStatus::Skipped,
    ];

    pub fn code(self) -> i64 {
        match self {
            FlowStatus::Running => 0,
            FlowStatus::Completed => 1,
            FlowStatus::Failed => 2,
            FlowStatus::Skipped => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Running => "running",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != FlowStatus::Running
    }
}

/// Log entry severity, ordered `Debug < Info < Warn < Error`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] =
        [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error];

    pub fn code(self) -> i64 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Category of a tracked process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Jobs,
    Services,
    Api,
    Other,
}

impl Category {
    pub const ALL: [Category; 4] =
        [Category::Jobs, Category::Services, Category::Api, Category::Other];

    pub fn code(self) -> i64 {
        match self {
            Category::Jobs => 0,
            Category::Services => 1,
            Category::Api => 2,
            Category::Other => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Jobs => "jobs",
            Category::Services => "services",
            Category::Api => "api",
            Category::Other => "other",
        }
    }
}

/// Per-flow item counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Counter {
    Ok,
    Ko,
    Skip,
}

impl Counter {
    pub fn as_str(self) -> &'static str {
        match self {
            Counter::Ok => "ok",
            Counter::Ko => "ko",
            Counter::Skip => "skip",
        }
    }
}

macro_rules! string_alias {
    ($ty:ident, $what:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                $ty::ALL
                    .into_iter()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| Error::validation(format!("unknown {}: {}", $what, s)))
            }
        }
    };
}

string_alias!(FlowStatus, "flow status");
string_alias!(LogLevel, "log level");
string_alias!(Category, "category");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(FlowStatus::Skipped.code(), 3);
        assert_eq!(LogLevel::Warn.code(), 2);
        assert_eq!(Category::Api.code(), 2);
        for status in FlowStatus::ALL {
            assert_eq!(FlowStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(LogLevel::from_code(9), None);
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn >= LogLevel::Warn);
        assert!(LogLevel::Error > LogLevel::Warn);
    }

    #[test]
    fn test_string_aliases() {
        assert_eq!("Failed".parse::<FlowStatus>().unwrap(), FlowStatus::Failed);
        assert_eq!("services".parse::<Category>().unwrap(), Category::Services);
        assert_eq!(LogLevel::Error.to_string(), "error");
        assert!("verbose".parse::<LogLevel>().unwrap_err().is_validation());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!FlowStatus::Running.is_terminal());
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Skipped.is_terminal());
    }
}
