use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
///
/// Callers are expected to move `Pending -> Running -> {Done, Error}`, but the
/// store accepts any transition; terminal states are terminal by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Done,
    Error,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Pending, Status::Running, Status::Done, Status::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Done => "done",
            Status::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&Status::Running).expect("serialize"),
            "\"running\""
        );
        let parsed: Status = serde_json::from_str("\"error\"").expect("deserialize");
        assert_eq!(parsed, Status::Error);
        assert!(serde_json::from_str::<Status>("\"finished\"").is_err());
    }

    #[test]
    fn parses_every_known_value() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>(), Ok(status));
        }
        assert!("RUNNING".parse::<Status>().is_err());
    }

    #[test]
    fn only_done_and_error_are_terminal() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Done.is_terminal());
        assert!(Status::Error.is_terminal());
        assert_eq!(Status::default(), Status::Pending);
    }
}
