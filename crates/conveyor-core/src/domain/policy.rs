//! Job-level failure policy.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// What happens to the rest of a run when one task fails.
///
/// - `Halt`: descendants stay blocked (`outstanding_predecessors` never
///   reaches zero), the run stalls until someone completes it.
/// - `Continue`: every descendant of the failed task is skipped so that
///   unrelated branches can keep running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Halt,
    Continue,
}

impl FailurePolicy {
    /// `continue` (any case, surrounding blanks ignored) selects `Continue`;
    /// everything else, including unknown values, means `Halt`.
    pub fn normalize(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("continue") {
            FailurePolicy::Continue
        } else {
            FailurePolicy::Halt
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Halt => "halt",
            FailurePolicy::Continue => "continue",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FailurePolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FailurePolicy::normalize(&raw))
    }
}
