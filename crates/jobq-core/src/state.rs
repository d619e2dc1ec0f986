use serde::{Deserialize, Serialize};
use std::fmt;

/// Job lifecycle state, encoded as the fixed integers the Hub and every
/// Client must agree on: `NEW=0, RUNNING=1, OK=2, FAILED=3`.
///
/// Stored on the job document as a plain `i32`, not a string: queries
/// compare against the integer directly, matching how the original
/// implementation compares against its `TS_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum JobState {
    New = 0,
    Running = 1,
    Ok = 2,
    Failed = 3,
}

impl JobState {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::New),
            1 => Some(Self::Running),
            2 => Some(Self::Ok),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl From<JobState> for bson::Bson {
    fn from(s: JobState) -> Self {
        bson::Bson::Int32(s.as_i32())
    }
}
