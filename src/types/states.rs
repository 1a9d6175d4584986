use std::fmt;

use serde::Serialize;

/// Lifecycle of a job held by the dispatcher. Transitions only ever move
/// forward: Undefined, Ready, Running, Done.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum JobStatus {
    #[default]
    Undefined,
    Ready,
    Running,
    Done,
}

impl JobStatus {
    /// Moves to `next` if that is a step forward, returning whether the status
    /// changed.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use JobStatus::*;

        f.write_str(match self {
            Undefined => "undefined",
            Ready => "ready",
            Running => "running",
            Done => "done",
        })
    }
}

// Lets dispatcher snapshots be dumped as JSON in logs and tools.
impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
