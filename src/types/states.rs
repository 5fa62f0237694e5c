use tokio::time::Instant;

use serde::Serialize;

/// Where a job sits in its lifecycle, and the state-specific data needed to
/// act on the next transition. No `Buried` variant: this implementation
/// never buries a job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Sitting in its tube's ready heap, eligible for reservation.
    Ready,
    /// Waiting for `until` to promote it into `Ready`.
    Delayed { until: Instant },
    /// Held by a session until `deadline` (TTR expiry) or an explicit
    /// `release`/`delete`/`touch`.
    Reserved { deadline: Instant },
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use JobState::*;

        serializer.serialize_str(match self {
            Ready { .. } => "ready",
            Delayed { .. } => "delayed",
            Reserved { .. } => "reserved",
        })
    }
}
