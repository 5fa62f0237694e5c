use bytes::Bytes;
use tokio::time::Instant;

use super::session::SessionId;
use super::states::JobState;
use super::tube::{JobId, Pri, TubeName};

/// A single job, owned by the job store and referenced by id from a tube's
/// ready/delayed sets or a session's held reservation.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub tube: TubeName,
    pub pri: Pri,
    pub data: Bytes,
    pub state: JobState, // also contains state-specific data
    pub created: Instant,
    pub delay: u32,
    pub ttr: u32,
    /// `Some` iff `state == Reserved`.
    pub owner: Option<SessionId>,
    /// Bumped on every state-relevant transition (reserve, release, touch,
    /// delay promotion) so a timer scheduled against a stale generation is a
    /// no-op when it fires, without needing explicit cancellation.
    pub generation: u64,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
}

impl Job {
    pub fn age_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.created).as_secs()
    }
}
