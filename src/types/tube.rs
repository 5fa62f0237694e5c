use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use tokio::time::Instant;

use super::session::SessionId;

/// Tube names are opaque byte strings up to the first whitespace in a
/// command; see `wire::parser` for the charset/length validation applied
/// before one of these is constructed.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct TubeName(pub Vec<u8>);

impl TubeName {
    pub fn default_tube() -> Self {
        TubeName(b"default".to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct Pri(pub u32);

/// A job's position within one tube's ready ordering: `(priority, seq)`,
/// ascending. `seq` is usually monotonically increasing (FIFO for jobs of
/// equal priority), except the connection-teardown release path, which uses
/// a separate monotonically *decreasing* sequence so a released job sorts
/// ahead of every job already queued at the same priority.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
struct ReadySeq(i64);

#[derive(Clone, Debug, PartialEq, Serialize, Default)]
pub struct TubeStats {
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    #[serde(rename = "current-using")]
    pub current_using: u64,
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    pub pause: u32,
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
}

/// `priority < URGENT_THRESHOLD` is reported in `current-jobs-urgent`,
/// matching the beanstalkd convention the teacher's `TubeStats` doc comments
/// reference.
pub const URGENT_THRESHOLD: u32 = 1024;

/// Per-tube state: the ready heap, the delayed set, the watcher/waiter
/// lists, and pause status. Jobs themselves live in the job store; this
/// structure only ever holds `JobId`s.
#[derive(Debug, Default)]
pub struct TubeState {
    ready: BTreeMap<(Pri, ReadySeq), JobId>,
    next_seq: i64,
    next_head_seq: i64,
    delayed: BTreeSet<(Instant, JobId)>,
    watchers: Vec<SessionId>,
    waiters: VecDeque<SessionId>,
    pause_until: Option<Instant>,
    pub stats: TubeStats,
}

impl TubeState {
    pub fn push_ready(&mut self, pri: Pri, job_id: JobId, at_head: bool) {
        let seq = if at_head {
            self.next_head_seq -= 1;
            self.next_head_seq
        } else {
            let s = self.next_seq;
            self.next_seq += 1;
            s
        };

        self.ready.insert((pri, ReadySeq(seq)), job_id);
        self.stats.current_jobs_ready += 1;
        if pri.0 < URGENT_THRESHOLD {
            self.stats.current_jobs_urgent += 1;
        }
    }

    /// Removes and returns the highest-priority, earliest-inserted ready
    /// job, unless the tube is currently paused.
    pub fn pop_best_ready(&mut self, now: Instant) -> Option<JobId> {
        if self.is_paused(now) {
            return None;
        }

        let key = *self.ready.keys().next()?;
        let (pri, _) = key;
        let job_id = self.ready.remove(&key).unwrap();
        self.stats.current_jobs_ready -= 1;
        if pri.0 < URGENT_THRESHOLD {
            self.stats.current_jobs_urgent -= 1;
        }
        Some(job_id)
    }

    /// Removes a specific job from the ready heap (used by `delete`).
    pub fn remove_ready(&mut self, job_id: JobId) -> bool {
        let key = self
            .ready
            .iter()
            .find(|(_, v)| **v == job_id)
            .map(|(k, _)| *k);

        if let Some((pri, seq)) = key {
            self.ready.remove(&(pri, seq));
            self.stats.current_jobs_ready -= 1;
            if pri.0 < URGENT_THRESHOLD {
                self.stats.current_jobs_urgent -= 1;
            }
            true
        } else {
            false
        }
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn watchers_len(&self) -> usize {
        self.watchers.len()
    }

    pub fn waiters_len(&self) -> usize {
        self.waiters.len()
    }

    pub fn peek_best_ready(&self, now: Instant) -> Option<JobId> {
        if self.is_paused(now) {
            return None;
        }
        self.ready.values().next().copied()
    }

    pub fn push_delayed(&mut self, until: Instant, job_id: JobId) {
        self.delayed.insert((until, job_id));
        self.stats.current_jobs_delayed += 1;
    }

    pub fn remove_delayed(&mut self, until: Instant, job_id: JobId) -> bool {
        if self.delayed.remove(&(until, job_id)) {
            self.stats.current_jobs_delayed -= 1;
            true
        } else {
            false
        }
    }

    pub fn peek_best_delayed(&self) -> Option<JobId> {
        self.delayed.iter().next().map(|(_, id)| *id)
    }

    pub fn add_watcher(&mut self, session: SessionId) -> bool {
        if self.watchers.contains(&session) {
            false
        } else {
            self.watchers.push(session);
            self.stats.current_watching += 1;
            true
        }
    }

    pub fn remove_watcher(&mut self, session: SessionId) {
        if let Some(pos) = self.watchers.iter().position(|s| *s == session) {
            self.watchers.remove(pos);
            self.stats.current_watching -= 1;
        }
    }

    pub fn push_waiter(&mut self, session: SessionId) {
        self.waiters.push_back(session);
        self.stats.current_waiting += 1;
    }

    /// Pops waiters from the front until one is still eligible (per
    /// `is_eligible`), discarding stale entries left behind by a session
    /// that started waiting on this tube but was matched via another one.
    pub fn pop_waiter(
        &mut self,
        mut is_eligible: impl FnMut(SessionId) -> bool,
    ) -> Option<SessionId> {
        while let Some(session) = self.waiters.pop_front() {
            self.stats.current_waiting -= 1;
            if is_eligible(session) {
                return Some(session);
            }
        }
        None
    }

    pub fn remove_waiter(&mut self, session: SessionId) {
        if let Some(pos) = self.waiters.iter().position(|s| *s == session) {
            self.waiters.remove(pos);
            self.stats.current_waiting -= 1;
        }
    }

    pub fn set_pause_until(&mut self, until: Instant, duration_secs: u32) {
        self.pause_until = Some(until);
        self.stats.pause = duration_secs;
    }

    pub fn is_paused(&self, now: Instant) -> bool {
        matches!(self.pause_until, Some(until) if now < until)
    }

    pub fn pause_seconds_left(&self, now: Instant) -> u32 {
        match self.pause_until {
            Some(until) if until > now => (until - now).as_secs() as u32,
            _ => 0,
        }
    }
}
