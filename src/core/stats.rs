use tokio::time::Instant;

use super::state::Broker;
use crate::types::session::SessionId;
use crate::types::states::JobState;
use crate::types::tube::{JobId, TubeName};
use crate::wire::protocol::{JobStats, ServerStats, TubeStatsResp};

impl Broker {
    pub fn stats_job(&self, id: u64) -> Option<JobStats> {
        let mut reg = self.lock();
        reg.counters.cmd_stats_job += 1;
        let now = Instant::now();
        let job = reg.jobs.get(&JobId(id))?;

        let time_left = match job.state {
            JobState::Delayed { until } => until.saturating_duration_since(now).as_secs() as u32,
            JobState::Reserved { deadline } => {
                deadline.saturating_duration_since(now).as_secs() as u32
            },
            JobState::Ready => 0,
        };

        Some(JobStats {
            id: job.id.0,
            tube: job.tube.as_bytes().to_vec(),
            state: job.state,
            pri: job.pri.0,
            age: job.age_secs(now),
            delay: job.delay,
            ttr: job.ttr,
            time_left,
            reserves: job.reserves,
            timeouts: job.timeouts,
            releases: job.releases,
        })
    }

    pub fn stats_tube(&self, tube: &TubeName) -> Option<TubeStatsResp> {
        let mut reg = self.lock();
        reg.counters.cmd_stats_tube += 1;
        let now = Instant::now();

        let using = reg
            .sessions
            .values()
            .filter(|s| s.using.as_ref() == Some(tube))
            .count() as u64;

        let tube_state = reg.tubes.get_mut(tube)?;
        tube_state.stats.current_using = using;
        let pause_time_left = tube_state.pause_seconds_left(now);

        Some(TubeStatsResp {
            name: tube.as_bytes().to_vec(),
            ts: tube_state.stats.clone(),
            pause_time_left,
        })
    }

    pub fn stats_server(&self) -> ServerStats {
        let mut reg = self.lock();
        reg.counters.cmd_stats += 1;

        let current_jobs_urgent =
            reg.tubes.values().map(|t| t.stats.current_jobs_urgent).sum();
        let current_jobs_ready = reg.tubes.values().map(|t| t.ready_len() as u64).sum();
        let current_jobs_delayed = reg.tubes.values().map(|t| t.delayed_len() as u64).sum();
        let current_jobs_reserved =
            reg.tubes.values().map(|t| t.stats.current_jobs_reserved).sum();
        let current_waiting = reg.tubes.values().map(|t| t.waiters_len() as u64).sum();
        let current_tubes = reg.tubes.len() as u64;
        let current_connections = reg.sessions.len() as u64;
        let current_producers =
            reg.sessions.values().filter(|s| s.is_producer).count() as u64;
        let current_workers =
            reg.sessions.values().filter(|s| s.is_worker).count() as u64;

        let c = &reg.counters;
        ServerStats {
            current_jobs_urgent,
            current_jobs_ready,
            current_jobs_reserved,
            current_jobs_delayed,
            cmd_put: c.cmd_put,
            cmd_peek: c.cmd_peek,
            cmd_reserve: c.cmd_reserve,
            cmd_reserve_with_timeout: c.cmd_reserve_with_timeout,
            cmd_touch: c.cmd_touch,
            cmd_use: c.cmd_use,
            cmd_watch: c.cmd_watch,
            cmd_ignore: c.cmd_ignore,
            cmd_delete: c.cmd_delete,
            cmd_release: c.cmd_release,
            cmd_stats: c.cmd_stats,
            cmd_stats_job: c.cmd_stats_job,
            cmd_stats_tube: c.cmd_stats_tube,
            cmd_list_tubes: c.cmd_list_tubes,
            cmd_list_tubes_used: c.cmd_list_tubes_used,
            cmd_list_tubes_watched: c.cmd_list_tubes_watched,
            cmd_pause_tube: c.cmd_pause_tube,
            job_timeouts: c.job_timeouts,
            total_jobs: c.total_jobs,
            max_job_size: self.max_job_size() as u64,
            current_tubes,
            current_connections,
            current_producers,
            current_workers,
            current_waiting,
            total_connections: c.total_connections,
            pid: self.pid(),
            version: env!("CARGO_PKG_VERSION"),
            uptime: self.uptime_secs(),
        }
    }

    pub fn list_tubes(&self) -> Vec<Vec<u8>> {
        let mut reg = self.lock();
        reg.counters.cmd_list_tubes += 1;
        reg.tubes.keys().map(|t| t.as_bytes().to_vec()).collect()
    }

    pub fn list_tubes_used(&self, session_id: SessionId) -> Option<Vec<u8>> {
        let mut reg = self.lock();
        reg.counters.cmd_list_tubes_used += 1;
        reg.sessions
            .get(&session_id)
            .and_then(|s| s.using.as_ref())
            .map(|t| t.as_bytes().to_vec())
    }

    pub fn list_tubes_watched(&self, session_id: SessionId) -> Vec<Vec<u8>> {
        let mut reg = self.lock();
        reg.counters.cmd_list_tubes_watched += 1;
        reg.sessions
            .get(&session_id)
            .map(|s| s.watching.iter().map(|t| t.as_bytes().to_vec()).collect())
            .unwrap_or_default()
    }
}
