use std::sync::Arc;

use tokio::time::{sleep_until, Instant};

use super::state::Broker;
use crate::types::states::JobState;
use crate::types::tube::{JobId, TubeName};

/// Generation-guarded timers: delay promotion and TTR expiry. Neither holds
/// a cancellation handle; a timer that fires against a job whose generation
/// has since moved on (released, touched, deleted, re-promoted) is simply a
/// no-op.
impl Broker {
    pub(crate) fn schedule_delay(
        self: &Arc<Self>,
        tube_name: TubeName,
        job_id: JobId,
        generation: u64,
        until: Instant,
    ) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            sleep_until(until).await;
            broker.on_delay_expiry(tube_name, job_id, generation);
        });
    }

    pub(crate) fn schedule_ttr(
        self: &Arc<Self>,
        job_id: JobId,
        generation: u64,
        deadline: Instant,
    ) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            broker.on_ttr_expiry(job_id, generation);
        });
    }

    fn on_delay_expiry(self: &Arc<Self>, tube_name: TubeName, job_id: JobId, generation: u64) {
        let now = Instant::now();
        let outcome = {
            let mut reg = self.lock();
            let Some(job) = reg.jobs.get_mut(&job_id) else { return };
            if job.generation != generation {
                return;
            }
            let JobState::Delayed { until } = job.state else {
                return;
            };

            job.state = JobState::Ready;
            let pri = job.pri;
            let tube = reg.tubes.entry(tube_name.clone()).or_default();
            tube.remove_delayed(until, job_id);
            tube.push_ready(pri, job_id, false);
            reg.try_match_tube(&tube_name, now)
        };

        self.apply_pair_outcome(outcome);
    }

    fn on_ttr_expiry(self: &Arc<Self>, job_id: JobId, generation: u64) {
        let now = Instant::now();
        let outcome = {
            let mut reg = self.lock();
            let Some(job) = reg.jobs.get_mut(&job_id) else { return };
            if job.generation != generation {
                return;
            }
            if !matches!(job.state, JobState::Reserved { .. }) {
                return;
            }

            job.generation += 1;
            job.timeouts += 1;
            job.state = JobState::Ready;
            let owner = job.owner.take();
            let pri = job.pri;
            let tube_name = job.tube.clone();

            if let Some(owner) = owner {
                if let Some(session) = reg.sessions.get_mut(&owner) {
                    session.held_job = None;
                }
            }

            reg.counters.job_timeouts += 1;
            let tube = reg.tubes.entry(tube_name.clone()).or_default();
            tube.stats.current_jobs_reserved -= 1;
            tube.push_ready(pri, job_id, false);

            reg.try_match_tube(&tube_name, now)
        };

        self.apply_pair_outcome(outcome);
    }
}
