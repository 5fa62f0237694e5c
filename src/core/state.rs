use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::types::job::Job;
use crate::types::session::{ReservedJob, SessionId, SessionRecord, Waiting};
use crate::types::states::JobState;
use crate::types::tube::{JobId, Pri, TubeName, TubeState};
use crate::wire::protocol::Response;

/// The outcome of pairing a job with a session, returned out of the locked
/// registry so the caller can schedule the TTR timer (which needs an `Arc`
/// back to the broker) after the lock is released.
pub(crate) struct PairOutcome {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub generation: u64,
    pub deadline: Instant,
    pub pri: Pri,
    pub body: Bytes,
}

impl PairOutcome {
    pub(crate) fn into_reserved(self) -> ReservedJob {
        ReservedJob { id: self.job_id, pri: self.pri, body: self.body }
    }
}

#[derive(Default)]
pub(crate) struct ServerCounters {
    pub cmd_put: u64,
    pub cmd_peek: u64,
    pub cmd_reserve: u64,
    pub cmd_reserve_with_timeout: u64,
    pub cmd_touch: u64,
    pub cmd_use: u64,
    pub cmd_watch: u64,
    pub cmd_ignore: u64,
    pub cmd_delete: u64,
    pub cmd_release: u64,
    pub cmd_stats: u64,
    pub cmd_stats_job: u64,
    pub cmd_stats_tube: u64,
    pub cmd_list_tubes: u64,
    pub cmd_list_tubes_used: u64,
    pub cmd_list_tubes_watched: u64,
    pub cmd_pause_tube: u64,
    pub job_timeouts: u64,
    pub total_jobs: u64,
    pub total_connections: u64,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub jobs: HashMap<JobId, Job>,
    pub tubes: HashMap<TubeName, TubeState>,
    pub sessions: HashMap<SessionId, SessionRecord>,
    pub next_job_id: u64,
    pub next_session_id: u64,
    pub counters: ServerCounters,
}

impl Registry {
    fn new() -> Self {
        let mut reg = Registry {
            next_job_id: 1,
            ..Default::default()
        };
        reg.tubes.entry(TubeName::default_tube()).or_default();
        reg
    }

    /// Attempts to pair the best-ranked ready job in `tube_name` with the
    /// earliest eligible waiter on that tube. Used after any event that
    /// makes a new job ready (put, release, delay promotion, TTR expiry).
    pub(crate) fn try_match_tube(
        &mut self,
        tube_name: &TubeName,
        now: Instant,
    ) -> Option<PairOutcome> {
        let tube = self.tubes.get_mut(tube_name)?;
        tube.peek_best_ready(now)?;

        let sessions = &self.sessions;
        let session_id = tube.pop_waiter(|sid| {
            sessions.get(&sid).is_some_and(|s| s.held_job.is_none())
        })?;
        let job_id =
            tube.pop_best_ready(now).expect("ready job present, checked above");

        Some(self.finish_pairing(job_id, session_id))
    }

    /// Immediate-match fast path for a session just issuing `reserve`:
    /// walks its watchlist in order, looking for any tube with a ready job.
    pub(crate) fn try_match_session(
        &mut self,
        session_id: SessionId,
        now: Instant,
    ) -> Option<PairOutcome> {
        let watching = self.sessions.get(&session_id)?.watching.clone();

        for tube_name in &watching {
            let Some(tube) = self.tubes.get_mut(tube_name) else { continue };
            if let Some(job_id) = tube.pop_best_ready(now) {
                return Some(self.finish_pairing(job_id, session_id));
            }
        }

        None
    }

    /// Reserves a specific job directly, skipping the ready queue, for
    /// `reserve-job`. The job must currently be `ready` or `delayed`.
    pub(crate) fn reserve_job_by_id(
        &mut self,
        session_id: SessionId,
        job_id: JobId,
    ) -> Option<PairOutcome> {
        let job = self.jobs.get(&job_id)?;
        let tube_name = job.tube.clone();

        match job.state {
            JobState::Ready => {
                let tube = self.tubes.get_mut(&tube_name)?;
                if !tube.remove_ready(job_id) {
                    return None;
                }
            },
            JobState::Delayed { until } => {
                let tube = self.tubes.get_mut(&tube_name)?;
                if !tube.remove_delayed(until, job_id) {
                    return None;
                }
            },
            JobState::Reserved { .. } => return None,
        }

        Some(self.finish_pairing(job_id, session_id))
    }

    fn finish_pairing(
        &mut self,
        job_id: JobId,
        session_id: SessionId,
    ) -> PairOutcome {
        let now = Instant::now();

        let job = self.jobs.get_mut(&job_id).expect("paired job must exist");
        job.generation += 1;
        job.reserves += 1;
        job.owner = Some(session_id);
        let deadline = now + Duration::from_secs(job.ttr.max(1) as u64);
        job.state = JobState::Reserved { deadline };
        let generation = job.generation;
        let tube_name = job.tube.clone();
        let pri = job.pri;
        let body = job.data.clone();

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.stats.current_jobs_reserved += 1;
        }

        let session =
            self.sessions.get_mut(&session_id).expect("matched session must exist");
        session.held_job = Some(job_id);
        let waiting = session.waiting.take();

        if let Some(waiting) = waiting {
            for t in &waiting.tubes {
                if *t != tube_name {
                    if let Some(tube) = self.tubes.get_mut(t) {
                        tube.remove_waiter(session_id);
                    }
                }
            }
            let _ = waiting.reply.send(ReservedJob { id: job_id, pri, body: body.clone() });
        }

        PairOutcome { job_id, session_id, generation, deadline, pri, body }
    }

    /// Unwinds all bookkeeping for a session on connection teardown: its
    /// held job (if any) goes to the head of its tube's ready queue, its
    /// waiter registration (if any) is removed from every tube it was
    /// queued against, and it is dropped from every tube's watcher list.
    pub(crate) fn teardown_session(
        &mut self,
        session_id: SessionId,
    ) -> Option<(TubeName, Instant)> {
        let session = self.sessions.remove(&session_id)?;
        let now = Instant::now();
        let mut released_tube = None;

        if let Some(job_id) = session.held_job {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.generation += 1;
                job.owner = None;
                job.state = JobState::Ready;
                let tube_name = job.tube.clone();
                let pri = job.pri;
                let tube = self.tubes.entry(tube_name.clone()).or_default();
                tube.stats.current_jobs_reserved -= 1;
                tube.push_ready(pri, job_id, true);
                released_tube = Some((tube_name, now));
            }
        }

        if let Some(waiting) = session.waiting {
            for tube_name in &waiting.tubes {
                if let Some(tube) = self.tubes.get_mut(tube_name) {
                    tube.remove_waiter(session_id);
                }
            }
        }

        for tube_name in &session.watching {
            if let Some(tube) = self.tubes.get_mut(tube_name) {
                tube.remove_watcher(session_id);
            }
        }

        released_tube
    }

    pub(crate) fn delete(&mut self, session_id: SessionId, job_id: JobId) -> Response {
        let Some(job) = self.jobs.get(&job_id) else {
            return Response::NotFound;
        };

        if let JobState::Reserved { .. } = job.state {
            if job.owner != Some(session_id) {
                return Response::NotFound;
            }
        }

        let tube_name = job.tube.clone();
        let state = job.state;

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            match state {
                JobState::Ready => {
                    tube.remove_ready(job_id);
                },
                JobState::Delayed { until } => {
                    tube.remove_delayed(until, job_id);
                },
                JobState::Reserved { .. } => {
                    tube.stats.current_jobs_reserved -= 1;
                },
            }
        }

        if let JobState::Reserved { .. } = state {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.held_job = None;
            }
        }

        self.jobs.remove(&job_id);
        Response::Deleted
    }

    /// Returns `Some(tube)` to try-match if the job went back to `ready`
    /// immediately, or `None` if it was delayed (caller must schedule a
    /// delay timer) or the release was rejected.
    pub(crate) fn release(
        &mut self,
        session_id: SessionId,
        job_id: JobId,
        pri: u32,
        delay: u32,
    ) -> ReleaseOutcome {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return ReleaseOutcome::NotFound;
        };
        if job.owner != Some(session_id) {
            return ReleaseOutcome::NotFound;
        }

        let now = Instant::now();
        job.generation += 1;
        job.releases += 1;
        job.pri = Pri(pri);
        job.owner = None;
        job.delay = delay;
        let generation = job.generation;
        let tube_name = job.tube.clone();

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.held_job = None;
        }

        let tube = self.tubes.entry(tube_name.clone()).or_default();
        tube.stats.current_jobs_reserved -= 1;

        if delay > 0 {
            let until = now + Duration::from_secs(delay as u64);
            self.jobs.get_mut(&job_id).unwrap().state = JobState::Delayed { until };
            self.tubes.get_mut(&tube_name).unwrap().push_delayed(until, job_id);
            ReleaseOutcome::Delayed { tube_name, job_id, generation, until }
        } else {
            self.jobs.get_mut(&job_id).unwrap().state = JobState::Ready;
            self.tubes.get_mut(&tube_name).unwrap().push_ready(Pri(pri), job_id, false);
            ReleaseOutcome::Ready { tube_name }
        }
    }

    pub(crate) fn touch(
        &mut self,
        session_id: SessionId,
        job_id: JobId,
    ) -> Option<(u64, Instant)> {
        let job = self.jobs.get_mut(&job_id)?;
        if job.owner != Some(session_id) {
            return None;
        }
        job.generation += 1;
        let deadline = Instant::now() + Duration::from_secs(job.ttr.max(1) as u64);
        job.state = JobState::Reserved { deadline };
        Some((job.generation, deadline))
    }
}

pub(crate) enum ReleaseOutcome {
    NotFound,
    Ready { tube_name: TubeName },
    Delayed { tube_name: TubeName, job_id: JobId, generation: u64, until: Instant },
}

/// Owns every piece of mutable broker state behind one lock (the "registry
/// lock"), never held across an `.await` point. One `Broker` is shared
/// across every connection task via `Arc`.
pub struct Broker {
    pub(crate) registry: Mutex<Registry>,
    max_job_size: u32,
    start: Instant,
    pid: u32,
}

impl Broker {
    pub fn new(max_job_size: u32) -> Arc<Self> {
        Arc::new(Broker {
            registry: Mutex::new(Registry::new()),
            max_job_size,
            start: Instant::now(),
            pid: std::process::id(),
        })
    }

    pub fn max_job_size(&self) -> u32 {
        self.max_job_size
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry mutex poisoned")
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn uptime_secs(&self) -> u64 {
        Instant::now().saturating_duration_since(self.start).as_secs()
    }

    pub fn create_session(&self, peer_address: SocketAddr) -> SessionId {
        let mut reg = self.lock();
        let id = SessionId(reg.next_session_id);
        reg.next_session_id += 1;
        reg.sessions.insert(id, SessionRecord::new(peer_address));
        reg.tubes
            .entry(TubeName::default_tube())
            .or_default()
            .add_watcher(id);
        reg.counters.total_connections += 1;
        id
    }

    pub fn teardown_session(self: &Arc<Self>, session_id: SessionId) {
        let outcome = {
            let mut reg = self.lock();
            let released = reg.teardown_session(session_id);
            released.and_then(|(tube_name, now)| reg.try_match_tube(&tube_name, now))
        };
        self.apply_pair_outcome(outcome);
    }

    pub fn use_tube(&self, session_id: SessionId, tube: TubeName) -> Response {
        let mut reg = self.lock();
        reg.counters.cmd_use += 1;
        reg.tubes.entry(tube.clone()).or_default();
        if let Some(session) = reg.sessions.get_mut(&session_id) {
            session.using = Some(tube.clone());
            session.is_producer = true;
        }
        Response::Using { tube: tube.as_bytes().to_vec() }
    }

    pub fn watch(&self, session_id: SessionId, tube: TubeName) -> Response {
        let mut reg = self.lock();
        reg.counters.cmd_watch += 1;
        let Some(session) = reg.sessions.get_mut(&session_id) else {
            return Response::InternalError;
        };
        if !session.watching.contains(&tube) {
            session.watching.push(tube.clone());
        }
        session.is_worker = true;
        let count = session.watching.len() as u32;
        reg.tubes.entry(tube).or_default().add_watcher(session_id);
        Response::Watching { count }
    }

    pub fn ignore(&self, session_id: SessionId, tube: TubeName) -> Response {
        let mut reg = self.lock();
        reg.counters.cmd_ignore += 1;
        let Some(session) = reg.sessions.get_mut(&session_id) else {
            return Response::InternalError;
        };
        if session.watching.len() <= 1 {
            return Response::NotIgnored;
        }
        session.watching.retain(|t| *t != tube);
        let count = session.watching.len() as u32;
        if let Some(t) = reg.tubes.get_mut(&tube) {
            t.remove_watcher(session_id);
        }
        Response::Watching { count }
    }

    /// Returns `Ok(id)` on success, `Err(response)` if the session has no
    /// tube in use.
    pub fn put(
        self: &Arc<Self>,
        session_id: SessionId,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    ) -> Result<u64, Response> {
        let (job_id, schedule) = {
            let mut reg = self.lock();
            reg.counters.cmd_put += 1;

            let Some(tube_name) = reg
                .sessions
                .get(&session_id)
                .and_then(|s| s.using.clone())
            else {
                return Err(Response::PutWithoutUse);
            };

            let id = reg.next_job_id;
            reg.next_job_id += 1;
            let job_id = JobId(id);
            let now = Instant::now();

            let state = if delay > 0 {
                JobState::Delayed { until: now + Duration::from_secs(delay as u64) }
            } else {
                JobState::Ready
            };

            let job = Job {
                id: job_id,
                tube: tube_name.clone(),
                pri: Pri(pri),
                data,
                state,
                created: now,
                delay,
                ttr,
                owner: None,
                generation: 0,
                reserves: 0,
                timeouts: 0,
                releases: 0,
            };

            reg.jobs.insert(job_id, job);
            reg.counters.total_jobs += 1;
            let tube = reg.tubes.entry(tube_name.clone()).or_default();
            tube.stats.total_jobs += 1;

            let schedule = if let JobState::Delayed { until } = state {
                tube.push_delayed(until, job_id);
                Schedule::Delay { tube_name, job_id, until }
            } else {
                tube.push_ready(Pri(pri), job_id, false);
                let outcome = reg.try_match_tube(&tube_name, now);
                Schedule::Match(outcome)
            };

            (id, schedule)
        };

        match schedule {
            Schedule::Delay { tube_name, job_id, until } => {
                self.schedule_delay(tube_name, job_id, 0, until);
            },
            Schedule::Match(outcome) => self.apply_pair_outcome(outcome),
        }

        Ok(job_id)
    }

    /// Immediate-match fast path tried before registering a waiter. Counts
    /// the dispatched command exactly once, regardless of whether it ends up
    /// matching immediately or falling through to `register_waiter`.
    pub fn reserve_immediate(
        self: &Arc<Self>,
        session_id: SessionId,
        with_timeout: bool,
    ) -> Option<ReservedJob> {
        let outcome = {
            let mut reg = self.lock();
            if with_timeout {
                reg.counters.cmd_reserve_with_timeout += 1;
            } else {
                reg.counters.cmd_reserve += 1;
            }
            if let Some(session) = reg.sessions.get_mut(&session_id) {
                session.is_worker = true;
            }
            reg.try_match_session(session_id, Instant::now())
        };
        self.deliver_pair_outcome(outcome)
    }

    pub fn reserve_job_by_id(self: &Arc<Self>, session_id: SessionId, id: u64) -> Option<ReservedJob> {
        let outcome = {
            let mut reg = self.lock();
            reg.reserve_job_by_id(session_id, JobId(id))
        };
        self.deliver_pair_outcome(outcome)
    }

    fn deliver_pair_outcome(
        self: &Arc<Self>,
        outcome: Option<PairOutcome>,
    ) -> Option<ReservedJob> {
        let outcome = outcome?;
        self.schedule_ttr(outcome.job_id, outcome.generation, outcome.deadline);
        Some(outcome.into_reserved())
    }

    pub(crate) fn apply_pair_outcome(self: &Arc<Self>, outcome: Option<PairOutcome>) {
        if let Some(o) = outcome {
            self.schedule_ttr(o.job_id, o.generation, o.deadline);
        }
    }

    /// Registers `session_id` as a waiter on every tube it currently
    /// watches, returning the oneshot side that will receive the eventual
    /// match.
    pub fn register_waiter(&self, session_id: SessionId) -> Option<oneshot::Receiver<ReservedJob>> {
        let mut reg = self.lock();
        let tubes = reg.sessions.get(&session_id)?.watching.clone();
        let (tx, rx) = oneshot::channel();

        reg.sessions.get_mut(&session_id)?.waiting =
            Some(Waiting { tubes: tubes.clone(), reply: tx });

        for t in &tubes {
            reg.tubes.entry(t.clone()).or_default().push_waiter(session_id);
        }

        Some(rx)
    }

    /// Attempts to cancel a pending waiter registration. Returns `true` if
    /// the registration was still pending and was removed; `false` if a
    /// matcher had already claimed it (the oneshot reply is in flight).
    pub fn cancel_waiter(&self, session_id: SessionId) -> bool {
        let mut reg = self.lock();
        let Some(session) = reg.sessions.get_mut(&session_id) else {
            return false;
        };
        let Some(waiting) = session.waiting.take() else {
            return false;
        };
        for t in &waiting.tubes {
            if let Some(tube) = reg.tubes.get_mut(t) {
                tube.remove_waiter(session_id);
            }
        }
        true
    }

    pub fn delete(self: &Arc<Self>, session_id: SessionId, id: u64) -> Response {
        let mut reg = self.lock();
        reg.counters.cmd_delete += 1;
        let tube_name = reg.jobs.get(&JobId(id)).map(|j| j.tube.clone());
        if let Some(tube_name) = tube_name {
            if let Some(tube) = reg.tubes.get_mut(&tube_name) {
                tube.stats.cmd_delete += 1;
            }
        }
        reg.delete(session_id, JobId(id))
    }

    pub fn release(self: &Arc<Self>, session_id: SessionId, id: u64, pri: u32, delay: u32) -> Response {
        let outcome = {
            let mut reg = self.lock();
            reg.counters.cmd_release += 1;
            reg.release(session_id, JobId(id), pri, delay)
        };

        match outcome {
            ReleaseOutcome::NotFound => Response::NotFound,
            ReleaseOutcome::Ready { tube_name } => {
                let pair = {
                    let mut reg = self.lock();
                    reg.try_match_tube(&tube_name, Instant::now())
                };
                self.apply_pair_outcome(pair);
                Response::Released
            },
            ReleaseOutcome::Delayed { tube_name, job_id, generation, until } => {
                self.schedule_delay(tube_name, job_id, generation, until);
                Response::Released
            },
        }
    }

    pub fn touch(self: &Arc<Self>, session_id: SessionId, id: u64) -> Response {
        let touched = {
            let mut reg = self.lock();
            reg.counters.cmd_touch += 1;
            reg.touch(session_id, JobId(id))
        };
        match touched {
            Some((generation, deadline)) => {
                self.schedule_ttr(JobId(id), generation, deadline);
                Response::Touched
            },
            None => Response::NotFound,
        }
    }

    pub fn pause_tube(&self, tube: TubeName, delay: u32) -> Response {
        let mut reg = self.lock();
        reg.counters.cmd_pause_tube += 1;
        let now = Instant::now();
        let t = reg.tubes.entry(tube).or_default();
        t.stats.cmd_pause_tube += 1;
        t.set_pause_until(now + Duration::from_secs(delay as u64), delay);
        Response::Paused
    }

    pub fn peek(&self, id: u64) -> Option<(JobId, Bytes)> {
        let mut reg = self.lock();
        reg.counters.cmd_peek += 1;
        reg.jobs.get(&JobId(id)).map(|j| (j.id, j.data.clone()))
    }

    pub fn peek_ready(&self, session_id: SessionId) -> Result<Option<(JobId, Bytes)>, Response> {
        let mut reg = self.lock();
        reg.counters.cmd_peek += 1;
        let Some(tube_name) = reg.sessions.get(&session_id).and_then(|s| s.using.clone()) else {
            return Err(Response::PutWithoutUse);
        };
        let now = Instant::now();
        let Some(tube) = reg.tubes.get(&tube_name) else {
            return Ok(None);
        };
        let Some(job_id) = tube.peek_best_ready(now) else {
            return Ok(None);
        };
        Ok(reg.jobs.get(&job_id).map(|j| (j.id, j.data.clone())))
    }

    pub fn peek_delayed(&self, session_id: SessionId) -> Result<Option<(JobId, Bytes)>, Response> {
        let mut reg = self.lock();
        reg.counters.cmd_peek += 1;
        let Some(tube_name) = reg.sessions.get(&session_id).and_then(|s| s.using.clone()) else {
            return Err(Response::PutWithoutUse);
        };
        let Some(tube) = reg.tubes.get(&tube_name) else {
            return Ok(None);
        };
        let Some(job_id) = tube.peek_best_delayed() else {
            return Ok(None);
        };
        Ok(reg.jobs.get(&job_id).map(|j| (j.id, j.data.clone())))
    }
}

enum Schedule {
    Delay { tube_name: TubeName, job_id: JobId, until: Instant },
    Match(Option<PairOutcome>),
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    #[tokio::test]
    async fn put_without_use_is_rejected() {
        let broker = Broker::new(65536);
        let session = broker.create_session(peer());
        assert_eq!(
            broker.put(session, 0, 0, 60, Bytes::from_static(b"x")),
            Err(Response::PutWithoutUse),
        );
    }

    #[tokio::test]
    async fn put_then_reserve_round_trips_the_body() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName(b"jobs".to_vec()));
        let id = broker.put(producer, 10, 0, 60, Bytes::from_static(b"payload")).unwrap();

        let worker = broker.create_session(peer());
        broker.watch(worker, TubeName(b"jobs".to_vec()));
        let reserved = broker.reserve_immediate(worker, false).expect("job should be ready");

        assert_eq!(reserved.id.0, id);
        assert_eq!(reserved.body.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn lower_priority_value_is_reserved_first() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        let low_pri = broker.put(producer, 100, 0, 60, Bytes::from_static(b"slow")).unwrap();
        let high_pri = broker.put(producer, 1, 0, 60, Bytes::from_static(b"urgent")).unwrap();

        let worker = broker.create_session(peer());
        let first = broker.reserve_immediate(worker, false).unwrap();
        assert_eq!(first.id.0, high_pri);
        broker.delete(worker, first.id.0);

        let second = broker.reserve_immediate(worker, false).unwrap();
        assert_eq!(second.id.0, low_pri);
    }

    #[tokio::test]
    async fn delete_rejects_non_owner() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        let id = broker.put(producer, 0, 0, 60, Bytes::from_static(b"x")).unwrap();

        let owner = broker.create_session(peer());
        let reserved = broker.reserve_immediate(owner, false).unwrap();
        assert_eq!(reserved.id.0, id);

        let bystander = broker.create_session(peer());
        assert_eq!(broker.delete(bystander, id), Response::NotFound);
        assert_eq!(broker.delete(owner, id), Response::Deleted);
    }

    #[tokio::test]
    async fn release_returns_job_to_ready_for_another_worker() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        let id = broker.put(producer, 5, 0, 60, Bytes::from_static(b"retry-me")).unwrap();

        let first_worker = broker.create_session(peer());
        let reserved = broker.reserve_immediate(first_worker, false).unwrap();
        assert_eq!(reserved.id.0, id);

        assert_eq!(broker.release(first_worker, id, 5, 0), Response::Released);

        let second_worker = broker.create_session(peer());
        let reserved_again = broker.reserve_immediate(second_worker, false).unwrap();
        assert_eq!(reserved_again.id.0, id);
    }

    #[tokio::test]
    async fn teardown_of_owning_session_releases_held_job() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        let id = broker.put(producer, 0, 0, 60, Bytes::from_static(b"x")).unwrap();

        let worker = broker.create_session(peer());
        let reserved = broker.reserve_immediate(worker, false).unwrap();
        assert_eq!(reserved.id.0, id);

        broker.teardown_session(worker);

        let other_worker = broker.create_session(peer());
        let reserved_again = broker.reserve_immediate(other_worker, false).expect(
            "job should be back in the ready queue after its reserving session tore down",
        );
        assert_eq!(reserved_again.id.0, id);
    }

    #[tokio::test]
    async fn ignore_last_watched_tube_is_rejected() {
        let broker = Broker::new(65536);
        let session = broker.create_session(peer());
        assert_eq!(
            broker.ignore(session, TubeName::default_tube()),
            Response::NotIgnored,
        );
    }

    #[tokio::test]
    async fn delayed_put_is_not_immediately_ready() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        broker.put(producer, 0, 300, 60, Bytes::from_static(b"later")).unwrap();

        let worker = broker.create_session(peer());
        assert!(broker.reserve_immediate(worker, false).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_promotion_clears_the_stale_delayed_queue_entry() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());

        let soon = broker.put(producer, 0, 1, 60, Bytes::from_static(b"soon")).unwrap();
        let later = broker.put(producer, 0, 100, 60, Bytes::from_static(b"later")).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        let tube = TubeName::default_tube();
        let stats = broker.stats_tube(&tube).expect("tube exists");
        assert_eq!(
            stats.ts.current_jobs_delayed, 1,
            "promoted job's delayed entry must be removed, not just shadowed",
        );

        let (peeked_id, _) = broker
            .peek_delayed(producer)
            .unwrap()
            .expect("the still-delayed job should be found");
        assert_eq!(peeked_id.0, later);
        assert_ne!(peeked_id.0, soon);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_reschedules_the_ttr_deadline() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        let id = broker.put(producer, 0, 0, 2, Bytes::from_static(b"x")).unwrap();

        let worker = broker.create_session(peer());
        let reserved = broker.reserve_immediate(worker, false).unwrap();
        assert_eq!(reserved.id.0, id);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(broker.touch(worker, id), Response::Touched);

        // The original 2s TTR would have expired by t=2s; by t=3s it's well
        // past that, but the touch above should have pushed the deadline out.
        tokio::time::advance(Duration::from_millis(1500)).await;
        let other_worker = broker.create_session(peer());
        assert!(
            broker.reserve_immediate(other_worker, false).is_none(),
            "touch must reschedule the TTR timer, not just bump the deadline field",
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        let reserved_again = broker
            .reserve_immediate(other_worker, false)
            .expect("job should return to ready once the rescheduled TTR fires");
        assert_eq!(reserved_again.id.0, id);
    }

    #[tokio::test]
    async fn reserve_and_reserve_with_timeout_are_counted_separately() {
        let broker = Broker::new(65536);
        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        broker.put(producer, 0, 0, 60, Bytes::from_static(b"a")).unwrap();
        broker.put(producer, 0, 0, 60, Bytes::from_static(b"b")).unwrap();

        let worker_a = broker.create_session(peer());
        let worker_b = broker.create_session(peer());
        let worker_c = broker.create_session(peer());

        broker.reserve_immediate(worker_a, false).unwrap();
        broker.reserve_immediate(worker_b, false).unwrap();
        // Nothing left ready, but the command is still dispatched and counted.
        assert!(broker.reserve_immediate(worker_c, true).is_none());

        let stats = broker.stats_server();
        assert_eq!(stats.cmd_reserve, 2);
        assert_eq!(stats.cmd_reserve_with_timeout, 1);
    }
}
