use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::state::Broker;
use crate::types::session::{ReservedJob, SessionId};
use crate::types::tube::TubeName;
use crate::wire::protocol::{Command, Response};

/// What the connection task should do with the outcome of dispatching one
/// command. `put`/`reserve`/`peek`-family commands that succeed carry a body
/// as a second frame; everything else is a single reply line.
pub enum DispatchReply {
    Simple(Response),
    Job { header: Response, body: Bytes },
    Quit,
    /// The process is shutting down while this session was blocked in
    /// `reserve`; the connection should close without a reply.
    ShuttingDown,
}

fn job_reply(header_kind: JobReplyKind, reserved: ReservedJob) -> DispatchReply {
    let n_bytes = reserved.body.len() as u32;
    let header = match header_kind {
        JobReplyKind::Reserved => Response::Reserved { id: reserved.id.0, n_bytes },
        JobReplyKind::Found => Response::Found { id: reserved.id.0, n_bytes },
    };
    DispatchReply::Job { header, body: reserved.body }
}

enum JobReplyKind {
    Reserved,
    Found,
}

/// Applies one parsed command to the broker on behalf of `session_id`,
/// producing the reply to send back. Blocking commands (`reserve`,
/// `reserve-with-timeout`) suspend this call until a job is available, the
/// timeout elapses, or `cancel` fires (process shutdown).
#[instrument(name = "dispatch", skip_all, fields(cmd = ?std::mem::discriminant(&cmd)))]
pub async fn dispatch(
    broker: &Arc<Broker>,
    session_id: SessionId,
    cmd: Command,
    cancel: &CancellationToken,
) -> DispatchReply {
    match cmd {
        Command::Use { tube } => {
            DispatchReply::Simple(broker.use_tube(session_id, TubeName(tube)))
        },

        Command::Watch { tube } => {
            DispatchReply::Simple(broker.watch(session_id, TubeName(tube)))
        },

        Command::Ignore { tube } => {
            DispatchReply::Simple(broker.ignore(session_id, TubeName(tube)))
        },

        Command::Reserve => {
            reserve(broker, session_id, None, cancel).await
        },

        Command::ReserveWithTimeout { timeout } => {
            reserve(broker, session_id, Some(timeout), cancel).await
        },

        Command::ReserveJob { id } => {
            match broker.reserve_job_by_id(session_id, id) {
                Some(reserved) => job_reply(JobReplyKind::Reserved, reserved),
                None => DispatchReply::Simple(Response::NotFound),
            }
        },

        Command::Put { .. } => {
            // The body arrives as separate `PutChunk`/`PutEnd` frame events,
            // not as part of this command; the connection loop assembles it
            // and calls `dispatch_put` directly instead of routing `put`
            // through this function. See `bin/tubed/main.rs`.
            DispatchReply::Simple(Response::InternalError)
        },

        Command::Delete { id } => DispatchReply::Simple(broker.delete(session_id, id)),

        Command::Release { id, pri, delay } => {
            DispatchReply::Simple(broker.release(session_id, id, pri, delay))
        },

        Command::Touch { id } => DispatchReply::Simple(broker.touch(session_id, id)),

        Command::Peek { id } => match broker.peek(id) {
            Some((job_id, body)) => job_reply(
                JobReplyKind::Found,
                ReservedJob { id: job_id, pri: crate::types::tube::Pri(0), body },
            ),
            None => DispatchReply::Simple(Response::NotFound),
        },

        Command::PeekReady => match broker.peek_ready(session_id) {
            Ok(Some((job_id, body))) => job_reply(
                JobReplyKind::Found,
                ReservedJob { id: job_id, pri: crate::types::tube::Pri(0), body },
            ),
            Ok(None) => DispatchReply::Simple(Response::NotFound),
            Err(resp) => DispatchReply::Simple(resp),
        },

        Command::PeekDelayed => match broker.peek_delayed(session_id) {
            Ok(Some((job_id, body))) => job_reply(
                JobReplyKind::Found,
                ReservedJob { id: job_id, pri: crate::types::tube::Pri(0), body },
            ),
            Ok(None) => DispatchReply::Simple(Response::NotFound),
            Err(resp) => DispatchReply::Simple(resp),
        },

        Command::PeekBuried | Command::Bury { .. } | Command::Kick { .. } | Command::KickJob { .. } => {
            DispatchReply::Simple(Response::UnknownCommand)
        },

        Command::StatsJob { id } => match broker.stats_job(id) {
            Some(data) => DispatchReply::Simple(Response::OkStatsJob { data }),
            None => DispatchReply::Simple(Response::NotFound),
        },

        Command::StatsTube { tube } => match broker.stats_tube(&TubeName(tube)) {
            Some(data) => DispatchReply::Simple(Response::OkStatsTube { data }),
            None => DispatchReply::Simple(Response::NotFound),
        },

        Command::StatsServer => {
            DispatchReply::Simple(Response::OkStats { data: broker.stats_server() })
        },

        Command::ListTubes => {
            DispatchReply::Simple(Response::OkListTubes { tubes: broker.list_tubes() })
        },

        Command::ListTubesUsed => match broker.list_tubes_used(session_id) {
            Some(tube) => DispatchReply::Simple(Response::Using { tube }),
            None => DispatchReply::Simple(Response::PutWithoutUse),
        },

        Command::ListTubesWatched => DispatchReply::Simple(Response::OkListTubes {
            tubes: broker.list_tubes_watched(session_id),
        }),

        Command::PauseTube { tube, delay } => {
            DispatchReply::Simple(broker.pause_tube(TubeName(tube), delay))
        },

        Command::Quit => DispatchReply::Quit,
    }
}

/// Applies a fully-assembled `put` (header command plus its accumulated
/// body) to the broker. Kept separate from `dispatch` because the body
/// isn't available until the framer has emitted the trailing `PutEnd` event.
pub fn dispatch_put(
    broker: &Arc<Broker>,
    session_id: SessionId,
    pri: u32,
    delay: u32,
    ttr: u32,
    body: Bytes,
) -> DispatchReply {
    match broker.put(session_id, pri, delay, ttr, body) {
        Ok(id) => DispatchReply::Simple(Response::Inserted { id }),
        Err(resp) => DispatchReply::Simple(resp),
    }
}

async fn reserve(
    broker: &Arc<Broker>,
    session_id: SessionId,
    timeout: Option<u32>,
    cancel: &CancellationToken,
) -> DispatchReply {
    if let Some(reserved) = broker.reserve_immediate(session_id, timeout.is_some()) {
        return job_reply(JobReplyKind::Reserved, reserved);
    }

    let Some(mut rx) = broker.register_waiter(session_id) else {
        return DispatchReply::Simple(Response::InternalError);
    };

    let sleep = match timeout {
        Some(secs) => Some(tokio::time::sleep(Duration::from_secs(secs as u64))),
        None => None,
    };
    tokio::pin!(sleep);

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            broker.cancel_waiter(session_id);
            DispatchReply::ShuttingDown
        },

        res = &mut rx => {
            match res {
                Ok(reserved) => job_reply(JobReplyKind::Reserved, reserved),
                Err(_) => DispatchReply::Simple(Response::InternalError),
            }
        },

        () = sleep_or_pending(sleep.as_pin_mut()) => {
            if broker.cancel_waiter(session_id) {
                DispatchReply::Simple(Response::TimedOut)
            } else {
                // A matcher claimed this waiter between the sleep firing and
                // our cancellation attempt; the reply is already in flight.
                match rx.await {
                    Ok(reserved) => job_reply(JobReplyKind::Reserved, reserved),
                    Err(_) => DispatchReply::Simple(Response::InternalError),
                }
            }
        },
    }
}

/// Awaits an optional pinned `Sleep`, never resolving when `None` (plain
/// `reserve` has no deadline). Lets the same `select!` arm serve both
/// `reserve` and `reserve-with-timeout` without duplicating the match.
async fn sleep_or_pending(sleep: Option<std::pin::Pin<&mut tokio::time::Sleep>>) {
    match sleep {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    #[tokio::test]
    async fn reserve_matches_immediately_when_a_job_is_ready() {
        let broker = Broker::new(65536);
        let cancel = CancellationToken::new();

        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        broker.put(producer, 0, 0, 60, Bytes::from_static(b"ready")).unwrap();

        let worker = broker.create_session(peer());
        let reply = dispatch(&broker, worker, Command::Reserve, &cancel).await;

        match reply {
            DispatchReply::Job { header: Response::Reserved { n_bytes, .. }, body } => {
                assert_eq!(n_bytes as usize, body.len());
                assert_eq!(body.as_ref(), b"ready");
            },
            _ => panic!("expected a Job reply"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_with_timeout_reports_timed_out_when_nothing_arrives() {
        let broker = Broker::new(65536);
        let cancel = CancellationToken::new();
        let worker = broker.create_session(peer());

        let handle = tokio::spawn({
            let broker = Arc::clone(&broker);
            let cancel = cancel.clone();
            async move {
                dispatch(&broker, worker, Command::ReserveWithTimeout { timeout: 1 }, &cancel)
                    .await
            }
        });

        tokio::time::advance(Duration::from_secs(2)).await;

        match handle.await.unwrap() {
            DispatchReply::Simple(Response::TimedOut) => {},
            _ => panic!("expected TIMED_OUT"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_with_timeout_delivers_a_job_that_arrives_before_the_deadline() {
        let broker = Broker::new(65536);
        let cancel = CancellationToken::new();
        let worker = broker.create_session(peer());

        let handle = tokio::spawn({
            let broker = Arc::clone(&broker);
            let cancel = cancel.clone();
            async move {
                dispatch(&broker, worker, Command::ReserveWithTimeout { timeout: 10 }, &cancel)
                    .await
            }
        });

        tokio::task::yield_now().await;

        let producer = broker.create_session(peer());
        broker.use_tube(producer, TubeName::default_tube());
        broker.put(producer, 0, 0, 60, Bytes::from_static(b"just in time")).unwrap();

        match handle.await.unwrap() {
            DispatchReply::Job { header: Response::Reserved { .. }, body } => {
                assert_eq!(body.as_ref(), b"just in time");
            },
            _ => panic!("expected a Job reply"),
        }
    }

    #[tokio::test]
    async fn reserve_reports_shutting_down_on_cancellation() {
        let broker = Broker::new(65536);
        let cancel = CancellationToken::new();
        let worker = broker.create_session(peer());

        let handle = tokio::spawn({
            let broker = Arc::clone(&broker);
            let cancel = cancel.clone();
            async move { dispatch(&broker, worker, Command::Reserve, &cancel).await }
        });

        tokio::task::yield_now().await;
        cancel.cancel();

        match handle.await.unwrap() {
            DispatchReply::ShuttingDown => {},
            _ => panic!("expected ShuttingDown"),
        }
    }
}
