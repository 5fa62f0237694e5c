use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::tube::{JobId, Pri, TubeName};

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

/// Delivered through a waiting session's oneshot channel once the matcher
/// pairs it with a job. The owning connection task turns this into the
/// `RESERVED <id> <bytes>\r\n<body>\r\n` frame on its own socket.
#[derive(Debug)]
pub struct ReservedJob {
    pub id: JobId,
    pub pri: Pri,
    pub body: Bytes,
}

/// Bookkeeping for a session blocked in `reserve`/`reserve-with-timeout`:
/// which tubes it was registered against (so a successful match elsewhere
/// can be cleaned up from all of them) and the channel used to deliver the
/// eventual result.
pub struct Waiting {
    pub tubes: Vec<TubeName>,
    pub reply: oneshot::Sender<ReservedJob>,
}

/// Per-connection state, held in the shared registry alongside jobs and
/// tubes rather than behind bidirectional job/session pointers.
pub struct SessionRecord {
    pub peer_address: SocketAddr,
    pub using: Option<TubeName>,
    pub watching: Vec<TubeName>,
    pub held_job: Option<JobId>,
    pub waiting: Option<Waiting>,
    pub is_producer: bool,
    pub is_worker: bool,
}

impl SessionRecord {
    pub fn new(peer_address: SocketAddr) -> Self {
        SessionRecord {
            peer_address,
            using: None,
            watching: vec![TubeName::default_tube()],
            held_job: None,
            waiting: None,
            is_producer: false,
            is_worker: false,
        }
    }
}
