use bytes::Bytes;
use serde::Serialize;

use crate::types::states::JobState;
use crate::types::tube::TubeStats;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Places a job onto the currently `use`d queue.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job from all the `watch`ed queues, blocking until one appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but after `timeout` seconds pass, a `TIMED_OUT` response
    /// is sent instead.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Reserves a job with a given id directly, skipping the ready queue.
    ///
    /// On the wire: `reserve-job <id>`
    ReserveJob { id: u64 },
    /// Releases a job reserved by the same client, returning it to the ready
    /// (or delayed) queue.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Deletes a job reserved by the same client, or in the ready or delayed
    /// states.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Not implemented: no buried state exists in this server. Recognised
    /// only so the framer can resynchronise on it.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Refreshes the Time To Run (TTR) of a job reserved by the same client.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u64 },
    /// Adds a tube to the watchlist for this client.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: Vec<u8> },
    /// Reverses the effect of `watch` on this client.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: Vec<u8> },
    /// Returns the data for the job with this id, regardless of its state.
    ///
    /// On the wire: `peek <id>`
    Peek { id: u64 },
    /// Returns the data for the next ready job on the currently-used tube.
    ///
    /// On the wire: `peek-ready`
    PeekReady,
    /// Returns the data for the next delayed job on the currently-used tube.
    ///
    /// On the wire: `peek-delayed`
    PeekDelayed,
    /// Not implemented: no buried state exists in this server.
    ///
    /// On the wire: `peek-buried`
    PeekBuried,
    /// Not implemented: no buried/kick chain exists in this server.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u64 },
    /// Not implemented: no buried/kick chain exists in this server.
    ///
    /// On the wire: `kick-job <id>`
    KickJob { id: u64 },
    /// Provides information about the job with the given id.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u64 },
    /// Returns information about a tube.
    ///
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: Vec<u8> },
    /// Exposes information about the server.
    ///
    /// On the wire: `stats`
    StatsServer,
    /// Returns a list of every tube that currently exists.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// Returns the tube name this client is currently using.
    ///
    /// On the wire: `list-tubes-used`
    ListTubesUsed,
    /// Returns the tubes this client is currently watching.
    ///
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
    /// Pauses a tube, preventing new jobs being reserved for `delay` seconds.
    ///
    /// On the wire: `pause-tube <tube> <delay>`
    PauseTube { tube: Vec<u8>, delay: u32 },
    /// On the wire: `use <tube>`
    Use { tube: Vec<u8> },
}

/// All possible response types to a command.
#[derive(Debug, PartialEq)]
pub enum Response {
    /// The client sent a bad request, typically because:
    ///
    /// * The request exceeded 224 bytes, including trailing CRLF.
    /// * A tube name exceeded 200 bytes or was invalid.
    /// * A non-number was provided where a number was expected, or the
    ///   number was out of range.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// The client sent a request with a recognised-but-unimplemented or
    /// wholly unrecognised command.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// In response to a `put`, indicates a job was created with the given
    /// id.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to a `put`, indicates the job data was not terminated by
    /// a CRLF sequence.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCRLF,
    /// In response to a `put`, indicates the job body was larger than
    /// `MAX_JOB_SIZE`.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `use` or `list-tubes-used`, indicates the client is
    /// using this tube.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: Vec<u8> },
    /// In response to a `reserve-with-timeout`, indicates the timeout
    /// provided expired with no job becoming available.
    ///
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// `reserve` issued by a session that is not watching any tube. Not
    /// reachable given every session implicitly watches `default`, but kept
    /// for parity with the wire protocol's literal text.
    ///
    /// On the wire: `Error: 'reserve' without watching a tube.`
    ReserveWithoutWatch,
    /// `put` issued by a session with no tube in use.
    ///
    /// On the wire: `Error: 'put' without using a tube.`
    PutWithoutUse,
    /// In response to a `reserve`, `reserve-with-timeout`, or
    /// `reserve-job`, provides the id and byte length of the job just
    /// reserved. The body follows as a `JobChunk` + `JobEnd`.
    ///
    /// On the wire: `RESERVED <id> <bytes>`.
    Reserved { id: u64, n_bytes: u32 },
    /// In response to a `peek`-family command, indicates success. The body
    /// follows as a `JobChunk` + `JobEnd`.
    ///
    /// On the wire: `FOUND <id> <bytes>`.
    Found { id: u64, n_bytes: u32 },
    /// A chunk of job data following a `Reserved` or `Found` response.
    JobChunk(Bytes),
    /// Terminates a job body started by a `Reserved` or `Found` response.
    JobEnd,
    /// In response to any job-by-id command, indicates the job isn't known
    /// to the server or doesn't satisfy a precondition of the command
    /// (ownership, tube existence, etc).
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `delete` command, indicates the job was deleted.
    ///
    /// On the wire: `DELETED`.
    Deleted,
    /// In response to a `release` command, indicates the job was returned
    /// to the ready or delayed state.
    ///
    /// On the wire: `RELEASED`.
    Released,
    /// In response to a `touch`, indicates the job's TTR was refreshed.
    ///
    /// On the wire: `TOUCHED`.
    Touched,
    /// In response to a `watch` or `ignore`, indicates success and the
    /// number of tubes currently watched by the client.
    ///
    /// On the wire: `WATCHING <count>`.
    Watching { count: u32 },
    /// In response to an `ignore`, indicates the command would have left
    /// the client with an empty watchlist and was refused.
    ///
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// In response to a `pause-tube`, indicates success.
    ///
    /// On the wire: `PAUSED`.
    Paused,
    /// In response to a `stats-job`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsJob { data: JobStats },
    /// In response to a `stats`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: ServerStats },
    /// In response to a `stats-tube`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsTube { data: TubeStatsResp },
    /// In response to a `list-tubes` or `list-tubes-watched`, indicates
    /// success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML *list* format.
    OkListTubes { tubes: Vec<Vec<u8>> },
}

#[derive(Debug, PartialEq, Serialize)]
pub struct JobStats {
    pub id: u64,
    pub tube: Vec<u8>,
    pub state: JobState,
    pub pri: u32,
    /// time in seconds since creation
    pub age: u64,
    /// seconds remaining until ready
    pub delay: u32,
    /// allowed processing time in seconds
    pub ttr: u32,
    /// time until the job returns to the ready queue; 0 unless reserved or
    /// delayed
    #[serde(rename = "time-left")]
    pub time_left: u32,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct TubeStatsResp {
    pub name: Vec<u8>,
    #[serde(flatten)]
    pub ts: TubeStats,
    #[serde(rename = "pause-time-left")]
    pub pause_time_left: u32,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ServerStats {
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,

    #[serde(rename = "cmd-put")]
    pub cmd_put: u64,
    #[serde(rename = "cmd-peek")]
    pub cmd_peek: u64,
    #[serde(rename = "cmd-reserve")]
    pub cmd_reserve: u64,
    #[serde(rename = "cmd-reserve-with-timeout")]
    pub cmd_reserve_with_timeout: u64,
    #[serde(rename = "cmd-touch")]
    pub cmd_touch: u64,
    #[serde(rename = "cmd-use")]
    pub cmd_use: u64,
    #[serde(rename = "cmd-watch")]
    pub cmd_watch: u64,
    #[serde(rename = "cmd-ignore")]
    pub cmd_ignore: u64,
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    #[serde(rename = "cmd-release")]
    pub cmd_release: u64,
    #[serde(rename = "cmd-stats")]
    pub cmd_stats: u64,
    #[serde(rename = "cmd-stats-job")]
    pub cmd_stats_job: u64,
    #[serde(rename = "cmd-stats-tube")]
    pub cmd_stats_tube: u64,
    #[serde(rename = "cmd-list-tubes")]
    pub cmd_list_tubes: u64,
    #[serde(rename = "cmd-list-tubes-used")]
    pub cmd_list_tubes_used: u64,
    #[serde(rename = "cmd-list-tubes-watched")]
    pub cmd_list_tubes_watched: u64,
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,

    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    #[serde(rename = "max-job-size")]
    pub max_job_size: u64,
    #[serde(rename = "current-tubes")]
    pub current_tubes: u64,
    #[serde(rename = "current-connections")]
    pub current_connections: u64,
    #[serde(rename = "current-producers")]
    pub current_producers: u64,
    #[serde(rename = "current-workers")]
    pub current_workers: u64,
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    #[serde(rename = "total-connections")]
    pub total_connections: u64,
    pub pid: u32,
    pub version: &'static str,
    pub uptime: u64,
}
