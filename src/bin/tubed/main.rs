mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;
use tubeline::core::{self, Broker, DispatchReply};
use tubeline::wire::events::BeanstalkClientEvent;
use tubeline::wire::{self, decoder, Codec};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation and termination channel.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(111);
        },
    };

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);
    let broker = Broker::new(args.max_job_size);

    let exit_code =
        match accept_loop(cancel, shutdown_hold, listener, broker).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "encountered runtime error");
                ExitCode::FAILURE
            },
        };

    shutdown_wait.recv().await;

    exit_code
}

async fn accept_loop(
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
    listener: TcpListener,
    broker: Arc<Broker>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle each
    // connection as its own task.
    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                tokio::spawn(do_client_loop(
                    cancel.clone(),
                    shutdown_hold.clone(),
                    conn,
                    Arc::clone(&broker),
                ));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

/// Per-connection state accumulated while a `put`'s body is still streaming
/// in: the header fields seen before the first `PutChunk`, plus the bytes
/// collected so far.
struct PendingPut {
    pri: u32,
    delay: u32,
    ttr: u32,
    body: BytesMut,
}

#[instrument(name = "client_loop", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn do_client_loop(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    conn: TcpStream,
    broker: Arc<Broker>,
) -> Result<()> {
    use wire::protocol::*;

    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;
    let peer_address = conn.peer_addr()?;

    let mut framed = wire::framed(conn, broker.max_job_size());
    let session_id = broker.create_session(peer_address);
    let mut pending_put: Option<PendingPut> = None;

    let conn_result = loop {
        let evt = select! {
            x = framed.next() => match x {
                None => {
                    debug!("connection dropped");
                    break Ok(())
                },
                Some(r) => r,
            },
            _ = cancel.cancelled() => break Ok(()),
        };

        let evt = match evt {
            Ok(BeanstalkClientEvent::Discarded) => continue,
            Ok(e) => e,
            Err(decoder::Error::IO(e)) => break Err(e.into()),
            Err(decoder::Error::Client(resp)) => {
                // A framing-level client error (oversize body, missing
                // trailing CRLF, unrecognised command) doesn't end the
                // session: the decoder has already resynchronised to the
                // next line, so just report it and keep reading.
                pending_put = None;
                select! {
                    x = framed.send(resp) => x?,
                    _ = cancel.cancelled() => break Ok(()),
                }
                continue;
            },
        };

        match evt {
            BeanstalkClientEvent::Command(Command::Put { pri, delay, ttr, n_bytes }) => {
                pending_put = Some(PendingPut {
                    pri,
                    delay,
                    ttr,
                    body: BytesMut::with_capacity(n_bytes as usize),
                });
                continue;
            },

            BeanstalkClientEvent::PutChunk(chunk) => {
                if let Some(put) = pending_put.as_mut() {
                    put.body.extend_from_slice(&chunk);
                }
                continue;
            },

            BeanstalkClientEvent::PutEnd => {
                let Some(put) = pending_put.take() else {
                    continue;
                };
                let reply = core::dispatch_put(
                    &broker,
                    session_id,
                    put.pri,
                    put.delay,
                    put.ttr,
                    put.body.freeze(),
                );
                if send_reply(&mut framed, reply, &cancel).await? {
                    break Ok(());
                }
                continue;
            },

            BeanstalkClientEvent::Command(Command::Quit) => break Ok(()),

            BeanstalkClientEvent::Command(cmd) => {
                let reply = core::dispatch(&broker, session_id, cmd, &cancel).await;
                if send_reply(&mut framed, reply, &cancel).await? {
                    break Ok(());
                }
            },

            // Filtered out above, before this match, via `continue`.
            BeanstalkClientEvent::Discarded => continue,
        }
    };

    broker.teardown_session(session_id);

    framed
        .into_inner()
        .shutdown()
        .await
        .context("during shutdown")?;

    conn_result
}

/// Sends a dispatched reply. Returns `Ok(true)` if the connection should
/// close (the client sent `quit`, or the process is shutting down while the
/// session was blocked in `reserve`).
async fn send_reply(
    framed: &mut Framed<TcpStream, Codec>,
    reply: DispatchReply,
    cancel: &CancellationToken,
) -> Result<bool> {
    use wire::protocol::Response;

    match reply {
        DispatchReply::Quit => Ok(true),
        DispatchReply::ShuttingDown => Ok(true),
        DispatchReply::Simple(resp) => {
            select! {
                x = framed.send(resp) => { x?; Ok(false) },
                _ = cancel.cancelled() => Ok(true),
            }
        },
        DispatchReply::Job { header, body } => {
            select! {
                x = send_job(framed, header, body) => { x?; Ok(false) },
                _ = cancel.cancelled() => Ok(true),
            }
        },
    }
}

async fn send_job(
    framed: &mut Framed<TcpStream, Codec>,
    header: wire::protocol::Response,
    body: Bytes,
) -> Result<()> {
    use wire::protocol::Response;

    framed.feed(header).await?;
    framed.feed(Response::JobChunk(body)).await?;
    framed.send(Response::JobEnd).await?;
    Ok(())
}
