//! A cooperative engine that probes many nodes concurrently.
//!
//! Each probe is a small state machine walking Initiate → TlsHandshake →
//! Send → RecvLen → RecvRpc. Progress is driven by stream readiness, so any
//! number of probes multiplex over the task that awaits [`Scanner::run`]
//! without spawning threads.


use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bson::Document;
use futures_util::{stream::FuturesUnordered, task::AtomicWaker, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    client::options::ServerAddress,
    error::{Error, ErrorKind, Result},
    runtime::{AsyncStream, BaseStream, TlsConfig},
    wire::{self, Header, OwnedReply, Query, QueryFlags, Rpc, RpcBody},
};

type ConnectFuture = Pin<Box<dyn Future<Output = Result<BaseStream>> + Send>>;
type HandshakeFuture = Pin<
    Box<
        dyn Future<Output = std::io::Result<tokio_rustls::client::TlsStream<BaseStream>>> + Send,
    >,
>;

enum CommandState {
    /// Waiting on the initiator to produce a connected base stream.
    Initiate(ConnectFuture),
    /// Waiting on TLS negotiation over the base stream.
    TlsHandshake(HandshakeFuture),
    /// Writing the gathered command bytes.
    Send {
        stream: AsyncStream,
        bytes: Vec<u8>,
        written: usize,
    },
    /// Reading the 4-byte length prefix of the reply.
    RecvLen {
        stream: AsyncStream,
        prefix: [u8; 4],
        filled: usize,
    },
    /// Reading the remainder of the reply message.
    RecvRpc {
        stream: AsyncStream,
        message: Vec<u8>,
        filled: usize,
    },
    /// Terminal; the outcome has been produced.
    Finished,
}

/// The result of one probe command.
pub(crate) struct ProbeOutcome {
    /// Caller-chosen identifier, typically a node index.
    pub(crate) token: usize,
    /// Wall time from initiation to completion.
    pub(crate) round_trip: Duration,
    pub(crate) result: Result<ProbeSuccess>,
}

#[derive(Debug)]
pub(crate) struct ProbeSuccess {
    /// The first reply document.
    pub(crate) document: Document,
    /// The connected stream, available for adoption by the cluster.
    pub(crate) stream: AsyncStream,
}

/// Flips a probe into the cancelled state; consumed on its next poll.
#[derive(Clone)]
pub(crate) struct ProbeHandle {
    cancelled: Arc<CancelFlag>,
}

#[derive(Default)]
struct CancelFlag {
    flag: AtomicBool,
    waker: AtomicWaker,
}

impl ProbeHandle {
    pub(crate) fn cancel(&self) {
        self.cancelled.flag.store(true, Ordering::SeqCst);
        self.cancelled.waker.wake();
    }
}

pub(crate) struct AsyncCommand {
    token: usize,
    state: CommandState,
    request_id: i32,
    started: Instant,
    deadline: Pin<Box<tokio::time::Sleep>>,
    cancelled: Arc<CancelFlag>,
    tls: Option<(TlsConfig, String)>,
    /// The serialized command, handed to the Send state once a stream
    /// exists.
    bytes: Vec<u8>,
}

impl AsyncCommand {
    fn outcome(&self, result: Result<ProbeSuccess>) -> ProbeOutcome {
        ProbeOutcome {
            token: self.token,
            round_trip: self.started.elapsed(),
            result,
        }
    }
}

impl Future for AsyncCommand {
    type Output = ProbeOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        this.cancelled.waker.register(cx.waker());
        if this.cancelled.flag.load(Ordering::SeqCst) {
            this.state = CommandState::Finished;
            return Poll::Ready(this.outcome(Err(Error::internal("probe cancelled"))));
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.state = CommandState::Finished;
            return Poll::Ready(this.outcome(Err(Error::network_timeout())));
        }

        loop {
            match std::mem::replace(&mut this.state, CommandState::Finished) {
                CommandState::Initiate(mut connect) => match connect.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = CommandState::Initiate(connect);
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(error)) => return Poll::Ready(this.outcome(Err(error))),
                    Poll::Ready(Ok(base)) => match this.tls.take() {
                        Some((config, host)) => {
                            let handshake = match config.start(&host, base) {
                                Ok(handshake) => handshake,
                                Err(error) => return Poll::Ready(this.outcome(Err(error))),
                            };
                            this.state = CommandState::TlsHandshake(Box::pin(handshake));
                        }
                        None => {
                            this.state = CommandState::Send {
                                stream: AsyncStream::Plain(base),
                                bytes: std::mem::take(&mut this.bytes),
                                written: 0,
                            };
                        }
                    },
                },

                CommandState::TlsHandshake(mut handshake) => match handshake.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = CommandState::TlsHandshake(handshake);
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(error)) => {
                        return Poll::Ready(this.outcome(Err(error.into())))
                    }
                    Poll::Ready(Ok(session)) => {
                        this.state = CommandState::Send {
                            stream: AsyncStream::Tls(Box::new(session)),
                            bytes: std::mem::take(&mut this.bytes),
                            written: 0,
                        };
                    }
                },

                CommandState::Send {
                    mut stream,
                    bytes,
                    mut written,
                } => {
                    let poll = Pin::new(&mut stream).poll_write(cx, &bytes[written..]);
                    match poll {
                        Poll::Pending => {
                            this.state = CommandState::Send {
                                stream,
                                bytes,
                                written,
                            };
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(error)) => {
                            return Poll::Ready(this.outcome(Err(error.into())))
                        }
                        Poll::Ready(Ok(n)) => {
                            written += n;
                            if written < bytes.len() {
                                this.state = CommandState::Send {
                                    stream,
                                    bytes,
                                    written,
                                };
                            } else {
                                this.state = CommandState::RecvLen {
                                    stream,
                                    prefix: [0u8; 4],
                                    filled: 0,
                                };
                            }
                        }
                    }
                }

                CommandState::RecvLen {
                    mut stream,
                    mut prefix,
                    mut filled,
                } => {
                    let mut read_buf = ReadBuf::new(&mut prefix[filled..]);
                    match Pin::new(&mut stream).poll_read(cx, &mut read_buf) {
                        Poll::Pending => {
                            this.state = CommandState::RecvLen {
                                stream,
                                prefix,
                                filled,
                            };
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(error)) => {
                            return Poll::Ready(this.outcome(Err(error.into())))
                        }
                        Poll::Ready(Ok(())) => {
                            let n = read_buf.filled().len();
                            if n == 0 {
                                return Poll::Ready(this.outcome(Err(closed_error())));
                            }
                            filled += n;
                            if filled < prefix.len() {
                                this.state = CommandState::RecvLen {
                                    stream,
                                    prefix,
                                    filled,
                                };
                                continue;
                            }

                            let msg_len = i32::from_le_bytes(prefix);
                            if msg_len < Header::LENGTH as i32 || msg_len > wire::MAX_MESSAGE_SIZE
                            {
                                return Poll::Ready(this.outcome(Err(Error::new(
                                    ErrorKind::MessageSize {
                                        message: format!(
                                            "probe reply length {} is outside the valid range",
                                            msg_len
                                        ),
                                    },
                                ))));
                            }

                            let mut message = vec![0u8; msg_len as usize];
                            message[..4].copy_from_slice(&prefix);
                            this.state = CommandState::RecvRpc {
                                stream,
                                message,
                                filled: 4,
                            };
                        }
                    }
                }

                CommandState::RecvRpc {
                    mut stream,
                    mut message,
                    mut filled,
                } => {
                    let mut read_buf = ReadBuf::new(&mut message[filled..]);
                    match Pin::new(&mut stream).poll_read(cx, &mut read_buf) {
                        Poll::Pending => {
                            this.state = CommandState::RecvRpc {
                                stream,
                                message,
                                filled,
                            };
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(error)) => {
                            return Poll::Ready(this.outcome(Err(error.into())))
                        }
                        Poll::Ready(Ok(())) => {
                            let n = read_buf.filled().len();
                            if n == 0 {
                                return Poll::Ready(this.outcome(Err(closed_error())));
                            }
                            filled += n;
                            if filled < message.len() {
                                this.state = CommandState::RecvRpc {
                                    stream,
                                    message,
                                    filled,
                                };
                                continue;
                            }

                            let result = finish_probe(&message, this.request_id, stream);
                            return Poll::Ready(this.outcome(result));
                        }
                    }
                }

                CommandState::Finished => {
                    unreachable!("probe command polled after completion")
                }
            }
        }
    }
}

fn closed_error() -> Error {
    ErrorKind::from(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed during probe",
    ))
    .into()
}

fn finish_probe(message: &[u8], request_id: i32, stream: AsyncStream) -> Result<ProbeSuccess> {
    let rpc = Rpc::scatter(message)?;
    if rpc.response_to != request_id {
        return Err(Error::invalid_response(format!(
            "probe reply answers request {} but {} was sent",
            rpc.response_to, request_id
        )));
    }
    let reply = OwnedReply::from_rpc(&rpc)?;
    let raw = reply
        .first_document()?
        .ok_or_else(|| Error::invalid_response("probe reply carried no documents"))?;
    let document = bson::from_slice(raw.as_bytes())?;
    Ok(ProbeSuccess { document, stream })
}

/// Runs a batch of probe commands to completion, yielding outcomes in the
/// order they finish.
pub(crate) struct Scanner {
    commands: FuturesUnordered<AsyncCommand>,
}

impl Scanner {
    pub(crate) fn new() -> Self {
        Self {
            commands: FuturesUnordered::new(),
        }
    }

    /// Queues a probe of `address`: connect, optionally negotiate TLS, send
    /// `command` against `db.$cmd`, and read one reply.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn probe(
        &mut self,
        token: usize,
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        tls: Option<(TlsConfig, String)>,
        db: &str,
        command: &Document,
        timeout: Duration,
        request_id: i32,
    ) -> Result<ProbeHandle> {
        let namespace = format!("{}.$cmd", db);
        let query = bson::to_vec(command)?;
        let mut rpc = Rpc::new(RpcBody::Query(Query {
            flags: QueryFlags::SLAVE_OK,
            namespace: &namespace,
            skip: 0,
            num_to_return: -1,
            query: &query,
            fields: None,
        }));
        rpc.request_id = request_id;
        let bytes = rpc.gather().to_bytes();

        let cancelled = Arc::new(CancelFlag::default());
        let connect: ConnectFuture =
            Box::pin(async move { BaseStream::connect(&address, connect_timeout).await });

        self.commands.push(AsyncCommand {
            token,
            state: CommandState::Initiate(connect),
            request_id,
            started: Instant::now(),
            deadline: Box::pin(tokio::time::sleep(timeout)),
            cancelled: Arc::clone(&cancelled),
            tls,
            bytes,
        });

        Ok(ProbeHandle { cancelled })
    }

    /// Drives every queued command to completion.
    pub(crate) async fn run(&mut self) -> Vec<ProbeOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.commands.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}
