//! Story execution engine.
//!
//! A run is split into two activities that share one connection:
//!
//! - the *listener* reads every backend message off the connection and pushes it
//!   onto a bounded FIFO buffer;
//! - the *driver* walks the story's steps, writing commands and popping the buffer
//!   for each expected response.
//!
//! The calling thread waits for the first of: an error from either activity, the
//! driver finishing, the global timeout, or an external interrupt. It then cancels
//! both activities and joins them before returning, so the connection is free again
//! when [`StoryRunner::run`] returns.
use std::{io, thread, time::Duration};

use crossbeam_channel::{Receiver, Sender, TryRecvError, after, bounded, never, select};
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::protocol::{BackendMessage, Duplex, ProtocolTransport, TransportError};

use super::{Filter, Mismatch, Step, Story, compare};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Budget for the whole story.
    pub timeout: Duration,
    /// Backend messages held before the listener blocks.
    pub buffer_capacity: usize,
    /// Read and write timeout used to notice cancellation.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to send step #{step}: {source}")]
    Send {
        step: usize,
        #[source]
        source: TransportError,
    },

    #[error("failed to receive backend message: {0}")]
    Receive(#[source] TransportError),

    #[error("step #{step}: {source}")]
    Mismatch {
        step: usize,
        #[source]
        source: Mismatch,
    },

    #[error("backend messages exist in buffer before step #{step} ({count} unread)")]
    PendingMessages { step: usize, count: usize },

    #[error("backend messages exist in buffer after the last step ({count} unread)")]
    LeftoverMessages { count: usize },

    #[error("receiver stopped before step #{0} got a message")]
    ReceiverStopped(usize),

    #[error("timeout reached after {0:?}")]
    Timeout(Duration),

    #[error("story interrupted")]
    Interrupted,

    #[error("failed to prepare connection: {0}")]
    Connection(#[from] io::Error),
}

/// Replays stories over a connection it owns.
///
/// Bytes of a frame that was only partly received when a run ended are kept
/// for the next run on the same connection.
pub struct StoryRunner<C: Duplex> {
    conn: C,
    config: RunnerConfig,
    interrupt: Receiver<()>,
    pending: Vec<u8>,
}

impl<C: Duplex> StoryRunner<C> {
    pub fn new(conn: C, config: RunnerConfig) -> Self {
        Self {
            conn,
            config,
            interrupt: never(),
            pending: Vec::new(),
        }
    }

    /// Aborts a run as soon as a message arrives on (or the sender of) `interrupt`.
    pub fn with_interrupt(mut self, interrupt: Receiver<()>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    /// Runs every step of `story`, returning the first failure.
    pub fn run(&mut self, story: &Story) -> Result<(), RunError> {
        info!("running story '{}' ({} steps)", story.name, story.steps.len());

        let reader = self.conn.try_split()?;
        let writer = self.conn.try_split()?;
        reader.set_read_timeout(Some(self.config.poll_interval))?;
        writer.set_write_timeout(Some(self.config.poll_interval))?;

        let (buffer_tx, buffer_rx) = bounded(self.config.buffer_capacity);
        let (error_tx, error_rx) = bounded::<RunError>(2);
        let (done_tx, done_rx) = bounded::<()>(1);
        // Never sent on; dropping it cancels both activities.
        let (cancel_tx, cancel_rx) = bounded::<()>(0);

        let pending = std::mem::take(&mut self.pending);
        let config = &self.config;
        let interrupt = &self.interrupt;
        let (outcome, pending) = thread::scope(|s| {
            let mut listener = Listener {
                transport: ProtocolTransport::with_pending(reader, pending),
                buffer: buffer_tx,
                cancel: cancel_rx.clone(),
                filter: story.filter.clone(),
            };
            let errors = error_tx.clone();
            let listening = s.spawn(move || {
                if let Err(e) = listener.run() {
                    let _ = errors.try_send(e);
                }
                listener.transport.into_pending()
            });

            let mut driver = Driver {
                transport: ProtocolTransport::new(writer),
                buffer: buffer_rx,
                cancel: cancel_rx,
            };
            let steps = &story.steps;
            s.spawn(move || match driver.run(steps) {
                Ok(()) => {
                    let _ = done_tx.send(());
                }
                Err(e) => {
                    let _ = error_tx.try_send(e);
                }
            });

            let timer = after(config.timeout);
            let outcome = select! {
                recv(error_rx) -> err => match err {
                    Ok(err) => Err(err),
                    Err(_) => Ok(()),
                },
                recv(done_rx) -> _ => Ok(()),
                recv(timer) -> _ => Err(RunError::Timeout(config.timeout)),
                recv(interrupt) -> _ => Err(RunError::Interrupted),
            };
            drop(cancel_tx);
            (outcome, listening.join().unwrap_or_default())
        });
        if !pending.is_empty() {
            debug!("keeping {} bytes of a partial frame", pending.len());
        }
        self.pending = pending;

        if let Err(e) = self.conn.set_read_timeout(None) {
            warn!("failed to reset connection read timeout: {e}");
        }
        if let Err(e) = self.conn.set_write_timeout(None) {
            warn!("failed to reset connection write timeout: {e}");
        }

        match &outcome {
            Ok(()) => info!("story '{}' passed", story.name),
            Err(e) => info!("story '{}' failed: {e}", story.name),
        }
        outcome
    }
}

fn cancelled(cancel: &Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Err(TryRecvError::Disconnected))
}

/// Reads backend messages into the response buffer until cancelled or failed.
struct Listener<T: Duplex> {
    transport: ProtocolTransport<T>,
    buffer: Sender<BackendMessage>,
    cancel: Receiver<()>,
    filter: Option<Filter>,
}

impl<T: Duplex> Listener<T> {
    fn run(&mut self) -> Result<(), RunError> {
        loop {
            if cancelled(&self.cancel) {
                return Ok(());
            }

            let msg = match self.transport.read_backend() {
                Ok(msg) => msg,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(RunError::Receive(e)),
            };
            debug!("<<== {msg:?}");

            if let Some(filter) = &self.filter {
                if filter(&msg) {
                    debug!("terminal message received: {}", msg.kind());
                }
            }

            select! {
                send(self.buffer, msg) -> res => {
                    // The driver has finished and dropped the buffer.
                    if res.is_err() {
                        return Ok(());
                    }
                },
                recv(self.cancel) -> _ => return Ok(()),
            }
            trace!("response buffer holds {} messages", self.buffer.len());
        }
    }
}

/// Walks the steps: sends commands, matches buffered messages to responses.
struct Driver<T: Duplex> {
    transport: ProtocolTransport<T>,
    buffer: Receiver<BackendMessage>,
    cancel: Receiver<()>,
}

impl<T: Duplex> Driver<T> {
    fn run(&mut self, steps: &[Step]) -> Result<(), RunError> {
        for (i, step) in steps.iter().enumerate() {
            let step_no = i + 1;
            match step {
                Step::Command(msg) => {
                    if !self.buffer.is_empty() {
                        return Err(RunError::PendingMessages {
                            step: step_no,
                            count: self.buffer.len(),
                        });
                    }
                    debug!("==>> {msg:?}");
                    let cancel = &self.cancel;
                    self.transport
                        .write_frontend_while(msg, || !cancelled(cancel))
                        .map_err(|source| match source {
                            TransportError::Cancelled => RunError::Interrupted,
                            source => RunError::Send {
                                step: step_no,
                                source,
                            },
                        })?;
                }
                Step::Response(expected) => {
                    let actual = select! {
                        recv(self.buffer) -> msg => {
                            msg.map_err(|_| RunError::ReceiverStopped(step_no))?
                        },
                        recv(self.cancel) -> _ => return Err(RunError::Interrupted),
                    };
                    compare(expected, &actual).map_err(|source| RunError::Mismatch {
                        step: step_no,
                        source,
                    })?;
                }
            }
        }

        if !self.buffer.is_empty() {
            return Err(RunError::LeftoverMessages {
                count: self.buffer.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        net::TcpStream,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Instant,
    };

    use super::*;
    use crate::{
        protocol::{ErrorFields, FrontendMessage, MessageKind},
        story::StoryBuilder,
        testing::{drain, synthetic_backend},
    };

    fn ready() -> BackendMessage {
        BackendMessage::ReadyForQuery { status: b'I' }
    }

    fn query_story() -> Story {
        StoryBuilder::new(&b"=== t\n-> Q \"SELECT 1\"\n<- Z\n===\n"[..], vec![])
            .parse_next()
            .unwrap()
            .unwrap()
    }

    fn quick() -> RunnerConfig {
        RunnerConfig {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Driver over a socket whose peer ignores everything written to it.
    fn driver(buffer: Receiver<BackendMessage>) -> (Driver<TcpStream>, Sender<()>) {
        let (conn, _backend) = synthetic_backend(drain);
        let (cancel_tx, cancel_rx) = bounded(0);
        let driver = Driver {
            transport: ProtocolTransport::new(conn),
            buffer,
            cancel: cancel_rx,
        };
        (driver, cancel_tx)
    }

    #[test]
    fn query_story_passes() {
        let (conn, backend) = synthetic_backend(|mut t| {
            assert_eq!(
                t.read_frontend().unwrap(),
                FrontendMessage::Query {
                    query: "SELECT 1".into()
                }
            );
            t.write_backend(&ready()).unwrap();
            drain(t);
        });

        let mut runner = StoryRunner::new(conn, quick());
        runner.run(&query_story()).unwrap();
        drop(runner);
        backend.join().unwrap();
    }

    #[test]
    fn error_instead_of_ready_is_a_kind_mismatch() {
        let (conn, _backend) = synthetic_backend(|mut t| {
            t.read_frontend().unwrap();
            t.write_backend(&BackendMessage::ErrorResponse(ErrorFields::with_code("42601")))
                .unwrap();
            drain(t);
        });

        let err = StoryRunner::new(conn, quick())
            .run(&query_story())
            .unwrap_err();
        assert!(
            matches!(
                err,
                RunError::Mismatch {
                    step: 2,
                    source: Mismatch::Kind {
                        expected: MessageKind::ReadyForQuery,
                        actual: MessageKind::ErrorResponse,
                    },
                }
            ),
            "{err:?}"
        );
    }

    #[test]
    fn error_codes_are_matched() {
        let story = |code: &str| {
            Story::new(
                "code",
                vec![
                    Step::Command(FrontendMessage::Sync),
                    Step::error_response(code),
                    Step::response(MessageKind::ReadyForQuery),
                ],
            )
        };
        let backend = || {
            synthetic_backend(|mut t| {
                t.read_frontend().unwrap();
                t.write_backend(&BackendMessage::ErrorResponse(ErrorFields::with_code("26000")))
                    .unwrap();
                t.write_backend(&ready()).unwrap();
                drain(t);
            })
        };

        let (conn, _backend) = backend();
        StoryRunner::new(conn, quick()).run(&story("")).unwrap();

        let (conn, _backend) = backend();
        StoryRunner::new(conn, quick()).run(&story("26000")).unwrap();

        let (conn, _backend) = backend();
        let err = StoryRunner::new(conn, quick())
            .run(&story("42P01"))
            .unwrap_err();
        assert!(
            matches!(
                err,
                RunError::Mismatch {
                    step: 2,
                    source: Mismatch::Code { .. }
                }
            ),
            "{err:?}"
        );
    }

    #[test]
    fn responses_match_in_arrival_order() {
        let kinds = [
            MessageKind::ParseComplete,
            MessageKind::BindComplete,
            MessageKind::DataRow,
            MessageKind::PortalSuspended,
            MessageKind::DataRow,
            MessageKind::CommandComplete,
            MessageKind::ReadyForQuery,
        ];
        let mut steps = vec![Step::Command(FrontendMessage::Sync)];
        steps.extend(kinds.iter().map(|k| Step::response(*k)));

        let (conn, _backend) = synthetic_backend(move |mut t| {
            t.read_frontend().unwrap();
            for kind in kinds {
                t.write_backend(&BackendMessage::empty(kind)).unwrap();
            }
            drain(t);
        });

        StoryRunner::new(conn, quick())
            .run(&Story::new("ordered", steps))
            .unwrap();
    }

    #[test]
    fn silent_backend_times_out() {
        let (conn, _backend) = synthetic_backend(drain);
        let config = RunnerConfig {
            timeout: Duration::from_millis(200),
            ..quick()
        };

        let started = Instant::now();
        let err = StoryRunner::new(conn, config)
            .run(&query_story())
            .unwrap_err();
        assert!(matches!(err, RunError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn connection_is_reusable_after_timeout() {
        let (conn, _backend) = synthetic_backend(|mut t| {
            // First query is ignored, the second one answered.
            t.read_frontend().unwrap();
            t.read_frontend().unwrap();
            t.write_backend(&ready()).unwrap();
            drain(t);
        });
        let mut runner = StoryRunner::new(
            conn,
            RunnerConfig {
                timeout: Duration::from_millis(200),
                ..quick()
            },
        );

        assert!(matches!(
            runner.run(&query_story()),
            Err(RunError::Timeout(_))
        ));
        runner.run(&query_story()).unwrap();
    }

    #[test]
    fn backend_that_stops_reading_times_out() {
        let (release, hold) = bounded::<()>(0);
        let (conn, _backend) = synthetic_backend(move |t| {
            // Never reads, so the client's socket buffers fill up.
            let _ = hold.recv();
            drop(t);
        });
        let story = Story::new(
            "flood",
            vec![
                Step::Command(FrontendMessage::Query {
                    query: "x".repeat(64 << 20),
                }),
                Step::response(MessageKind::ReadyForQuery),
            ],
        );
        let config = RunnerConfig {
            timeout: Duration::from_millis(200),
            ..quick()
        };

        let started = Instant::now();
        let err = StoryRunner::new(conn, config).run(&story).unwrap_err();
        assert!(matches!(err, RunError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(release);
    }

    #[test]
    fn partial_frame_survives_timeout() {
        let frame = ready().encode().unwrap();
        let (conn, _backend) = synthetic_backend(move |mut t| {
            let mut raw = t.get_ref().try_clone().unwrap();
            assert_eq!(t.read_frontend().unwrap(), FrontendMessage::Sync);
            raw.write_all(&frame[..3]).unwrap();
            assert_eq!(t.read_frontend().unwrap(), FrontendMessage::Sync);
            raw.write_all(&frame[3..]).unwrap();
            drain(t);
        });
        let story = Story::new(
            "sync",
            vec![
                Step::Command(FrontendMessage::Sync),
                Step::response(MessageKind::ReadyForQuery),
            ],
        );
        let mut runner = StoryRunner::new(
            conn,
            RunnerConfig {
                timeout: Duration::from_millis(200),
                ..quick()
            },
        );

        assert!(matches!(runner.run(&story), Err(RunError::Timeout(_))));
        runner.run(&story).unwrap();
    }

    #[test]
    fn closed_connection_is_a_receive_error() {
        let (conn, _backend) = synthetic_backend(|mut t| {
            t.read_frontend().unwrap();
        });

        let err = StoryRunner::new(conn, quick())
            .run(&query_story())
            .unwrap_err();
        assert!(
            matches!(err, RunError::Receive(TransportError::Closed)),
            "{err:?}"
        );
    }

    #[test]
    fn interrupt_stops_the_run() {
        let (conn, _backend) = synthetic_backend(drain);
        let (tx, rx) = bounded(1);
        tx.send(()).unwrap();

        let err = StoryRunner::new(conn, quick())
            .with_interrupt(rx)
            .run(&query_story())
            .unwrap_err();
        assert!(matches!(err, RunError::Interrupted), "{err:?}");
    }

    #[test]
    fn filter_sees_every_message() {
        let (conn, _backend) = synthetic_backend(|mut t| {
            t.read_frontend().unwrap();
            t.write_backend(&BackendMessage::CommandComplete {
                tag: "SELECT 1".into(),
            })
            .unwrap();
            t.write_backend(&ready()).unwrap();
            drain(t);
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let story = Story::new(
            "filtered",
            vec![
                Step::Command(FrontendMessage::Query {
                    query: "SELECT 1".into(),
                }),
                Step::response(MessageKind::CommandComplete),
                Step::response(MessageKind::ReadyForQuery),
            ],
        )
        .with_filter(move |msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            msg.kind() == MessageKind::ReadyForQuery
        });

        StoryRunner::new(conn, quick()).run(&story).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn command_with_pending_messages_fails() {
        let (tx, rx) = bounded(10);
        tx.send(ready()).unwrap();
        let (mut driver, _cancel) = driver(rx);

        let err = driver
            .run(&[Step::Command(FrontendMessage::Sync)])
            .unwrap_err();
        assert!(
            matches!(err, RunError::PendingMessages { step: 1, count: 1 }),
            "{err:?}"
        );
    }

    #[test]
    fn pending_messages_fail_at_any_position() {
        let (tx, rx) = bounded(10);
        tx.send(ready()).unwrap();
        tx.send(ready()).unwrap();
        let (mut driver, _cancel) = driver(rx);

        let err = driver
            .run(&[
                Step::Command(FrontendMessage::Sync),
                Step::response(MessageKind::ReadyForQuery),
                Step::Command(FrontendMessage::Sync),
            ])
            .unwrap_err();
        assert!(
            matches!(err, RunError::PendingMessages { step: 3, count: 1 }),
            "{err:?}"
        );
    }

    #[test]
    fn leftover_messages_fail() {
        let (tx, rx) = bounded(10);
        tx.send(ready()).unwrap();
        tx.send(BackendMessage::NoData).unwrap();
        let (mut driver, _cancel) = driver(rx);

        let err = driver
            .run(&[Step::response(MessageKind::ReadyForQuery)])
            .unwrap_err();
        assert!(
            matches!(err, RunError::LeftoverMessages { count: 1 }),
            "{err:?}"
        );
    }

    #[test]
    fn driver_observes_cancellation() {
        let (_tx, rx) = bounded(10);
        let (mut driver, cancel) = driver(rx);
        drop(cancel);

        let err = driver
            .run(&[Step::response(MessageKind::ReadyForQuery)])
            .unwrap_err();
        assert!(matches!(err, RunError::Interrupted), "{err:?}");
    }

    #[test]
    fn driver_reports_stopped_receiver() {
        let (tx, rx) = bounded::<BackendMessage>(10);
        drop(tx);
        let (mut driver, _cancel) = driver(rx);

        let err = driver
            .run(&[Step::response(MessageKind::ReadyForQuery)])
            .unwrap_err();
        assert!(matches!(err, RunError::ReceiverStopped(1)), "{err:?}");
    }
}
