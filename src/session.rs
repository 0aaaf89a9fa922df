//! Connection setup and interactive sessions.
//!
//! [`connect`] dials a server and completes the startup handshake, leaving a
//! connection that stories can be replayed on. [`ReplSession`] runs one command
//! line at a time over such a connection.
use std::{
    fmt,
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use thiserror::Error;

use crate::{
    protocol::{
        BackendMessage, Duplex, FrontendMessage, MessageKind, PROTOCOL_VERSION, ProtocolTransport,
        TransportError,
    },
    story::{ParseError, RunError, RunnerConfig, Step, Story, StoryRunner, parse_step},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect: {0}")]
    Connect(#[from] std::io::Error),

    #[error("startup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("unsupported authentication request (code {0}), only trust is supported")]
    UnsupportedAuthentication(u32),

    #[error("server rejected startup: {message} ({code})")]
    Rejected { code: String, message: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Run(#[from] RunError),
}

/// Builds the startup message for protocol 3.0.
pub fn startup_message(user: &str, database: Option<&str>) -> FrontendMessage {
    let mut parameters = vec![("user".to_string(), user.to_string())];
    if let Some(database) = database {
        parameters.push(("database".to_string(), database.to_string()));
    }
    FrontendMessage::StartupMessage {
        protocol_version: PROTOCOL_VERSION,
        parameters,
    }
}

/// Dials `addr` and completes the startup handshake within `timeout`.
pub fn connect(
    addr: SocketAddr,
    user: &str,
    database: Option<&str>,
    timeout: Duration,
) -> Result<TcpStream, SessionError> {
    info!("connecting to {addr} as '{user}'");
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;

    let mut transport = ProtocolTransport::new(stream.try_split()?);
    handshake(&mut transport, user, database)?;

    stream.set_read_timeout(None)?;
    info!("connected to {addr}");
    Ok(stream)
}

/// Sends the startup message and reads until the server is ready for queries.
pub fn handshake<T: Duplex>(
    transport: &mut ProtocolTransport<T>,
    user: &str,
    database: Option<&str>,
) -> Result<(), SessionError> {
    transport.write_frontend(&startup_message(user, database))?;

    loop {
        match transport.read_backend()? {
            BackendMessage::Authentication { code: 0, .. } => debug!("authenticated"),
            BackendMessage::Authentication { code, .. } => {
                return Err(SessionError::UnsupportedAuthentication(code));
            }
            BackendMessage::ErrorResponse(fields) => {
                return Err(SessionError::Rejected {
                    code: fields.code().to_string(),
                    message: fields.message().to_string(),
                });
            }
            BackendMessage::ParameterStatus { name, value } => debug!("parameter {name} = {value}"),
            BackendMessage::ReadyForQuery { .. } => return Ok(()),
            msg => debug!("startup: {msg:?}"),
        }
    }
}

/// Callback receiving every backend message seen by a REPL command.
pub type Echo = Arc<dyn Fn(&BackendMessage) + Send + Sync>;

/// Interactive session over an established connection.
pub struct ReplSession<C: Duplex> {
    runner: StoryRunner<C>,
    echo: Echo,
}

impl<C: Duplex> ReplSession<C> {
    pub fn new(conn: C, config: RunnerConfig) -> Self {
        Self {
            runner: StoryRunner::new(conn, config),
            echo: Arc::new(|msg| println!("{msg:?}")),
        }
    }

    pub fn with_echo<F>(mut self, echo: F) -> Self
    where
        F: Fn(&BackendMessage) + Send + Sync + 'static,
    {
        self.echo = Arc::new(echo);
        self
    }

    /// Runs one command line such as `Q "SELECT 1"`.
    ///
    /// Commands other than Parse, Bind and Describe are expected to be answered
    /// with a ReadyForQuery.
    pub fn execute(&mut self, line: &str) -> Result<(), SessionError> {
        let step = parse_step(&format!("-> {line}"))?;
        let awaits_ready = !matches!(
            step,
            Step::Command(
                FrontendMessage::Parse { .. }
                    | FrontendMessage::Bind { .. }
                    | FrontendMessage::Describe { .. }
            )
        );

        let mut steps = vec![step];
        if awaits_ready {
            steps.push(Step::response(MessageKind::ReadyForQuery));
        }

        let echo = Arc::clone(&self.echo);
        let story = Story::new(line, steps).with_filter(move |msg| {
            echo(msg);
            msg.kind() == MessageKind::ReadyForQuery
        });

        self.runner.run(&story)?;
        Ok(())
    }
}

impl<C: Duplex> fmt::Debug for ReplSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplSession")
            .field("config", self.runner.config())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        protocol::{ErrorFields, FIELD_MESSAGE},
        story::Mismatch,
        testing::{drain, listen, synthetic_backend},
    };

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn expect_startup(t: &mut ProtocolTransport<TcpStream>) {
        assert_eq!(
            t.read_startup().unwrap(),
            startup_message("postgres", Some("stories"))
        );
    }

    #[test]
    fn connect_completes_trust_handshake() {
        let (addr, backend) = listen(|mut t| {
            expect_startup(&mut t);
            t.write_backend(&BackendMessage::Authentication {
                code: 0,
                data: vec![],
            })
            .unwrap();
            t.write_backend(&BackendMessage::ParameterStatus {
                name: "server_version".into(),
                value: "16.0".into(),
            })
            .unwrap();
            t.write_backend(&BackendMessage::BackendKeyData {
                process_id: 7,
                secret_key: 42,
            })
            .unwrap();
            t.write_backend(&BackendMessage::ReadyForQuery { status: b'I' })
                .unwrap();
            drain(t);
        });

        let conn = connect(addr, "postgres", Some("stories"), TIMEOUT).unwrap();
        drop(conn);
        backend.join().unwrap();
    }

    #[test]
    fn connect_rejects_password_authentication() {
        let (addr, _backend) = listen(|mut t| {
            expect_startup(&mut t);
            // AuthenticationCleartextPassword
            t.write_backend(&BackendMessage::Authentication {
                code: 3,
                data: vec![],
            })
            .unwrap();
            drain(t);
        });

        let err = connect(addr, "postgres", Some("stories"), TIMEOUT).unwrap_err();
        assert!(
            matches!(err, SessionError::UnsupportedAuthentication(3)),
            "{err:?}"
        );
    }

    #[test]
    fn connect_reports_startup_error() {
        let (addr, _backend) = listen(|mut t| {
            expect_startup(&mut t);
            let mut fields = ErrorFields::with_code("3D000");
            fields
                .0
                .push((FIELD_MESSAGE, "database does not exist".into()));
            t.write_backend(&BackendMessage::ErrorResponse(fields))
                .unwrap();
            drain(t);
        });

        let err = connect(addr, "postgres", Some("stories"), TIMEOUT).unwrap_err();
        assert_eq!(
            err.to_string(),
            "server rejected startup: database does not exist (3D000)"
        );
    }

    #[test]
    fn startup_message_without_database() {
        assert_eq!(
            startup_message("alice", None),
            FrontendMessage::StartupMessage {
                protocol_version: PROTOCOL_VERSION,
                parameters: vec![("user".into(), "alice".into())],
            }
        );
    }

    #[test]
    fn repl_sync_waits_for_ready() {
        let (conn, _backend) = synthetic_backend(|mut t| {
            assert_eq!(t.read_frontend().unwrap(), FrontendMessage::Sync);
            t.write_backend(&BackendMessage::ReadyForQuery { status: b'I' })
                .unwrap();
            drain(t);
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut session = ReplSession::new(conn, RunnerConfig::default())
            .with_echo(move |msg| sink.lock().unwrap().push(msg.kind()));

        session.execute("S").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![MessageKind::ReadyForQuery]);
    }

    #[test]
    fn repl_parse_expects_nothing() {
        let (conn, backend) = synthetic_backend(|mut t| {
            assert!(matches!(
                t.read_frontend().unwrap(),
                FrontendMessage::Parse { .. }
            ));
            drain(t);
        });
        let mut session = ReplSession::new(conn, RunnerConfig::default()).with_echo(|_| {});

        session.execute(r#"P "" "SELECT 1" []"#).unwrap();
        drop(session);
        backend.join().unwrap();
    }

    #[test]
    fn repl_reports_mismatch() {
        let (conn, _backend) = synthetic_backend(|mut t| {
            t.read_frontend().unwrap();
            t.write_backend(&BackendMessage::ErrorResponse(ErrorFields::with_code("42601")))
                .unwrap();
            drain(t);
        });
        let mut session = ReplSession::new(conn, RunnerConfig::default()).with_echo(|_| {});

        let err = session.execute(r#"Q "SELEC""#).unwrap_err();
        assert!(
            matches!(
                err,
                SessionError::Run(RunError::Mismatch {
                    step: 2,
                    source: Mismatch::Kind { .. }
                })
            ),
            "{err:?}"
        );
    }

    #[test]
    fn repl_rejects_bad_lines() {
        let (conn, _backend) = synthetic_backend(drain);
        let mut session = ReplSession::new(conn, RunnerConfig::default()).with_echo(|_| {});

        assert!(matches!(
            session.execute("Y"),
            Err(SessionError::Parse(_))
        ));
    }
}
