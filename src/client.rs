//! Client-side facade over the supervisor socket.
//!
//! A dedicated blocking thread owns the connection and multiplexes two
//! inputs: commands from the async API (queued over a channel, signalled
//! through a wake socket) and messages from the supervisor. Responses are
//! matched to pending commands strictly in arrival order, which is sound
//! because the supervisor answers requests one at a time in order.

use std::collections::VecDeque;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{
    ClientMessage, HandshakeRequest, LaunchSpec, ServerMessage, WaitRequest,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, WAIT_NOT_TERMINATED, WAIT_NO_SUCH_CHILD, WAIT_OK,
};
use crate::transport::{self, Connection, TransportError};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

const SPAWN_RETRIES: u32 = 50;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A child adopted from or launched through the supervisor.
#[derive(Debug)]
pub struct ChildSession {
    pub pid: i32,
    pub spec: LaunchSpec,
    pub tty_path: String,
    pub terminated: bool,
    /// This process's own duplicate of the pty master.
    pub master: OwnedFd,
}

/// Unsolicited notifications from the supervisor.
#[derive(Debug)]
pub enum SessionEvent {
    /// A pre-existing child replayed after the handshake.
    Discovered(ChildSession),
    /// A child exited; poll it with [`SupervisorClient::wait`].
    Terminated { pid: i32 },
    /// The connection died. Children are still alive under the
    /// supervisor; attach again to recover them.
    ConnectionLost,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to supervisor at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: TransportError,
    },

    #[error("supervisor rejected the protocol handshake")]
    Rejected,

    #[error("connection to supervisor lost")]
    ConnectionLost,

    #[error("supervisor failed to launch the child")]
    LaunchFailed,

    #[error("no child with pid {0}")]
    NoSuchChild(i32),

    #[error("child {0} has not terminated yet")]
    NotTerminated(i32),

    #[error("supervisor omitted the expected file descriptor")]
    MissingFd,

    #[error("supervisor sent a message that matches no pending request")]
    UnexpectedMessage,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] crate::protocol::CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal client failure: {0}")]
    Internal(String),

    #[error("spawned supervisor at {0} never became reachable")]
    SpawnTimeout(PathBuf),
}

enum Command {
    Launch(LaunchSpec, oneshot::Sender<Result<ChildSession, ClientError>>),
    Wait(i32, oneshot::Sender<Result<i32, ClientError>>),
}

enum Pending {
    Launch(LaunchSpec, oneshot::Sender<Result<ChildSession, ClientError>>),
    Wait(i32, oneshot::Sender<Result<i32, ClientError>>),
}

/// Handle to an attached supervisor.
#[derive(Debug)]
pub struct SupervisorClient {
    commands: std_mpsc::Sender<Command>,
    wake: OwnedFd,
    server_pid: i32,
    child_count: i64,
}

impl SupervisorClient {
    /// Connects and performs the handshake. Pre-existing children arrive
    /// on the returned event channel as [`SessionEvent::Discovered`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] when the socket is unreachable and
    /// [`ClientError::Rejected`] when another client is already attached
    /// or the version negotiation fails.
    pub async fn attach(
        path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || attach_blocking(&path))
            .await
            .map_err(|err| ClientError::Internal(err.to_string()))?
    }

    /// Connects, spawning a fresh supervisor process first if nothing
    /// answers at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SpawnTimeout`] when the spawned supervisor
    /// never starts listening.
    pub async fn attach_or_spawn(
        path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
        match Self::attach(path).await {
            Ok(attached) => return Ok(attached),
            Err(ClientError::Connect { .. }) => {}
            Err(err) => return Err(err),
        }

        // Nothing is listening; any socket file left behind is stale.
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let exe = std::env::current_exe()?;
        info!(path = %path.display(), "spawning supervisor");
        std::process::Command::new(exe)
            .arg("serve")
            .arg("--socket")
            .arg(path)
            .spawn()?;

        for _ in 0..SPAWN_RETRIES {
            tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            match Self::attach(path).await {
                Ok(attached) => return Ok(attached),
                Err(ClientError::Connect { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Err(ClientError::SpawnTimeout(path.to_path_buf()))
    }

    #[must_use]
    pub fn server_pid(&self) -> i32 {
        self.server_pid
    }

    /// Number of children the supervisor reported at handshake time.
    #[must_use]
    pub fn child_count(&self) -> i64 {
        self.child_count
    }

    /// Launches a child under the supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::LaunchFailed`] when the supervisor could not
    /// spawn the child and [`ClientError::ConnectionLost`] when the
    /// connection died before the response arrived.
    pub async fn launch(&self, spec: LaunchSpec) -> Result<ChildSession, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Launch(spec, tx))?;
        rx.await.map_err(|_| ClientError::ConnectionLost)?
    }

    /// Collects the exit status of a terminated child, releasing its
    /// record in the supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotTerminated`] while the child is still
    /// running and [`ClientError::NoSuchChild`] once the status has
    /// already been collected.
    pub async fn wait(&self, pid: i32) -> Result<i32, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Wait(pid, tx))?;
        rx.await.map_err(|_| ClientError::ConnectionLost)?
    }

    fn submit(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ConnectionLost)?;
        // A failed wake means the I/O thread already exited; the queued
        // command's reply channel will report the loss.
        let _ = transport::send(self.wake.as_fd(), &[1]);
        Ok(())
    }
}

fn attach_blocking(
    path: &Path,
) -> Result<(SupervisorClient, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
    let socket = transport::connect_to(path).map_err(|source| ClientError::Connect {
        path: path.to_path_buf(),
        source,
    })?;
    let conn = Connection::from_socket(socket)?;

    let handshake = ClientMessage::Handshake(HandshakeRequest {
        max_protocol_version: PROTOCOL_VERSION,
    })
    .encode();
    if let Err(send_err) = conn.send(&handshake) {
        // A rejecting supervisor may close before our handshake lands;
        // its parting message still tells us why.
        if let Ok((buf, _fd)) = conn.receive() {
            if let Ok(ServerMessage::Handshake(response)) = ServerMessage::decode(&buf) {
                if response.protocol_version < MIN_PROTOCOL_VERSION {
                    return Err(ClientError::Rejected);
                }
            }
        }
        return Err(send_err.into());
    }
    let (buf, _fd) = conn.receive()?;
    let response = match ServerMessage::decode(&buf)? {
        ServerMessage::Handshake(response) => response,
        _ => return Err(ClientError::UnexpectedMessage),
    };
    if response.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(ClientError::Rejected);
    }
    debug!(
        server_pid = response.server_pid,
        child_count = response.child_count,
        "handshake complete"
    );

    let (wake_tx, wake_rx) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .map_err(TransportError::from)?;
    let (command_tx, command_rx) = std_mpsc::channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("warden-client-io".to_string())
        .spawn(move || io_thread(&conn, &command_rx, &wake_rx, &event_tx))?;

    Ok((
        SupervisorClient {
            commands: command_tx,
            wake: wake_tx,
            server_pid: response.server_pid,
            child_count: response.child_count,
        },
        event_rx,
    ))
}

/// Owns the connection until it dies or the client handle is dropped.
fn io_thread(
    conn: &Connection,
    commands: &std_mpsc::Receiver<Command>,
    wake: &OwnedFd,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let mut pending: VecDeque<Pending> = VecDeque::new();

    loop {
        let ready = match transport::wait_readable([wake.as_fd(), conn.read_fd()]) {
            Ok(ready) => ready,
            Err(err) => {
                warn!(%err, "poll failed");
                return fail_all(pending, events);
            }
        };

        if ready[0] {
            transport::drain_pipe(wake.as_fd());
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        if let Err(err) = dispatch_command(conn, &mut pending, command) {
                            warn!(%err, "request send failed");
                            return fail_all(pending, events);
                        }
                    }
                    Err(std_mpsc::TryRecvError::Empty) => break,
                    // Client handle dropped; shut the connection down.
                    Err(std_mpsc::TryRecvError::Disconnected) => return,
                }
            }
        }

        if ready[1] {
            let (buf, fd) = match conn.receive() {
                Ok(received) => received,
                Err(err) => {
                    debug!(%err, "connection closed");
                    return fail_all(pending, events);
                }
            };
            let message = match ServerMessage::decode(&buf) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "malformed message from supervisor");
                    return fail_all(pending, events);
                }
            };
            if !dispatch_message(&mut pending, events, message, fd) {
                return fail_all(pending, events);
            }
        }
    }
}

fn dispatch_command(
    conn: &Connection,
    pending: &mut VecDeque<Pending>,
    command: Command,
) -> Result<(), TransportError> {
    match command {
        Command::Launch(spec, tx) => {
            conn.send(&ClientMessage::Launch(spec.clone()).encode())?;
            pending.push_back(Pending::Launch(spec, tx));
        }
        Command::Wait(pid, tx) => {
            conn.send(&ClientMessage::Wait(WaitRequest { pid }).encode())?;
            pending.push_back(Pending::Wait(pid, tx));
        }
    }
    Ok(())
}

/// Routes one supervisor message. Returns false when the message breaks
/// the protocol and the connection must be torn down.
fn dispatch_message(
    pending: &mut VecDeque<Pending>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    message: ServerMessage,
    fd: Option<OwnedFd>,
) -> bool {
    match message {
        ServerMessage::Launch(response) => {
            let Some(Pending::Launch(spec, tx)) = pending.pop_front() else {
                warn!("launch response with no pending launch");
                return false;
            };
            let result = if response.status != 0 {
                Err(ClientError::LaunchFailed)
            } else {
                match fd {
                    Some(master) => Ok(ChildSession {
                        pid: response.pid,
                        spec,
                        tty_path: response.tty_path,
                        terminated: false,
                        master,
                    }),
                    None => Err(ClientError::MissingFd),
                }
            };
            let _ = tx.send(result);
            true
        }
        ServerMessage::Wait(response) => {
            let Some(Pending::Wait(pid, tx)) = pending.pop_front() else {
                warn!("wait response with no pending wait");
                return false;
            };
            let result = match response.error_number {
                WAIT_OK => Ok(response.status),
                WAIT_NO_SUCH_CHILD => Err(ClientError::NoSuchChild(pid)),
                WAIT_NOT_TERMINATED => Err(ClientError::NotTerminated(pid)),
                other => {
                    warn!(error_number = other, "unknown wait error code");
                    Err(ClientError::UnexpectedMessage)
                }
            };
            let _ = tx.send(result);
            true
        }
        ServerMessage::ReportChild(report) => {
            let Some(master) = fd else {
                warn!(pid = report.pid, "child report without descriptor");
                return false;
            };
            let _ = events.send(SessionEvent::Discovered(ChildSession {
                pid: report.pid,
                spec: report.spec,
                tty_path: report.tty_path,
                terminated: report.terminated,
                master,
            }));
            true
        }
        ServerMessage::Termination(term) => {
            let _ = events.send(SessionEvent::Terminated { pid: term.pid });
            true
        }
        ServerMessage::Handshake(_) => {
            warn!("unexpected handshake message mid-session");
            false
        }
    }
}

fn fail_all(pending: VecDeque<Pending>, events: &mpsc::UnboundedSender<SessionEvent>) {
    for entry in pending {
        match entry {
            Pending::Launch(_, tx) => {
                let _ = tx.send(Err(ClientError::ConnectionLost));
            }
            Pending::Wait(_, tx) => {
                let _ = tx.send(Err(ClientError::ConnectionLost));
            }
        }
    }
    let _ = events.send(SessionEvent::ConnectionLost);
}
