//! The supervisor event loop.
//!
//! Single-threaded. While no client is attached the loop polls the listener
//! and the SIGCHLD self-pipe; while one is attached the listener stays in
//! the set so extra connection attempts can be rejected immediately. All
//! state lives in one owned struct threaded through the loop.

use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::protocol::ClientMessage;
use crate::server::children::ChildTable;
use crate::server::handler::{self, SessionFlow};
use crate::server::signals::{self, SignalSetupError};
use crate::transport::{self, Connection, TransportError};
use thiserror::Error;

/// Fatal bootstrap failures. Everything after setup is contained per
/// request or per connection and never ends the process.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Bind(#[from] TransportError),

    #[error(transparent)]
    Signals(#[from] SignalSetupError),
}

/// The supervisor process state.
#[derive(Debug)]
pub struct Supervisor {
    socket_path: PathBuf,
    listener: OwnedFd,
    wake: OwnedFd,
    children: ChildTable,
}

impl Supervisor {
    /// Binds a fresh listening socket at `path` and wires up signals.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] when the socket or the signal plumbing cannot
    /// be created; the caller should unlink the path and exit.
    pub fn bind(path: &Path) -> Result<Self, SetupError> {
        signals::ignore_sighup()?;
        let wake = signals::install_sigchld_pipe()?;
        let listener = transport::bind_and_listen(path)?;
        info!(path = %path.display(), "listening");
        Ok(Self {
            socket_path: path.to_path_buf(),
            listener,
            wake,
            children: ChildTable::new(),
        })
    }

    /// Adopts a listening socket inherited from the parent process.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Signals`] when the signal plumbing cannot be
    /// created.
    pub fn with_listener(path: &Path, listener: OwnedFd) -> Result<Self, SetupError> {
        signals::ignore_sighup()?;
        let wake = signals::install_sigchld_pipe()?;
        info!(path = %path.display(), "adopted inherited listener");
        Ok(Self {
            socket_path: path.to_path_buf(),
            listener,
            wake,
            children: ChildTable::new(),
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the loop forever, alternating between waiting for a client and
    /// serving one. Only an unrecoverable poll failure returns.
    pub fn run(mut self, initial: Option<Connection>) -> TransportError {
        let mut next = initial;
        loop {
            let conn = match next.take() {
                Some(conn) => conn,
                None => match self.await_connection() {
                    Ok(conn) => conn,
                    Err(err) => return err,
                },
            };
            if let Err(err) = self.serve(&conn) {
                return err;
            }
            info!("client detached, awaiting reconnection");
        }
    }

    /// Polls {self-pipe, listener} until a client connects. Reaping
    /// continues while disconnected; there is nobody to notify.
    fn await_connection(&mut self) -> Result<Connection, TransportError> {
        loop {
            let ready = transport::wait_readable([self.wake.as_fd(), self.listener.as_fd()])?;
            if ready[0] {
                transport::drain_pipe(self.wake.as_fd());
                self.children.reap();
            }
            if ready[1] {
                match transport::accept_retry(self.listener.as_fd()) {
                    Ok(socket) => {
                        info!("client connected");
                        return Connection::from_socket(socket);
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        }
    }

    /// Serves one attached client until it disconnects or misbehaves.
    /// Returning `Ok` means the connection ended; the child table is
    /// never touched by connection teardown.
    fn serve(&mut self, conn: &Connection) -> Result<(), TransportError> {
        loop {
            let ready = transport::wait_readable([
                self.wake.as_fd(),
                self.listener.as_fd(),
                conn.read_fd(),
            ])?;

            if ready[0] && !self.reap_and_notify(conn) {
                return Ok(());
            }
            // The connection is handled before the listener: when the
            // client dies and a replacement connects within one poll
            // cycle, both descriptors wake us together, and the hang-up
            // must win so the newcomer is accepted rather than rejected.
            if ready[2] {
                let (buf, _fd) = match conn.receive() {
                    Ok(received) => received,
                    Err(TransportError::Disconnected) => {
                        debug!("client disconnected");
                        self.quiet_reap();
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(%err, "receive failed, dropping connection");
                        self.quiet_reap();
                        return Ok(());
                    }
                };
                let message = match ClientMessage::decode(&buf) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(%err, "malformed request, dropping connection");
                        self.quiet_reap();
                        return Ok(());
                    }
                };
                match handler::handle_request(conn, &mut self.children, message) {
                    Ok(SessionFlow::Continue) => {}
                    Ok(SessionFlow::Close) => {
                        self.quiet_reap();
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(%err, "response delivery failed, dropping connection");
                        self.quiet_reap();
                        return Ok(());
                    }
                }
            }
            if ready[1] {
                handler::reject_extra_connection(self.listener.as_fd());
            }
        }
    }

    /// Drains the self-pipe, reaps, and notifies the client of each newly
    /// terminated child. Returns false when the connection died mid-notify.
    fn reap_and_notify(&mut self, conn: &Connection) -> bool {
        transport::drain_pipe(self.wake.as_fd());
        for pid in self.children.reap() {
            if let Err(err) = handler::notify_termination(conn, pid) {
                warn!(pid = pid.as_raw(), %err, "termination notify failed");
                return false;
            }
        }
        true
    }

    /// Reaps without a client attached. Exits stay recorded until waited.
    fn quiet_reap(&mut self) {
        transport::drain_pipe(self.wake.as_fd());
        self.children.reap();
    }
}
