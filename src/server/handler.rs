//! Interprets decoded client requests against the child table.

use std::os::fd::{AsFd, BorrowedFd};

use nix::unistd::{getpid, Pid};
use tracing::{debug, info, warn};

use crate::protocol::{
    ClientMessage, HandshakeRequest, HandshakeResponse, LaunchResponse, LaunchSpec, ReportChild,
    ServerMessage, Termination, WaitResponse, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    REJECTED_VERSION, WAIT_NOT_TERMINATED, WAIT_NO_SUCH_CHILD, WAIT_OK,
};
use crate::pty;
use crate::server::children::{ChildRecord, ChildTable};
use crate::transport::{self, Connection, TransportError};

/// What the session loop should do after a request.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionFlow {
    Continue,
    Close,
}

/// Dispatches one decoded request.
///
/// # Errors
///
/// Returns [`TransportError`] when a response cannot be delivered; the
/// caller drops the connection but leaves the child table alone.
pub fn handle_request(
    conn: &Connection,
    children: &mut ChildTable,
    message: ClientMessage,
) -> Result<SessionFlow, TransportError> {
    match message {
        ClientMessage::Handshake(req) => handle_handshake(conn, children, &req),
        ClientMessage::Launch(spec) => {
            handle_launch(conn, children, spec)?;
            Ok(SessionFlow::Continue)
        }
        ClientMessage::Wait(req) => {
            handle_wait(conn, children, Pid::from_raw(req.pid))?;
            Ok(SessionFlow::Continue)
        }
    }
}

fn handle_handshake(
    conn: &Connection,
    children: &ChildTable,
    req: &HandshakeRequest,
) -> Result<SessionFlow, TransportError> {
    if req.max_protocol_version < MIN_PROTOCOL_VERSION {
        info!(
            offered = req.max_protocol_version,
            minimum = MIN_PROTOCOL_VERSION,
            "rejecting handshake below minimum version"
        );
        let reject = ServerMessage::Handshake(HandshakeResponse {
            protocol_version: REJECTED_VERSION,
            child_count: 0,
            server_pid: getpid().as_raw(),
        });
        conn.send(&reject.encode())?;
        return Ok(SessionFlow::Close);
    }

    let child_count = i64::try_from(children.len()).unwrap_or(i64::MAX);
    let accept = ServerMessage::Handshake(HandshakeResponse {
        protocol_version: PROTOCOL_VERSION,
        child_count,
        server_pid: getpid().as_raw(),
    });
    conn.send(&accept.encode())?;
    debug!(child_count, "handshake accepted, replaying children");
    replay_children(conn, children)?;
    Ok(SessionFlow::Continue)
}

/// Sends one ReportChild per record, oldest first, each carrying the
/// record's master fd. The final report is flagged so the client knows the
/// replay is complete.
fn replay_children(conn: &Connection, children: &ChildTable) -> Result<(), TransportError> {
    let total = children.len();
    for (index, record) in children.iter().enumerate() {
        let report = ServerMessage::ReportChild(ReportChild {
            is_last: index + 1 == total,
            pid: record.pid.as_raw(),
            spec: record.spec.clone(),
            terminated: record.terminated,
            tty_path: record.tty_path.clone(),
        });
        conn.send_with_fd(&report.encode(), record.master.as_fd())?;
    }
    Ok(())
}

fn handle_launch(
    conn: &Connection,
    children: &mut ChildTable,
    spec: LaunchSpec,
) -> Result<(), TransportError> {
    let unique_id = spec.unique_id;
    match pty::spawn(&spec) {
        Ok(child) => {
            let pid = child.pid;
            let tty_path = child.tty_path.to_string_lossy().into_owned();
            let response = ServerMessage::Launch(LaunchResponse {
                status: 0,
                pid: pid.as_raw(),
                unique_id,
                tty_path: tty_path.clone(),
            });
            // Respond with the fd of the record just inserted; a pid
            // lookup could find an older record under a recycled pid.
            let record = children.add(ChildRecord {
                pid,
                spec,
                master: child.master,
                tty_path,
                terminated: false,
                exit_status: 0,
            });
            conn.send_with_fd(&response.encode(), record.master.as_fd())
        }
        Err(err) => {
            warn!(path = %spec.path, %err, "launch failed");
            let response = ServerMessage::Launch(LaunchResponse {
                status: -1,
                pid: 0,
                unique_id,
                tty_path: String::new(),
            });
            conn.send(&response.encode())
        }
    }
}

fn handle_wait(
    conn: &Connection,
    children: &mut ChildTable,
    pid: Pid,
) -> Result<(), TransportError> {
    let (status, error_number) = match children.get(pid) {
        None => (0, WAIT_NO_SUCH_CHILD),
        Some(record) if !record.terminated => (0, WAIT_NOT_TERMINATED),
        Some(record) => (record.exit_status, WAIT_OK),
    };
    let response = ServerMessage::Wait(WaitResponse {
        pid: pid.as_raw(),
        status,
        error_number,
    });
    conn.send(&response.encode())?;
    if error_number == WAIT_OK {
        children.remove(pid);
    }
    Ok(())
}

/// Tells the connected client that a child exited.
///
/// # Errors
///
/// Returns [`TransportError`] when the notification cannot be sent.
pub fn notify_termination(conn: &Connection, pid: Pid) -> Result<(), TransportError> {
    let message = ServerMessage::Termination(Termination { pid: pid.as_raw() });
    conn.send(&message.encode())
}

/// Accepts a connection attempt that arrived while a client is already
/// attached, sends it a rejecting handshake, and closes it.
pub fn reject_extra_connection(listener: BorrowedFd<'_>) {
    let socket = match transport::accept_retry(listener) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(%err, "accept of extra connection failed");
            return;
        }
    };
    info!("rejecting extra connection while a client is attached");
    let reject = ServerMessage::Handshake(HandshakeResponse {
        protocol_version: REJECTED_VERSION,
        child_count: 0,
        server_pid: getpid().as_raw(),
    });
    if let Err(err) = transport::send(socket.as_fd(), &reject.encode()) {
        debug!(%err, "extra connection vanished before rejection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WaitRequest;
    use nix::fcntl::OFlag;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::pipe2;
    use std::os::fd::OwnedFd;

    fn connection_pair() -> (Connection, Connection) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        (
            Connection::from_socket(a).unwrap(),
            Connection::from_socket(b).unwrap(),
        )
    }

    fn fake_record(pid: i32, terminated: bool, exit_status: i32) -> ChildRecord {
        let (master, _w): (OwnedFd, OwnedFd) = pipe2(OFlag::O_CLOEXEC).unwrap();
        // The write end leaks for the duration of the test, which keeps the
        // master readable rather than at EOF.
        std::mem::forget(_w);
        ChildRecord {
            pid: Pid::from_raw(pid),
            spec: LaunchSpec {
                path: "/bin/cat".to_string(),
                argv: vec!["cat".to_string()],
                env: vec![],
                columns: 80,
                rows: 24,
                utf8: true,
                workdir: None,
                unique_id: i64::from(pid),
            },
            master,
            tty_path: format!("/dev/pts/{pid}"),
            terminated,
            exit_status,
        }
    }

    fn receive_server(conn: &Connection) -> (ServerMessage, Option<OwnedFd>) {
        let (buf, fd) = conn.receive().unwrap();
        (ServerMessage::decode(&buf).unwrap(), fd)
    }

    #[test]
    fn handshake_replays_children_oldest_first() {
        let (server, client) = connection_pair();
        let mut table = ChildTable::new();
        table.add(fake_record(100, false, 0));
        table.add(fake_record(200, true, 7));

        let flow = handle_request(
            &server,
            &mut table,
            ClientMessage::Handshake(HandshakeRequest {
                max_protocol_version: PROTOCOL_VERSION,
            }),
        )
        .unwrap();
        assert_eq!(flow, SessionFlow::Continue);

        let (msg, fd) = receive_server(&client);
        let ServerMessage::Handshake(resp) = msg else {
            panic!("expected handshake response, got {msg:?}");
        };
        assert_eq!(resp.protocol_version, PROTOCOL_VERSION);
        assert_eq!(resp.child_count, 2);
        assert_eq!(resp.server_pid, getpid().as_raw());
        assert!(fd.is_none());

        let (msg, fd) = receive_server(&client);
        let ServerMessage::ReportChild(first) = msg else {
            panic!("expected report, got {msg:?}");
        };
        assert_eq!(first.pid, 100);
        assert!(!first.is_last);
        assert!(!first.terminated);
        assert!(fd.is_some());

        let (msg, fd) = receive_server(&client);
        let ServerMessage::ReportChild(second) = msg else {
            panic!("expected report, got {msg:?}");
        };
        assert_eq!(second.pid, 200);
        assert!(second.is_last);
        assert!(second.terminated);
        assert!(fd.is_some());
    }

    #[test]
    fn handshake_below_minimum_is_rejected_and_closes() {
        let (server, client) = connection_pair();
        let mut table = ChildTable::new();
        table.add(fake_record(100, false, 0));

        let flow = handle_request(
            &server,
            &mut table,
            ClientMessage::Handshake(HandshakeRequest {
                max_protocol_version: MIN_PROTOCOL_VERSION - 1,
            }),
        )
        .unwrap();
        assert_eq!(flow, SessionFlow::Close);

        let (msg, fd) = receive_server(&client);
        let ServerMessage::Handshake(resp) = msg else {
            panic!("expected handshake response, got {msg:?}");
        };
        assert_eq!(resp.protocol_version, REJECTED_VERSION);
        assert_eq!(resp.child_count, 0);
        assert!(fd.is_none());

        // Rejection never touches the table.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn wait_for_unknown_pid_reports_no_such_child() {
        let (server, client) = connection_pair();
        let mut table = ChildTable::new();

        handle_request(
            &server,
            &mut table,
            ClientMessage::Wait(WaitRequest { pid: 4242 }),
        )
        .unwrap();

        let (msg, _) = receive_server(&client);
        let ServerMessage::Wait(resp) = msg else {
            panic!("expected wait response, got {msg:?}");
        };
        assert_eq!(resp.pid, 4242);
        assert_eq!(resp.error_number, WAIT_NO_SUCH_CHILD);
    }

    #[test]
    fn wait_before_termination_leaves_the_record() {
        let (server, client) = connection_pair();
        let mut table = ChildTable::new();
        table.add(fake_record(100, false, 0));

        handle_request(
            &server,
            &mut table,
            ClientMessage::Wait(WaitRequest { pid: 100 }),
        )
        .unwrap();

        let (msg, _) = receive_server(&client);
        let ServerMessage::Wait(resp) = msg else {
            panic!("expected wait response, got {msg:?}");
        };
        assert_eq!(resp.error_number, WAIT_NOT_TERMINATED);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn successful_wait_removes_the_record_once() {
        let (server, client) = connection_pair();
        let mut table = ChildTable::new();
        table.add(fake_record(100, true, 7));

        handle_request(
            &server,
            &mut table,
            ClientMessage::Wait(WaitRequest { pid: 100 }),
        )
        .unwrap();
        let (msg, _) = receive_server(&client);
        let ServerMessage::Wait(resp) = msg else {
            panic!("expected wait response, got {msg:?}");
        };
        assert_eq!(resp.error_number, WAIT_OK);
        assert_eq!(resp.status, 7);
        assert!(table.is_empty());

        // Asking again reports no such child.
        handle_request(
            &server,
            &mut table,
            ClientMessage::Wait(WaitRequest { pid: 100 }),
        )
        .unwrap();
        let (msg, _) = receive_server(&client);
        let ServerMessage::Wait(resp) = msg else {
            panic!("expected wait response, got {msg:?}");
        };
        assert_eq!(resp.error_number, WAIT_NO_SUCH_CHILD);
    }

    #[test]
    fn failed_launch_reports_status_minus_one_and_adds_nothing() {
        let (server, client) = connection_pair();
        let mut table = ChildTable::new();

        let spec = LaunchSpec {
            path: "/bin/\0sh".to_string(),
            argv: vec![],
            env: vec![],
            columns: 80,
            rows: 24,
            utf8: true,
            workdir: None,
            unique_id: 31,
        };
        handle_request(&server, &mut table, ClientMessage::Launch(spec)).unwrap();

        let (msg, fd) = receive_server(&client);
        let ServerMessage::Launch(resp) = msg else {
            panic!("expected launch response, got {msg:?}");
        };
        assert_eq!(resp.status, -1);
        assert_eq!(resp.pid, 0);
        assert_eq!(resp.unique_id, 31);
        assert!(resp.tty_path.is_empty());
        assert!(fd.is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn successful_launch_registers_and_returns_fd() {
        let (server, client) = connection_pair();
        let mut table = ChildTable::new();

        let spec = LaunchSpec {
            path: "/bin/sh".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), "read _".to_string()],
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            columns: 80,
            rows: 24,
            utf8: true,
            workdir: None,
            unique_id: 55,
        };
        handle_request(&server, &mut table, ClientMessage::Launch(spec)).unwrap();

        let (msg, fd) = receive_server(&client);
        let ServerMessage::Launch(resp) = msg else {
            panic!("expected launch response, got {msg:?}");
        };
        assert_eq!(resp.status, 0);
        assert!(resp.pid > 0);
        assert_eq!(resp.unique_id, 55);
        assert!(resp.tty_path.starts_with("/dev/"));
        assert!(fd.is_some());
        assert_eq!(table.len(), 1);

        let pid = Pid::from_raw(resp.pid);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        nix::sys::wait::waitpid(pid, None).unwrap();
    }

    #[test]
    fn termination_notification_carries_the_pid() {
        let (server, client) = connection_pair();
        notify_termination(&server, Pid::from_raw(77)).unwrap();

        let (msg, _) = receive_server(&client);
        assert_eq!(msg, ServerMessage::Termination(Termination { pid: 77 }));
    }
}
