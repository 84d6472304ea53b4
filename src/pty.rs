//! Pty allocation and child spawning.
//!
//! Opens a master/slave pair with cooked-mode termios defaults, forks, makes
//! the slave the child's controlling terminal on fds 0..2, and execs the
//! requested program. All allocation happens before fork so the child side
//! only touches async-signal-safe calls.

#![allow(unsafe_code)]

use std::ffi::{CString, NulError};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;
use nix::unistd::{fork, setsid, ttyname, ForkResult, Pid};
use thiserror::Error;

use crate::protocol::LaunchSpec;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("argument contains an interior NUL byte: {0}")]
    NulInArgument(#[from] NulError),

    #[error("failed to open pty pair: {0}")]
    Open(Errno),

    #[error("fork failed: {0}")]
    Fork(Errno),

    #[error("failed to resolve tty name: {0}")]
    TtyName(Errno),
}

/// A freshly spawned child and the supervisor's handle to it.
#[derive(Debug)]
pub struct PtyChild {
    pub pid: Pid,
    pub master: OwnedFd,
    pub tty_path: PathBuf,
}

/// Spawns `spec` on a new pty.
///
/// # Errors
///
/// Returns [`PtyError`] when pty allocation or fork fails, or when an
/// argument cannot be represented as a C string. A successful fork whose
/// exec then fails is reported as the child exiting with status 1, not as
/// an error here.
pub fn spawn(spec: &LaunchSpec) -> Result<PtyChild, PtyError> {
    let path = CString::new(spec.path.as_str())?;
    let argv: Vec<CString> = spec
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()?;
    let env: Vec<CString> = spec
        .env
        .iter()
        .map(|var| CString::new(var.as_str()))
        .collect::<Result<_, _>>()?;
    let workdir = spec
        .workdir
        .as_deref()
        .map(CString::new)
        .transpose()?;

    let winsize = Winsize {
        ws_row: spec.rows,
        ws_col: spec.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let termios = default_termios(spec.utf8);
    let pty = openpty(Some(&winsize), Some(&termios)).map_err(PtyError::Open)?;
    let tty_path = ttyname(pty.slave.as_fd()).map_err(PtyError::TtyName)?;

    // Built ahead of fork; the child side may only make async-signal-safe
    // calls, which rules out allocation.
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let env_ptrs: Vec<*const libc::c_char> = env
        .iter()
        .map(|var| var.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => {
            drop(pty.slave);
            Ok(PtyChild {
                pid: child,
                master: pty.master,
                tty_path,
            })
        }
        ForkResult::Child => {
            drop(pty.master);
            let slave = pty.slave.as_raw_fd();
            let _ = setsid();
            unsafe {
                libc::ioctl(slave, libc::TIOCSCTTY as libc::c_ulong, 0);
                libc::dup2(slave, 0);
                libc::dup2(slave, 1);
                libc::dup2(slave, 2);
                if slave > 2 {
                    libc::close(slave);
                }
                if let Some(dir) = &workdir {
                    libc::chdir(dir.as_ptr());
                }
                libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
                libc::_exit(1);
            }
        }
    }
}

/// Cooked-mode terminal defaults for a brand new session.
fn default_termios(utf8: bool) -> Termios {
    let mut raw: libc::termios = unsafe { std::mem::zeroed() };
    raw.c_iflag = libc::ICRNL | libc::IXON | libc::IXANY | libc::IMAXBEL | libc::BRKINT;
    if utf8 {
        raw.c_iflag |= libc::IUTF8;
    }
    raw.c_oflag = libc::OPOST | libc::ONLCR;
    raw.c_cflag = libc::CREAD | libc::CS8 | libc::HUPCL;
    raw.c_lflag = libc::ICANON
        | libc::ISIG
        | libc::IEXTEN
        | libc::ECHO
        | libc::ECHOE
        | libc::ECHOK
        | libc::ECHOKE
        | libc::ECHOCTL;
    raw.c_cc[libc::VEOF] = 4;
    raw.c_cc[libc::VEOL] = 0;
    raw.c_cc[libc::VEOL2] = 0;
    raw.c_cc[libc::VERASE] = 0x7f;
    raw.c_cc[libc::VWERASE] = 23;
    raw.c_cc[libc::VKILL] = 21;
    raw.c_cc[libc::VREPRINT] = 18;
    raw.c_cc[libc::VINTR] = 3;
    raw.c_cc[libc::VQUIT] = 28;
    raw.c_cc[libc::VSUSP] = 26;
    raw.c_cc[libc::VSTART] = 17;
    raw.c_cc[libc::VSTOP] = 19;
    raw.c_cc[libc::VLNEXT] = 22;
    raw.c_cc[libc::VDISCARD] = 15;
    raw.c_cc[libc::VMIN] = 1;
    raw.c_cc[libc::VTIME] = 0;
    raw.c_ispeed = libc::B38400;
    raw.c_ospeed = libc::B38400;
    Termios::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_spec(command: &str) -> LaunchSpec {
        LaunchSpec {
            path: "/bin/sh".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            columns: 80,
            rows: 24,
            utf8: true,
            workdir: None,
            unique_id: 1,
        }
    }

    #[test]
    fn spawn_returns_a_live_child_with_a_tty() {
        let child = spawn(&shell_spec("read _")).unwrap();
        assert!(child.pid.as_raw() > 0);
        assert!(child.tty_path.to_string_lossy().contains("/dev/"));
        assert!(child.master.as_raw_fd() >= 0);

        nix::sys::signal::kill(child.pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        nix::sys::wait::waitpid(child.pid, None).unwrap();
    }

    #[test]
    fn child_output_arrives_on_the_master() {
        let child = spawn(&shell_spec("printf hello")).unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match nix::unistd::read(child.master.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                // EIO is the normal end-of-stream for a pty master.
                Err(Errno::EIO) => break,
                Err(Errno::EINTR) => {}
                Err(err) => panic!("read failed: {err}"),
            }
            if collected.windows(5).any(|w| w == b"hello") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hello"));
        nix::sys::wait::waitpid(child.pid, None).unwrap();
    }

    #[test]
    fn nul_in_path_is_rejected_before_fork() {
        let mut spec = shell_spec("true");
        spec.path = "/bin/\0sh".to_string();
        assert!(matches!(spawn(&spec), Err(PtyError::NulInArgument(_))));
    }
}
