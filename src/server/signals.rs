//! Signal wiring for the supervisor.
//!
//! SIGCHLD is turned into a byte on a self-pipe so the event loop can fold
//! reaping into its poll set. SIGHUP is swallowed entirely; a client crash
//! must never take the supervisor down with it.

use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use signal_hook::consts::{SIGCHLD, SIGHUP};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalSetupError {
    #[error("failed to create self-pipe: {0}")]
    Pipe(#[from] Errno),

    #[error("failed to register signal handler: {0}")]
    Register(#[from] std::io::Error),
}

/// Creates the SIGCHLD self-pipe and returns its read end.
///
/// The handler does a single non-blocking write, so delivery collapses any
/// burst of signals into at most one pending byte per pipe capacity.
///
/// # Errors
///
/// Returns [`SignalSetupError`] when the pipe or the handler registration
/// fails; both are fatal for supervisor startup.
pub fn install_sigchld_pipe() -> Result<OwnedFd, SignalSetupError> {
    let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
    signal_hook::low_level::pipe::register(SIGCHLD, write)?;
    Ok(read)
}

/// Makes SIGHUP a no-op for the rest of the process lifetime.
///
/// # Errors
///
/// Returns [`SignalSetupError::Register`] when registration fails.
pub fn ignore_sighup() -> Result<(), SignalSetupError> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGHUP, flag)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;
    use std::os::fd::AsFd;

    #[test]
    fn sigchld_write_lands_on_the_pipe() {
        let read = install_sigchld_pipe().unwrap();

        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = nix::unistd::Pid::from_raw(i32::try_from(child.id()).unwrap());

        let ready = transport::wait_readable([read.as_fd()]).unwrap();
        assert!(ready[0]);
        transport::drain_pipe(read.as_fd());

        nix::sys::wait::waitpid(pid, None).unwrap();
    }
}
