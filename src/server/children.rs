//! Registry of children the supervisor owns.

use std::os::fd::OwnedFd;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::protocol::LaunchSpec;

/// One supervised child. The master fd is owned by the table and closed
/// exactly when the record is removed; SCM_RIGHTS sends duplicate it, so
/// handing a copy to a client never gives up ownership.
#[derive(Debug)]
pub struct ChildRecord {
    pub pid: Pid,
    pub spec: LaunchSpec,
    pub master: OwnedFd,
    pub tty_path: String,
    pub terminated: bool,
    /// Valid only when `terminated` is true. Exit code for a normal exit,
    /// 128 plus the signal number for a signal death.
    pub exit_status: i32,
}

/// Insertion-ordered table of live and terminated-but-unwaited children.
#[derive(Debug, Default)]
pub struct ChildTable {
    records: Vec<ChildRecord>,
}

impl ChildTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.records.iter()
    }

    /// Registers a child and returns a reference to the stored record.
    /// Pids must be unique across records; a collision means a recycled
    /// pid was registered while a stale record still held the old one.
    pub fn add(&mut self, record: ChildRecord) -> &ChildRecord {
        debug_assert!(
            self.get(record.pid).is_none(),
            "duplicate pid {} in child table",
            record.pid
        );
        info!(
            pid = record.pid.as_raw(),
            path = %record.spec.path,
            tty = %record.tty_path,
            "registered child"
        );
        self.records.push(record);
        let index = self.records.len() - 1;
        &self.records[index]
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&ChildRecord> {
        self.records.iter().find(|record| record.pid == pid)
    }

    /// Removes and returns the record for `pid`, dropping nothing if no
    /// such record exists. Dropping the returned record closes its master.
    pub fn remove(&mut self, pid: Pid) -> Option<ChildRecord> {
        let index = self.records.iter().position(|record| record.pid == pid)?;
        let record = self.records.remove(index);
        info!(pid = pid.as_raw(), "removed child record");
        Some(record)
    }

    /// Reaps every non-terminated child that has exited, returning their
    /// pids. Records stay in the table with `terminated` set until a
    /// successful wait removes them.
    pub fn reap(&mut self) -> Vec<Pid> {
        let mut newly_terminated = Vec::new();
        for record in &mut self.records {
            if record.terminated {
                continue;
            }
            match wait_nohang(record.pid) {
                Some(status) => {
                    record.terminated = true;
                    record.exit_status = status;
                    info!(
                        pid = record.pid.as_raw(),
                        status, "child terminated"
                    );
                    newly_terminated.push(record.pid);
                }
                None => {
                    debug!(pid = record.pid.as_raw(), "child still running");
                }
            }
        }
        newly_terminated
    }
}

fn wait_nohang(pid: Pid) -> Option<i32> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(WaitStatus::Exited(_, code)) => return Some(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Some(128 + signal as i32),
            Ok(_) => return None,
            Err(Errno::EINTR) => {}
            Err(err) => {
                warn!(pid = pid.as_raw(), %err, "waitpid failed");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::time::Duration;

    fn fake_record(pid: i32) -> ChildRecord {
        let (master, _w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        ChildRecord {
            pid: Pid::from_raw(pid),
            spec: LaunchSpec {
                path: "/bin/true".to_string(),
                argv: vec!["true".to_string()],
                env: vec![],
                columns: 80,
                rows: 24,
                utf8: true,
                workdir: None,
                unique_id: i64::from(pid),
            },
            master,
            tty_path: format!("/dev/pts/{pid}"),
            terminated: false,
            exit_status: 0,
        }
    }

    #[test]
    fn add_get_remove() {
        let mut table = ChildTable::new();
        assert!(table.is_empty());

        table.add(fake_record(100));
        table.add(fake_record(200));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(Pid::from_raw(200)).unwrap().pid.as_raw(), 200);
        assert!(table.get(Pid::from_raw(300)).is_none());

        let removed = table.remove(Pid::from_raw(100)).unwrap();
        assert_eq!(removed.pid.as_raw(), 100);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn add_returns_the_record_just_inserted() {
        let mut table = ChildTable::new();
        table.add(fake_record(100));
        let inserted = table.add(fake_record(200));
        assert_eq!(inserted.pid.as_raw(), 200);
    }

    #[test]
    #[should_panic(expected = "duplicate pid")]
    fn duplicate_pid_registration_is_a_bug() {
        let mut table = ChildTable::new();
        table.add(fake_record(100));
        table.add(fake_record(100));
    }

    #[test]
    fn remove_is_at_most_once() {
        let mut table = ChildTable::new();
        table.add(fake_record(100));
        assert!(table.remove(Pid::from_raw(100)).is_some());
        assert!(table.remove(Pid::from_raw(100)).is_none());
    }

    #[test]
    fn iteration_is_oldest_first() {
        let mut table = ChildTable::new();
        table.add(fake_record(300));
        table.add(fake_record(100));
        table.add(fake_record(200));
        let pids: Vec<i32> = table.iter().map(|r| r.pid.as_raw()).collect();
        assert_eq!(pids, vec![300, 100, 200]);
    }

    #[test]
    fn reap_marks_exited_children() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();

        let mut table = ChildTable::new();
        let mut record = fake_record(pid);
        record.pid = Pid::from_raw(pid);
        table.add(record);

        let mut reaped = Vec::new();
        for _ in 0..50 {
            reaped = table.reap();
            if !reaped.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(reaped, vec![Pid::from_raw(pid)]);

        let record = table.get(Pid::from_raw(pid)).unwrap();
        assert!(record.terminated);
        assert_eq!(record.exit_status, 0);

        // A second pass finds nothing new.
        assert!(table.reap().is_empty());
    }
}
