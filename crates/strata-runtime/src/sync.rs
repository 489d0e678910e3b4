//! Parent/child handshake for container spawn.
//!
//! Two close-on-exec pipes connect the runtime and the container's init
//! process:
//!
//! * the *go* pipe (runtime to child): the child blocks on it until the
//!   runtime has written identity maps and attached the child to its
//!   resource group. End-of-file means the runtime died.
//! * the *report* pipe (child to runtime): a failed setup step writes one
//!   fixed-size record and exits. A successful `execve` closes the write
//!   end, so end-of-file with no data means the entrypoint is running.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use strata_common::error::{Result, StrataError};
use strata_common::types::SetupStep;

/// Size of a failure record: step code, three padding bytes, little-endian errno.
const REPORT_LEN: usize = 8;

/// A setup step failure reported by the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildFailure {
    pub step: SetupStep,
    pub errno: i32,
}

/// Runtime side of the handshake.
#[derive(Debug)]
pub(crate) struct ParentEnd {
    go_tx: File,
    report_rx: File,
}

/// Child side of the handshake.
#[derive(Debug)]
pub(crate) struct ChildEnd {
    go_rx: File,
    report_tx: File,
}

/// Creates both pipes.
pub(crate) fn channel() -> Result<(ParentEnd, ChildEnd)> {
    let (go_rx, go_tx) = pipe()?;
    let (report_rx, report_tx) = pipe()?;
    Ok((
        ParentEnd { go_tx, report_rx },
        ChildEnd { go_rx, report_tx },
    ))
}

fn pipe() -> Result<(File, File)> {
    let (rx, tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| StrataError::Internal {
        message: format!("cannot create handshake pipe: {e}"),
    })?;
    Ok((File::from(rx), File::from(tx)))
}

impl ParentEnd {
    /// Descriptors the child must close so it can observe the runtime's death.
    pub(crate) fn raw_fds(&self) -> [RawFd; 2] {
        [self.go_tx.as_raw_fd(), self.report_rx.as_raw_fd()]
    }

    /// Lets the child continue past [`ChildEnd::wait_for_go`].
    ///
    /// A child that already died is not an error here; its report (or
    /// silence) is collected by [`ParentEnd::await_exec`].
    pub(crate) fn release(&mut self) -> Result<()> {
        match self.go_tx.write_all(&[1]) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
            Err(e) => Err(StrataError::Internal {
                message: format!("cannot release container init: {e}"),
            }),
        }
    }

    /// Blocks until the child has exec'd or reported a failure.
    pub(crate) fn await_exec(&mut self) -> Result<Option<ChildFailure>> {
        let mut buf = Vec::with_capacity(REPORT_LEN);
        let _ = self
            .report_rx
            .read_to_end(&mut buf)
            .map_err(|e| StrataError::Internal {
                message: format!("cannot read container init report: {e}"),
            })?;
        if buf.is_empty() {
            return Ok(None);
        }
        decode(&buf).map(Some).ok_or_else(|| StrataError::Internal {
            message: format!("malformed container init report: {buf:?}"),
        })
    }
}

impl ChildEnd {
    /// Blocks until the runtime releases the child.
    ///
    /// Runs in the container's init process.
    pub(crate) fn wait_for_go(&self) -> nix::Result<()> {
        let mut byte = [0_u8; 1];
        loop {
            match nix::unistd::read(&self.go_rx, &mut byte) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(Errno::EPIPE),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends a failure record. Best effort: the runtime may already be gone.
    ///
    /// Runs in the container's init process.
    pub(crate) fn report(&self, step: SetupStep, errno: Errno) {
        let record = encode(step, errno as i32);
        let _ = nix::unistd::write(&self.report_tx, &record);
    }
}

const fn encode(step: SetupStep, errno: i32) -> [u8; REPORT_LEN] {
    let e = errno.to_le_bytes();
    [step.code(), 0, 0, 0, e[0], e[1], e[2], e[3]]
}

fn decode(buf: &[u8]) -> Option<ChildFailure> {
    let record: [u8; REPORT_LEN] = buf.try_into().ok()?;
    let step = SetupStep::from_code(record[0])?;
    let errno = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
    Some(ChildFailure { step, errno })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_step_and_errno() {
        let record = encode(SetupStep::RootRebase, libc::EINVAL);
        assert_eq!(
            decode(&record),
            Some(ChildFailure {
                step: SetupStep::RootRebase,
                errno: libc::EINVAL,
            })
        );
    }

    #[test]
    fn truncated_or_unknown_records_are_rejected() {
        assert_eq!(decode(&[5, 0, 0]), None);
        assert_eq!(decode(&[250, 0, 0, 0, 1, 0, 0, 0]), None);
    }

    #[test]
    fn closed_report_pipe_means_exec() {
        let (mut parent, child) = channel().unwrap();
        drop(child);
        assert_eq!(parent.await_exec().unwrap(), None);
    }

    #[test]
    fn reported_failure_is_read_back() {
        let (mut parent, child) = channel().unwrap();
        child.report(SetupStep::Exec, Errno::ENOENT);
        drop(child);
        let failure = parent.await_exec().unwrap().unwrap();
        assert_eq!(failure.step, SetupStep::Exec);
        assert_eq!(failure.errno, libc::ENOENT);
    }

    #[test]
    fn go_byte_releases_the_child() {
        let (mut parent, child) = channel().unwrap();
        parent.release().unwrap();
        child.wait_for_go().unwrap();
    }

    #[test]
    fn dead_runtime_is_seen_as_eof() {
        let (parent, child) = channel().unwrap();
        drop(parent);
        assert_eq!(child.wait_for_go(), Err(Errno::EPIPE));
    }
}
