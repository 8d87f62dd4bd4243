//! Some utilities for unix specific functionality

use nix::{
    errno::Errno,
    sys::signal::Signal,
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, ForkResult, Pid},
};
use num_threads::is_single_threaded;

/// Fork off the log source child. If a Pid is given, it's the parent.
///
/// The child side allocates (error formatting) before exec'ing, which
/// is only OK while no other threads are running; the pipeline
/// threads are started after the fork, but test harnesses hold their
/// own threads, so only warn instead of refusing.
pub fn fork_log_source() -> Result<Option<Pid>, Errno> {
    match is_single_threaded() {
        Some(true) => (),
        Some(false) | None => {
            eprintln!(
                "warning: forking while other threads may be running; \
                 the child must exec right away"
            );
        }
    }
    match unsafe {
        // The child does nothing but descriptor shuffling, priority
        // setup and exec (or reports the failure and exits).
        fork()
    }? {
        ForkResult::Parent { child, .. } => Ok(Some(child)),
        ForkResult::Child => Ok(None),
    }
}

/// How a reaped child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NormalExit(i32),
    SignalExit(Signal),
}

impl Status {
    /// The exit code the daemon itself should use: the log source is
    /// expected to run until we interrupt it, so termination by
    /// SIGINT is success, not a crash. Any other exit status passes
    /// through; death by another signal maps to failure (there is no
    /// meaningful code to forward).
    pub fn daemon_exit_code(self) -> i32 {
        match self {
            Status::NormalExit(code) => code,
            Status::SignalExit(Signal::SIGINT) => 0,
            Status::SignalExit(_) => 1,
        }
    }
}

// Really wait until the given process has ended,
// and return a simpler enum. Our signal handlers are installed
// without SA_RESTART, so the wait itself can be interrupted; that is
// retried, too.
pub fn waitpid_until_gone(pid: Pid) -> Result<Status, Errno> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_pid, exitcode)) => return Ok(Status::NormalExit(exitcode)),
            Ok(WaitStatus::Signaled(_pid, signal, _bool)) => {
                return Ok(Status::SignalExit(signal))
            }
            Ok(_) => {}                  // retry
            Err(Errno::EINTR) => {}      // retry
            Err(errno) => return Err(errno),
        }
    }
}

#[test]
fn t_daemon_exit_code() {
    assert_eq!(Status::NormalExit(0).daemon_exit_code(), 0);
    assert_eq!(Status::NormalExit(3).daemon_exit_code(), 3);
    assert_eq!(Status::SignalExit(Signal::SIGINT).daemon_exit_code(), 0);
    assert_eq!(Status::SignalExit(Signal::SIGKILL).daemon_exit_code(), 1);
}
