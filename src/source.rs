//! Supervision of the log source subprocess: spawning with its stdout
//! on our pipe, the error side channel for post-fork failures,
//! line-oriented reading, and termination + reaping.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::{close, dup2, execvp, pipe, Pid},
};

use crate::{
    errors::WireError,
    line_reader::{LineRead, LineReader},
    queue::Record,
    sched_priority::{self, PriorityMode, SOURCE_PROCESS_PRIORITY},
    side_channel,
    signals::{self, ShutdownFlag},
    unix::{fork_log_source, waitpid_until_gone, Status},
};

/// Outcome of [`LogSource::read_line`] short of an error.
#[derive(Debug)]
pub enum SourceRead {
    Line(Record),
    /// Shutdown was requested while blocked in the read.
    ShutdownEof,
}

/// Handle on the running log source. The pid and the streams are
/// independently nullable because teardown can happen partially when
/// setup fails; `shutdown` clears them as it goes and is safe to call
/// again afterwards.
pub struct LogSource {
    pid: Option<Pid>,
    out_fd: Option<RawFd>,
    reader: Option<LineReader>,
    err_fd: Option<RawFd>,
}

/// Report `error` over the side channel, then exit with a failure
/// status. Only for use in the child.
fn child_fail(err_w: RawFd, error: WireError) -> ! {
    let _ = side_channel::send(err_w, &error);
    std::process::exit(1)
}

/// Everything the child does between fork and exec. Any failure is
/// serialized onto the side channel before exiting with a failure
/// status; the fork return value alone cannot carry it.
fn child_main(
    command: &[CString],
    out_r: RawFd,
    out_w: RawFd,
    err_r: RawFd,
    err_w: RawFd,
    priority_mode: PriorityMode,
) -> ! {
    let close_or_fail = |fd: RawFd| {
        if let Err(errno) = close(fd) {
            child_fail(err_w, WireError::errno("close in child", errno))
        }
    };

    close_or_fail(err_r);
    close_or_fail(out_r);
    if let Err(errno) = dup2(out_w, 1) {
        child_fail(err_w, WireError::errno("dup2 to stdout", errno))
    }
    close_or_fail(out_w);

    if let Err(e) = sched_priority::elevate_process(priority_mode, SOURCE_PROCESS_PRIORITY) {
        child_fail(err_w, e)
    }

    // err_w is close-on-exec; on success the parent sees the channel
    // close without content.
    match execvp(&command[0], command) {
        Ok(never) => match never {},
        Err(errno) => child_fail(err_w, WireError::errno("execvp", errno)),
    }
}

impl LogSource {
    /// Spawn `command` with its stdout on a pipe of ours and the side
    /// channel armed. Must be called before the pipeline threads are
    /// started (it forks).
    pub fn start(
        command: &[String],
        priority_mode: PriorityMode,
        shutdown: ShutdownFlag,
    ) -> Result<LogSource, WireError> {
        let command: Vec<CString> = command
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes())
                    .map_err(|_| WireError::unspec("command argument contains a NUL byte"))
            })
            .collect::<Result<_, _>>()?;
        if command.is_empty() {
            return Err(WireError::unspec("empty log source command"));
        }

        let (out_r, out_w) = pipe().map_err(|e| WireError::errno("pipe for source stdout", e))?;
        let (err_r, err_w) = pipe().map_err(|e| WireError::errno("pipe for error channel", e))?;
        side_channel::set_cloexec(err_w).map_err(WireError::from)?;

        match fork_log_source().map_err(|e| WireError::errno("fork", e))? {
            None => child_main(&command, out_r, out_w, err_r, err_w, priority_mode),
            Some(pid) => {
                // From here on the handle owns the child; dropping it
                // on an error return below signals and reaps.
                let mut source = LogSource {
                    pid: Some(pid),
                    out_fd: Some(out_r),
                    reader: None,
                    err_fd: Some(err_r),
                };
                close(out_w).map_err(|e| WireError::errno("closing source stdout write end", e))?;
                close(err_w).map_err(|e| WireError::errno("closing error channel write end", e))?;
                side_channel::arm_async_notification(err_r).map_err(WireError::from)?;
                source.reader = Some(LineReader::new(out_r, shutdown));
                Ok(source)
            }
        }
    }

    /// When a read just failed and a side channel notification is
    /// pending, the child's own report is the truer diagnosis than
    /// the generic failure. A channel that closed without content
    /// means the exec went through fine, keep the original error
    /// then. This is inherently racy (the child may not have sent the
    /// notification yet); a late report only costs diagnosis quality,
    /// not correctness.
    fn diagnose(&mut self, fallback: WireError) -> WireError {
        if !signals::take_child_error_pending() {
            return fallback;
        }
        let Some(err_fd) = self.err_fd else {
            return fallback;
        };
        match side_channel::receive(err_fd) {
            Ok(child_error) => child_error,
            Err(side_channel::ChannelError::PrematureEof) => fallback,
            Err(e) => e.into(),
        }
    }

    /// Read the next record off the source's stdout. End of stream is
    /// an error here: the source is expected to outlive every read
    /// unless shutdown was requested.
    pub fn read_line(&mut self) -> Result<SourceRead, WireError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| WireError::unspec("log source already torn down"))?;
        match reader.next_line() {
            Ok(LineRead::Line(record)) => Ok(SourceRead::Line(record)),
            Ok(LineRead::ShutdownEof) => Ok(SourceRead::ShutdownEof),
            Ok(LineRead::Eof) => Err(self.diagnose(WireError::source_eof())),
            Err(e) => Err(self.diagnose(e)),
        }
    }

    /// Terminate and reap: SIGINT (already-gone is fine), close the
    /// stdout stream, wait for the exit status, release the side
    /// channel. Idempotent; later calls return `Ok(None)`.
    pub fn shutdown(&mut self) -> Result<Option<Status>, WireError> {
        let Some(pid) = self.pid else {
            return Ok(None);
        };
        match kill(pid, Signal::SIGINT) {
            Ok(()) => (),
            Err(Errno::ESRCH) => (), // already exited, will still be reaped below
            Err(errno) => return Err(WireError::errno("kill(SIGINT)", errno)),
        }
        self.reader = None;
        if let Some(fd) = self.out_fd.take() {
            close(fd).map_err(|e| WireError::errno("closing source stdout", e))?;
        }
        let status =
            waitpid_until_gone(pid).map_err(|e| WireError::errno("waiting for log source", e))?;
        self.pid = None;
        if let Some(fd) = self.err_fd.take() {
            close(fd).map_err(|e| WireError::errno("closing error channel", e))?;
        }
        Ok(Some(status))
    }
}

impl Drop for LogSource {
    fn drop(&mut self) {
        // The subprocess must always be reaped, also on error paths
        // that never reached an orderly `shutdown`.
        if self.pid.is_some() {
            let _ = self.shutdown();
        }
    }
}
