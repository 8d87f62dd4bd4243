//! Real-time scheduling priority elevation. nix has no safe wrapper
//! for `sched_setscheduler` / `pthread_setschedparam`, thus raw libc.

use std::mem;

use nix::{
    errno::{errno, Errno},
    libc::{self, c_int},
};

use crate::errors::WireError;

/// Priority for the log source process itself; should stay above the
/// reader thread's so the source is never the one preempted.
/// Priorities range from 1 - 99. See chrt -m
pub const SOURCE_PROCESS_PRIORITY: c_int = 10;

/// Priority for the thread reading the source's pipe. The pipe has
/// bounded capacity; if the reader is held off the CPU for too long
/// the source blocks or the kernel drops data.
pub const READER_THREAD_PRIORITY: c_int = 9;

/// What to do when elevation is not possible (insufficient privilege,
/// unsupported platform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PriorityMode {
    /// Failure to elevate is fatal.
    Require,
    /// Warn on stderr and continue at normal priority.
    BestEffort,
    /// Do not attempt elevation at all.
    Off,
}

fn sched_fifo_param(prio: c_int) -> libc::sched_param {
    let mut param: libc::sched_param = unsafe { mem::zeroed() };
    param.sched_priority = prio;
    param
}

/// Put the whole calling process into SCHED_FIFO at `prio`. Only
/// effective on Linux; elsewhere there is no such scheduler class and
/// this reports the platform as unsupported.
fn set_process_fifo(prio: c_int) -> Result<(), WireError> {
    #[cfg(target_os = "linux")]
    {
        let param = sched_fifo_param(prio);
        let res = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if res == -1 {
            return Err(WireError::errno(
                "sched_setscheduler(SCHED_FIFO)",
                Errno::from_i32(errno()),
            ));
        }
        return Ok(());
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = prio;
        return Err(WireError::errno(
            "sched_setscheduler(SCHED_FIFO)",
            Errno::ENOSYS,
        ));
    }
}

/// Put the calling thread into SCHED_FIFO at `prio`.
/// pthread_setschedparam returns the error code directly instead of
/// setting errno.
fn set_thread_fifo(prio: c_int) -> Result<(), WireError> {
    let param = sched_fifo_param(prio);
    let res = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if res != 0 {
        return Err(WireError::errno(
            "pthread_setschedparam(SCHED_FIFO)",
            Errno::from_i32(res),
        ));
    }
    Ok(())
}

fn apply(mode: PriorityMode, what: &str, result: Result<(), WireError>) -> Result<(), WireError> {
    match mode {
        PriorityMode::Require => result,
        PriorityMode::BestEffort => {
            if let Err(e) = result {
                eprintln!("warning: running {what} at normal priority: {e}");
            }
            Ok(())
        }
        PriorityMode::Off => unreachable!("caller checks Off"),
    }
}

/// Elevate the calling process, honoring `mode`. Used by the child
/// between fork and exec.
pub fn elevate_process(mode: PriorityMode, prio: c_int) -> Result<(), WireError> {
    if mode == PriorityMode::Off {
        return Ok(());
    }
    apply(mode, "the log source", set_process_fifo(prio))
}

/// Elevate the calling thread, honoring `mode`. Used once by the
/// reader for its entire lifetime.
pub fn elevate_thread(mode: PriorityMode, prio: c_int) -> Result<(), WireError> {
    if mode == PriorityMode::Off {
        return Ok(());
    }
    apply(mode, "the reader", set_thread_fifo(prio))
}

#[test]
fn t_off_mode_is_a_noop() {
    assert!(elevate_process(PriorityMode::Off, SOURCE_PROCESS_PRIORITY).is_ok());
    assert!(elevate_thread(PriorityMode::Off, READER_THREAD_PRIORITY).is_ok());
}

#[test]
fn t_best_effort_swallows_failure() {
    // Unprivileged test runs can't get SCHED_FIFO; best-effort must
    // still succeed. (If the runner *is* privileged the elevation
    // itself succeeds, which is equally Ok.)
    assert!(elevate_thread(PriorityMode::BestEffort, READER_THREAD_PRIORITY).is_ok());
}
