//! Signal handling. Handlers do nothing but set an atomic flag; all
//! decoding and teardown logic runs in ordinary thread context after
//! noticing a flag. Handlers are installed without SA_RESTART so that
//! blocking reads are interrupted (EINTR) and the loops get a chance
//! to observe the flags.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::{
    libc::c_int,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};

use crate::errors::WireError;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CHILD_ERROR_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signal: c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_io_signal(_signal: c_int) {
    CHILD_ERROR_PENDING.store(true, Ordering::SeqCst);
}

/// Handle to a shutdown flag: set once, polled by both loops, never
/// reset. [`install_handlers`] hands out the one connected to the
/// signal handlers; [`ShutdownFlag::detached`] makes an independent
/// one (the sender's stop flag, and tests).
#[derive(Clone, Copy)]
pub struct ShutdownFlag(&'static AtomicBool);

impl ShutdownFlag {
    /// A fresh flag not connected to any signal handler.
    pub fn detached() -> Self {
        ShutdownFlag(Box::leak(Box::new(AtomicBool::new(false))))
    }

    pub fn requested(self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn request(self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Install all handlers: SIGHUP/SIGINT/SIGTERM request shutdown,
/// SIGIO marks a child error as pending, SIGPIPE is ignored so that
/// writes to a closed-down consumer fail with EPIPE instead of
/// killing the process. Returns the process-wide shutdown flag.
pub fn install_handlers() -> Result<ShutdownFlag, WireError> {
    let against = |e: nix::errno::Errno| WireError::errno("sigaction", e);

    let shutdown_action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // NOTE: Failure partway through doesn't reset the already
    // installed handlers.
    for signal in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &shutdown_action) }.map_err(against)?;
    }

    let io_action = SigAction::new(
        SigHandler::Handler(on_io_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGIO, &io_action) }.map_err(against)?;

    let ignore_action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &ignore_action) }.map_err(against)?;

    Ok(ShutdownFlag(&SHUTDOWN))
}

/// Consume the child-error notification if one is pending. At most
/// one consumer sees a given notification.
pub fn take_child_error_pending() -> bool {
    CHILD_ERROR_PENDING.swap(false, Ordering::SeqCst)
}

#[test]
fn t_detached_flags_are_independent() {
    let a = ShutdownFlag::detached();
    let b = ShutdownFlag::detached();
    assert!(!a.requested());
    a.request();
    assert!(a.requested());
    assert!(!b.requested());
}
