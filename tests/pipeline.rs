//! Whole-pipeline tests against shell one-liners standing in for the
//! log source.
//!
//! The child-error notification flag and the signal handlers are
//! process globals, so every test here takes `lock()` first and runs
//! alone.

use std::{
    io::Write,
    os::unix::thread::JoinHandleExt,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use nix::{
    errno::Errno,
    libc,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};

use logbuffer::{
    backpressure::{WarnRateLimit, WarnSink},
    depth_counter::DepthCounter,
    errors::{WireError, DOMAIN_ERRNO, DOMAIN_LOGBUFFER},
    pipeline::{self, PipelineConfig},
    sched_priority::PriorityMode,
    signals::{self, ShutdownFlag},
    source::LogSource,
    unix::Status,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    signals::install_handlers().expect("install handlers");
    // A previous test's notification must not leak into this one.
    signals::take_child_error_pending();
    guard
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

fn tmp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("logbuffer-pipeline-{}-{name}", std::process::id()))
}

/// Write target that the test can inspect while the sender owns it.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn snapshot(&self) -> Vec<u8> {
        self.0.lock().expect("buf lock").clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buf lock").extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn config(command: Vec<String>) -> PipelineConfig {
    PipelineConfig {
        command,
        // Test runs are usually unprivileged.
        priority_mode: PriorityMode::Off,
        warn_limit: WarnRateLimit::new(10000, Duration::from_secs(60)),
        warn_sink: WarnSink::Stderr,
        depth_counter: None,
    }
}

#[test]
fn t_ordered_delivery_then_source_eof_is_fatal() {
    let _serial = lock();
    let warn_path = tmp_path("warnings");
    let _ = std::fs::remove_file(&warn_path);

    let out = SharedBuf::default();
    let mut config = config(sh("printf 'a\\nb\\nc\\n'"));
    // Impossible threshold plus a long interval: the very first
    // non-empty batch warns, everything after is rate-limited away.
    config.warn_limit = WarnRateLimit::new(0, Duration::from_secs(3600));
    config.warn_sink = WarnSink::open(Some(&warn_path)).expect("open warn sink");

    let result = pipeline::run(config, ShutdownFlag::detached(), out.clone());
    match result {
        Err(WireError { domain, message, .. }) => {
            assert_eq!(domain, DOMAIN_LOGBUFFER);
            assert!(message.contains("End of file"), "got message {message:?}");
        }
        other => panic!("expected the end-of-stream error, got {other:?}"),
    }
    // Everything read before the end still went out, in order.
    assert_eq!(out.snapshot(), b"a\nb\nc\n");

    let warnings = std::fs::read_to_string(&warn_path).expect("read warn sink");
    assert_eq!(warnings.lines().count(), 1, "got warnings {warnings:?}");
    assert!(
        warnings.starts_with("Queue length too large ("),
        "got warnings {warnings:?}"
    );
    std::fs::remove_file(&warn_path).expect("remove");
}

extern "C" fn noop_handler(_signal: libc::c_int) {}

#[test]
fn t_shutdown_request_still_delivers_buffered_records() {
    let _serial = lock();
    // The wakeup signal used to interrupt the reader's blocking read,
    // as the real shutdown signals would.
    let action = SigAction::new(
        SigHandler::Handler(noop_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }.expect("sigaction");

    let counter_path = tmp_path("depth");
    let _ = std::fs::remove_file(&counter_path);

    let out = SharedBuf::default();
    let shutdown = ShutdownFlag::detached();
    let mut config = config(sh("printf 'a\\nb\\n'; sleep 30"));
    config.depth_counter = Some(DepthCounter::open(&counter_path).expect("open counter"));

    let daemon = {
        let out = out.clone();
        thread::spawn(move || pipeline::run(config, shutdown, out))
    };

    // Wait until both records made it downstream, then ask for
    // shutdown and poke the reader out of its blocking read.
    for _ in 0..1000 {
        if out.snapshot() == b"a\nb\n" {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(out.snapshot(), b"a\nb\n");
    shutdown.request();
    let daemon_thread = daemon.as_pthread_t();
    for _ in 0..600 {
        if daemon.is_finished() {
            break;
        }
        unsafe { libc::pthread_kill(daemon_thread, libc::SIGUSR1) };
        thread::sleep(Duration::from_millis(50));
    }

    let status = daemon
        .join()
        .expect("daemon thread")
        .expect("clean shutdown");
    // `sh` got the SIGINT; either way this is a requested stop, not a
    // crash.
    assert_eq!(status.daemon_exit_code(), 0);
    assert_eq!(out.snapshot(), b"a\nb\n");

    let counter = DepthCounter::open(&counter_path).expect("reopen counter");
    assert_eq!(counter.sample(), 0);
    std::fs::remove_file(&counter_path).expect("remove");
}

#[test]
fn t_exec_failure_surfaces_the_child_report() {
    let _serial = lock();
    let command = vec!["/definitely/not/an/existing/binary".to_string()];
    let mut source = LogSource::start(&command, PriorityMode::Off, ShutdownFlag::detached())
        .expect("start");
    // Give the child time to report and the notification to arrive.
    thread::sleep(Duration::from_millis(300));
    match source.read_line() {
        Err(WireError { domain, code, message }) => {
            assert_eq!(domain, DOMAIN_ERRNO);
            assert_eq!(code, Errno::ENOENT as i32);
            assert!(message.contains("execvp"), "got message {message:?}");
        }
        other => panic!("expected the child's execvp error, got {other:?}"),
    }
    let status = source.shutdown().expect("shutdown").expect("status");
    assert_eq!(status, Status::NormalExit(1));
    // Idempotent from here on.
    assert!(matches!(source.shutdown(), Ok(None)));
}

#[test]
fn t_successful_exec_closes_the_channel_silently() {
    let _serial = lock();
    // A source that execs fine and exits without output: the error
    // channel just closes, so the read failure must stay the plain
    // end-of-stream one, not a side channel condition.
    let mut source = LogSource::start(&sh("exit 0"), PriorityMode::Off, ShutdownFlag::detached())
        .expect("start");
    thread::sleep(Duration::from_millis(300));
    match source.read_line() {
        Err(WireError { domain, message, .. }) => {
            assert_eq!(domain, DOMAIN_LOGBUFFER);
            assert!(message.contains("End of file"), "got message {message:?}");
        }
        other => panic!("expected the end-of-stream error, got {other:?}"),
    }
    let status = source.shutdown().expect("shutdown").expect("status");
    assert_eq!(status, Status::NormalExit(0));
}
