//! The two loops and the coordinated teardown: the reader pulls
//! records off the log source at elevated priority and pushes them to
//! the queue; the sender drains the queue and writes downstream in
//! arrival order; on any terminal condition (signal, source EOF,
//! error) the teardown runs in a fixed order so that no buffered
//! record is lost and the subprocess is always reaped.

use std::{io::Write, sync::Arc, thread, time::Duration};

use crate::{
    backpressure::{Backpressure, WarnRateLimit, WarnSink},
    depth_counter::DepthCounter,
    errors::WireError,
    queue::RecordQueue,
    sched_priority::{self, PriorityMode, READER_THREAD_PRIORITY},
    signals::ShutdownFlag,
    source::{LogSource, SourceRead},
    unix::Status,
};

/// The sender polls instead of waiting on a condition: a short fixed
/// latency, and no lock shared with the reader.
const SENDER_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct PipelineConfig {
    /// The log source program and its arguments.
    pub command: Vec<String>,
    pub priority_mode: PriorityMode,
    pub warn_limit: WarnRateLimit,
    pub warn_sink: WarnSink,
    pub depth_counter: Option<DepthCounter>,
}

fn sender_main<W: Write>(
    queue: &RecordQueue,
    stop: ShutdownFlag,
    depth: Option<&DepthCounter>,
    backpressure: &mut Backpressure,
    mut out: W,
) -> Result<(), WireError> {
    loop {
        let batch = queue.drain_all_ordered();
        if batch.is_empty() {
            // The stop flag is only checked after a drain came back
            // empty: everything pushed before the stop was requested
            // is thereby written first.
            if stop.requested() {
                return Ok(());
            }
            thread::sleep(SENDER_POLL_INTERVAL);
            continue;
        }
        backpressure
            .observe(batch.len())
            .map_err(|e| WireError::io("writing backpressure warning", &e))?;
        for record in &batch {
            // A write failure downstream is fatal to the whole
            // daemon; the rest of the batch is discarded.
            out.write_all(record.as_bytes())
                .map_err(|e| WireError::io("writing record downstream", &e))?;
            out.write_all(b"\n")
                .map_err(|e| WireError::io("writing record downstream", &e))?;
            if let Some(depth) = depth {
                depth.decrement();
            }
        }
        out.flush()
            .map_err(|e| WireError::io("flushing records downstream", &e))?;
    }
}

/// Run the whole pipeline until the source ends, a fatal error
/// occurs, or `shutdown` is requested; then tear down in order and
/// return the reaped source's exit status. `out` is the daemon's
/// downstream output (stdout in production).
pub fn run<W: Write + Send + 'static>(
    config: PipelineConfig,
    shutdown: ShutdownFlag,
    out: W,
) -> Result<Status, WireError> {
    let PipelineConfig {
        command,
        priority_mode,
        warn_limit,
        warn_sink,
        depth_counter,
    } = config;

    // Fork before any thread exists.
    let mut source = LogSource::start(&command, priority_mode, shutdown)?;

    let queue = Arc::new(RecordQueue::new());
    let depth = depth_counter.map(Arc::new);
    if let Some(depth) = &depth {
        depth.reset();
    }
    let sender_stop = ShutdownFlag::detached();
    let mut backpressure = Backpressure::new(warn_limit, warn_sink);

    let sender_thread = {
        let queue = queue.clone();
        let depth = depth.clone();
        thread::Builder::new()
            .name("sender".into())
            .spawn(move || sender_main(&queue, sender_stop, depth.as_deref(), &mut backpressure, out))
            .map_err(|e| WireError::io("spawning sender thread", &e))?
    };

    let mut first_error: Option<WireError> = None;

    // Once, for the reader's entire lifetime: the source's pipe has
    // bounded capacity, so the reader is the one thread that must not
    // be held off the CPU while the sender or anything else runs.
    if let Err(e) = sched_priority::elevate_thread(priority_mode, READER_THREAD_PRIORITY) {
        first_error = Some(e);
    }

    if first_error.is_none() {
        loop {
            if shutdown.requested() {
                break;
            }
            match source.read_line() {
                Ok(SourceRead::Line(record)) => {
                    if let Some(depth) = &depth {
                        depth.increment();
                    }
                    queue.push(record);
                }
                Ok(SourceRead::ShutdownEof) => break,
                Err(e) => {
                    if shutdown.requested() {
                        // A read failing while we're being shut down
                        // anyway is part of stopping, not a crash.
                        break;
                    }
                    first_error = Some(e);
                    break;
                }
            }
        }
    }

    // Teardown order: reader has stopped (that's us), then stop the
    // sender and wait until it has written everything out, then
    // terminate and reap the source.
    shutdown.request();
    sender_stop.request();
    let sender_result = match sender_thread.join() {
        Ok(result) => result,
        Err(_) => Err(WireError::unspec("sender thread panicked")),
    };
    if first_error.is_none() {
        first_error = sender_result.err();
    }

    match first_error {
        None => {
            let status = source.shutdown()?;
            if !queue.drain_all_ordered().is_empty() {
                return Err(WireError::unspec("records left in queue after sender stopped"));
            }
            if let Some(depth) = &depth {
                let sample = depth.sample();
                if sample != 0 {
                    eprintln!("warning: queue depth counter reads {sample} at shutdown");
                }
            }
            status.ok_or_else(|| WireError::unspec("log source was never started"))
        }
        Some(e) => {
            // Full teardown also on the error path; the first error
            // is the one reported.
            let _ = source.shutdown();
            Err(e)
        }
    }
}
