//! `logbuffer` sits between a high-volume log-producing subprocess
//! (the log source) and whatever reads the daemon's stdout, buffering
//! lines through an unbounded in-memory queue so that a temporarily
//! slow consumer never blocks or loses the producer's output. The
//! source is supervised: spawned with elevated scheduling priority,
//! its post-fork failures reported over an error side channel, and
//! always signalled and reaped on the way out.

pub mod backpressure;
pub mod depth_counter;
pub mod errors;
pub mod get_terminal_width;
pub mod line_reader;
pub mod pipeline;
pub mod queue;
pub mod sched_priority;
pub mod side_channel;
pub mod signals;
pub mod source;
pub mod unix;
