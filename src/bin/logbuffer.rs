use std::{io::stdout, path::PathBuf, process::exit};

use anstyle::{AnsiColor, Color, Style};
use clap::Parser;
use nix::sys::signal::Signal;

use logbuffer::{
    backpressure::{WarnRateLimit, WarnSink},
    depth_counter::DepthCounter,
    get_terminal_width::get_terminal_width,
    pipeline::{self, PipelineConfig},
    sched_priority::PriorityMode,
    signals,
    unix::Status,
};

fn logbuffer_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .usage(Style::new().bold().underline())
        .header(Style::new().bold().underline())
        .literal(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))))
        .error(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack))))
}

#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
#[clap(term_width = get_terminal_width())]
#[clap(styles = logbuffer_styles())]
#[clap(version)]
/// Run a log-producing command and buffer its stdout lines through an
/// unbounded in-memory queue, re-emitting them on stdout in arrival
/// order. A slow consumer of our stdout then never blocks the
/// producer; the producer is read at elevated scheduling priority so
/// its pipe does not fill up while the consumer lags.
struct Opts {
    /// Queue length above which a backpressure warning is emitted
    /// (meaning the consumer is not keeping up).
    #[clap(long, default_value = "10000")]
    queue_warn_threshold: usize,

    /// Minimum number of seconds between two backpressure warnings.
    #[clap(long, default_value = "60")]
    queue_warn_interval_seconds: f64,

    /// File to append backpressure warnings to; stderr if not given.
    #[clap(long)]
    queue_warn_sink: Option<PathBuf>,

    /// Maintain a process-shared queue depth counter in this file (8
    /// bytes, memory-mapped); external observers can sample the
    /// current depth from it without talking to the daemon.
    #[clap(long)]
    queue_depth_counter: Option<PathBuf>,

    /// What to do when real-time scheduling priority cannot be set
    /// (e.g. for lack of privileges).
    #[clap(long, value_enum, default_value_t = PriorityMode::Require)]
    sched_priority: PriorityMode,

    /// The log source command and its arguments. Its stdout is read
    /// by the daemon, stderr is passed through. It is expected to run
    /// until it is terminated with SIGINT.
    #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    let opts = Opts::parse();

    if !(opts.queue_warn_interval_seconds.is_finite() && opts.queue_warn_interval_seconds > 0.0) {
        eprintln!("logbuffer: --queue-warn-interval-seconds must be a positive number");
        exit(1);
    }
    let warn_limit = WarnRateLimit::new(
        opts.queue_warn_threshold,
        std::time::Duration::from_secs_f64(opts.queue_warn_interval_seconds),
    );
    let warn_sink = match WarnSink::open(opts.queue_warn_sink.as_deref()) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("logbuffer: {e:#}");
            exit(1);
        }
    };
    let depth_counter = match &opts.queue_depth_counter {
        None => None,
        Some(path) => match DepthCounter::open(path) {
            Ok(counter) => Some(counter),
            Err(e) => {
                eprintln!("logbuffer: can't open queue depth counter {path:?}: {e}");
                exit(1);
            }
        },
    };

    let shutdown = match signals::install_handlers() {
        Ok(flag) => flag,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let config = PipelineConfig {
        command: opts.command,
        priority_mode: opts.sched_priority,
        warn_limit,
        warn_sink,
        depth_counter,
    };
    match pipeline::run(config, shutdown, stdout()) {
        Ok(status) => {
            if let Status::SignalExit(signal) = status {
                if signal != Signal::SIGINT {
                    eprintln!("logbuffer: log source terminated by signal {signal:?}");
                }
            }
            exit(status.daemon_exit_code())
        }
        Err(e) => {
            eprintln!("{e}");
            exit(1)
        }
    }
}
