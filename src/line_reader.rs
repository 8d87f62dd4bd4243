//! Line framing on top of a raw pipe file descriptor. std's
//! `BufRead` retries EINTR internally, which would keep the reader
//! stuck in a blocking read across a shutdown signal; reading via
//! `nix` keeps the interruption visible so the shutdown flag can be
//! consulted.

use std::os::unix::io::RawFd;

use nix::{errno::Errno, unistd};

use crate::{errors::WireError, queue::Record, signals::ShutdownFlag};

const READ_CHUNK_SIZE: usize = 8192;

/// Outcome of one framing step.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(Record),
    /// The stream ended (all buffered bytes were consumed).
    Eof,
    /// A read was interrupted and shutdown has been requested; the
    /// caller should stop pulling lines.
    ShutdownEof,
}

pub struct LineReader {
    fd: RawFd,
    buf: Vec<u8>,
    /// Bytes of `buf` below this index are known to contain no
    /// newline (avoids re-scanning on every refill).
    scanned: usize,
    saw_eof: bool,
    shutdown: ShutdownFlag,
}

impl LineReader {
    /// Does not take ownership of `fd`; closing it stays with the
    /// caller.
    pub fn new(fd: RawFd, shutdown: ShutdownFlag) -> Self {
        LineReader {
            fd,
            buf: Vec::new(),
            scanned: 0,
            saw_eof: false,
            shutdown,
        }
    }

    fn take_line(&mut self, newline_index: usize) -> Record {
        let mut line: Vec<u8> = self.buf.drain(..=newline_index).collect();
        line.pop(); // the terminator
        self.scanned = 0;
        Record::from(line)
    }

    /// Yield the next record, with its single trailing newline
    /// stripped. A final chunk that the stream closed on without a
    /// terminator is still returned as a record, best effort;
    /// encountering the end with nothing buffered is a clean
    /// [`LineRead::Eof`]. EINTR is retried transparently unless
    /// shutdown was requested in the meantime.
    pub fn next_line(&mut self) -> Result<LineRead, WireError> {
        loop {
            if let Some(found) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                return Ok(LineRead::Line(self.take_line(self.scanned + found)));
            }
            self.scanned = self.buf.len();

            if self.saw_eof {
                if self.buf.is_empty() {
                    return Ok(LineRead::Eof);
                }
                // Truncated final record.
                let line: Vec<u8> = self.buf.drain(..).collect();
                self.scanned = 0;
                return Ok(LineRead::Line(Record::from(line)));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match unistd::read(self.fd, &mut chunk) {
                Ok(0) => self.saw_eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(Errno::EINTR) => {
                    if self.shutdown.requested() {
                        return Ok(LineRead::ShutdownEof);
                    }
                }
                Err(errno) => return Err(WireError::errno("reading log source pipe", errno)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{close, pipe, write};

    fn reader_on(bytes: &[u8]) -> LineReader {
        let (r, w) = pipe().expect("pipe");
        write(w, bytes).expect("write");
        close(w).expect("close");
        LineReader::new(r, ShutdownFlag::detached())
    }

    fn line(s: &str) -> LineRead {
        LineRead::Line(Record::from(s.as_bytes().to_vec()))
    }

    #[test]
    fn t_lines_and_clean_eof() {
        let mut r = reader_on(b"a\nbc\n\n");
        assert_eq!(r.next_line().unwrap(), line("a"));
        assert_eq!(r.next_line().unwrap(), line("bc"));
        assert_eq!(r.next_line().unwrap(), line(""));
        assert_eq!(r.next_line().unwrap(), LineRead::Eof);
        // And it stays there.
        assert_eq!(r.next_line().unwrap(), LineRead::Eof);
    }

    #[test]
    fn t_truncated_final_record() {
        let mut r = reader_on(b"complete\npartial");
        assert_eq!(r.next_line().unwrap(), line("complete"));
        assert_eq!(r.next_line().unwrap(), line("partial"));
        assert_eq!(r.next_line().unwrap(), LineRead::Eof);
    }

    #[test]
    fn t_empty_stream() {
        let mut r = reader_on(b"");
        assert_eq!(r.next_line().unwrap(), LineRead::Eof);
    }

    extern "C" fn noop_handler(_signal: nix::libc::c_int) {}

    #[test]
    fn t_interrupted_read_is_retried() {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        use std::os::unix::thread::JoinHandleExt;

        // A do-nothing handler without SA_RESTART, so the blocking
        // read comes back with EINTR.
        let action = SigAction::new(
            SigHandler::Handler(noop_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGUSR2, &action) }.expect("sigaction");

        let (r, w) = pipe().expect("pipe");
        let reader_thread = std::thread::spawn(move || {
            let mut reader = LineReader::new(r, ShutdownFlag::detached());
            reader.next_line()
        });
        let pthread = reader_thread.as_pthread_t();
        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(50));
            unsafe { nix::libc::pthread_kill(pthread, nix::libc::SIGUSR2) };
        }
        write(w, b"alive\n").expect("write");
        let result = reader_thread.join().expect("join");
        assert_eq!(result.unwrap(), line("alive"));
        close(w).expect("close");
    }

    #[test]
    fn t_record_spanning_refills() {
        let long = vec![b'x'; READ_CHUNK_SIZE + 17];
        let mut bytes = long.clone();
        bytes.push(b'\n');
        let mut r = reader_on(&bytes);
        match r.next_line().unwrap() {
            LineRead::Line(record) => assert_eq!(record.as_bytes(), &long[..]),
            other => panic!("expected a line, got {other:?}"),
        }
        assert_eq!(r.next_line().unwrap(), LineRead::Eof);
    }
}
