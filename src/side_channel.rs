//! The error side channel: a pipe over which the forked child
//! reports a structured error ([`WireError`]) when it fails after the
//! fork but before or during exec, i.e. when it has no other way to
//! tell the parent what happened.
//!
//! Wire encoding, in order: NUL-terminated domain name, the error
//! code as the native-endian bytes of an i32, NUL-terminated message.
//!
//! Readiness notification is decoupled from content transfer: the
//! read end is put into O_ASYNC mode so the kernel raises SIGIO at
//! the parent when the channel becomes readable (see `signals.rs`);
//! the decode itself is always a plain blocking read.

use std::os::unix::io::RawFd;

use nix::{
    errno::{errno, Errno},
    libc,
    unistd::{self, getpid},
};

use crate::errors::{WireError, CODE_EOF, DOMAIN_LOGBUFFER};

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// The peer closed the channel without sending a complete error.
    /// Distinct from "no error": with zero bytes sent it means the
    /// exec went through and nothing was ever reported.
    #[error("Premature end of file")]
    PrematureEof,
    #[error("{context}: {errno}")]
    Errno {
        context: &'static str,
        errno: Errno,
    },
}

impl From<ChannelError> for WireError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::PrematureEof => WireError {
                domain: DOMAIN_LOGBUFFER.into(),
                code: CODE_EOF,
                message: "Premature end of file".into(),
            },
            ChannelError::Errno { context, errno } => WireError::errno(context, errno),
        }
    }
}

fn write_all(fd: RawFd, mut bytes: &[u8]) -> Result<(), ChannelError> {
    while !bytes.is_empty() {
        match unistd::write(fd, bytes) {
            Ok(0) => return Err(ChannelError::PrematureEof),
            Ok(n) => bytes = &bytes[n..],
            Err(Errno::EINTR) => (),
            Err(errno) => {
                return Err(ChannelError::Errno {
                    context: "writing error channel",
                    errno,
                })
            }
        }
    }
    Ok(())
}

/// Transmit `error` over the channel's write end. Pipe writes are
/// unbuffered, so all fields have reached the peer when this returns.
pub fn send(fd: RawFd, error: &WireError) -> Result<(), ChannelError> {
    write_all(fd, error.domain.as_bytes())?;
    write_all(fd, &[0])?;
    write_all(fd, &error.code.to_ne_bytes())?;
    write_all(fd, error.message.as_bytes())?;
    write_all(fd, &[0])?;
    Ok(())
}

fn read_byte(fd: RawFd) -> Result<Option<u8>, ChannelError> {
    let mut byte = [0u8; 1];
    loop {
        match unistd::read(fd, &mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(Errno::EINTR) => (),
            Err(errno) => {
                return Err(ChannelError::Errno {
                    context: "reading error channel",
                    errno,
                })
            }
        }
    }
}

fn read_until_nul(fd: RawFd) -> Result<Vec<u8>, ChannelError> {
    let mut bytes = Vec::new();
    loop {
        match read_byte(fd)? {
            None => return Err(ChannelError::PrematureEof),
            Some(0) => return Ok(bytes),
            Some(b) => bytes.push(b),
        }
    }
}

/// Decode one error off the channel's read end, blocking. EOF inside
/// any field is [`ChannelError::PrematureEof`].
pub fn receive(fd: RawFd) -> Result<WireError, ChannelError> {
    let domain = read_until_nul(fd)?;
    let mut code_bytes = [0u8; 4];
    for slot in code_bytes.iter_mut() {
        match read_byte(fd)? {
            None => return Err(ChannelError::PrematureEof),
            Some(b) => *slot = b,
        }
    }
    let message = read_until_nul(fd)?;
    Ok(WireError {
        domain: String::from_utf8_lossy(&domain).into_owned(),
        code: i32::from_ne_bytes(code_bytes),
        message: String::from_utf8_lossy(&message).into_owned(),
    })
}

/// Request SIGIO delivery to this process when `fd` becomes readable.
/// nix has no wrapper for F_SETOWN, thus raw fcntl.
pub fn arm_async_notification(fd: RawFd) -> Result<(), ChannelError> {
    let against = |context| ChannelError::Errno {
        context,
        errno: Errno::from_i32(errno()),
    };
    let res = unsafe { libc::fcntl(fd, libc::F_SETOWN, getpid().as_raw()) };
    if res == -1 {
        return Err(against("fcntl(F_SETOWN)"));
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(against("fcntl(F_GETFL)"));
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC) };
    if res == -1 {
        return Err(against("fcntl(F_SETFL, O_ASYNC)"));
    }
    Ok(())
}

/// Mark the write end close-on-exec: a successful exec closes the
/// channel, which the parent can tell apart from a reported error
/// (premature EOF vs. a decoded one).
pub fn set_cloexec(fd: RawFd) -> Result<(), ChannelError> {
    let res = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if res == -1 {
        return Err(ChannelError::Errno {
            context: "fcntl(F_SETFD, FD_CLOEXEC)",
            errno: Errno::from_i32(errno()),
        });
    }
    Ok(())
}
