//! The error vocabulary of the daemon. Everything that can go wrong
//! at runtime is representable as a [`WireError`], a (domain, code,
//! message) triple that can travel over the child's error pipe and be
//! printed at exit time. Module-level error types (see
//! `side_channel.rs`, `depth_counter.rs`) convert into it.

use nix::errno::Errno;

/// Domain for errors that wrap an OS error code; `code` is the errno
/// value.
pub const DOMAIN_ERRNO: &str = "errno";

/// Domain for conditions the daemon detects itself.
pub const DOMAIN_LOGBUFFER: &str = "logbuffer";

/// Codes within [`DOMAIN_LOGBUFFER`].
pub const CODE_EOF: i32 = 0;
pub const CODE_UNSPEC: i32 = 1;

/// A structured error: a domain name, a numeric code within that
/// domain, and a human-readable message. This is the unit the error
/// side channel transports (a child that fails between fork and exec
/// has no other way to tell the parent what happened), and also what
/// the top level reports on a fatal exit.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{domain} ({code}): {message}")]
pub struct WireError {
    pub domain: String,
    pub code: i32,
    pub message: String,
}

impl WireError {
    pub fn errno(context: &str, errno: Errno) -> Self {
        WireError {
            domain: DOMAIN_ERRNO.into(),
            code: errno as i32,
            message: format!("{context}: {}", errno.desc()),
        }
    }

    /// For IO errors from std interfaces; keeps the OS error code
    /// when there is one.
    pub fn io(context: &str, error: &std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(code) => WireError::errno(context, Errno::from_i32(code)),
            None => WireError {
                domain: DOMAIN_LOGBUFFER.into(),
                code: CODE_UNSPEC,
                message: format!("{context}: {error}"),
            },
        }
    }

    /// The log source closed its stdout without shutdown having been
    /// requested.
    pub fn source_eof() -> Self {
        WireError {
            domain: DOMAIN_LOGBUFFER.into(),
            code: CODE_EOF,
            message: "End of file found on log source pipe".into(),
        }
    }

    pub fn unspec(context: &str) -> Self {
        WireError {
            domain: DOMAIN_LOGBUFFER.into(),
            code: CODE_UNSPEC,
            message: format!("Unspecified error: {context}"),
        }
    }
}

#[test]
fn t_wire_error_display() {
    let e = WireError::errno("execvp", Errno::ENOENT);
    assert_eq!(e.domain, "errno");
    assert_eq!(e.code, Errno::ENOENT as i32);
    assert_eq!(
        e.to_string(),
        format!("errno ({}): execvp: {}", Errno::ENOENT as i32, Errno::ENOENT.desc())
    );
}
