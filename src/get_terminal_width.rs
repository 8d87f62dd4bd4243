//! Hack to get a terminal width for Clap help wrapping. The daemon
//! normally runs as a pipeline stage with stdout piped, in which case
//! there is no width to detect and a fixed default is used.

use terminal_size::{terminal_size, Width};

/// Always returns a width, falling back to a default value of 120.
pub fn get_terminal_width() -> usize {
    let default = 120;
    if let Some((Width(width), _height)) = terminal_size() {
        usize::from(width)
    } else {
        default
    }
}
