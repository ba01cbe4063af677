//! ANSI escape sequences used by the status display.

use std::sync::atomic::{AtomicBool, Ordering};

pub const BOLD: &str = "\x1b[1m";
pub const RED: &str = "\x1b[0;31m";
pub const YELLOW: &str = "\x1b[0;33m";
pub const CYAN: &str = "\x1b[0;36m";
pub const GREEN: &str = "\x1b[0;32m";
pub const INVERT: &str = "\x1b[7m";
pub const END: &str = "\x1b[0m";

pub const UP: &str = "\x1b[A";
pub const ERASE_AFTER: &str = "\x1b[K";
pub const ERASE_SCREEN_AFTER: &str = "\x1b[J";
pub const RETURN: &str = "\r";

static NO_COLOR: AtomicBool = AtomicBool::new(false);

pub fn set_no_color(no_color: bool) {
    NO_COLOR.store(no_color, Ordering::Relaxed);
}

/// Returns `seq` or the empty string when colors are disabled.
pub fn color(seq: &'static str) -> &'static str {
    if NO_COLOR.load(Ordering::Relaxed) { "" } else { seq }
}
