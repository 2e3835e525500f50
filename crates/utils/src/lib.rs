//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.

mod path;
pub use path::*;
mod result_ext;
pub use result_ext::*;
mod tracing_util;
pub use tracing_util::*;

/// The name of our binary
pub const NAME: &str = "img";

/// Intended for use in `main`, calls an inner function and
/// handles errors by printing them.
pub fn run_main<F>(f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    use std::io::Write as _;

    if let Err(e) = f() {
        // Don't panic if writing fails.
        let _ = writeln!(std::io::stderr().lock(), "error: {e:#}");
        std::process::exit(1);
    }
}
