use std::fmt::Display;

/// Helpers intended for [`Result`].
pub trait ResultExt<T, E> {
    /// Log the error (at warn level) and discard it, returning the Ok value if any.
    fn log_err(self) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    fn log_err(self) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("{e}");
                None
            }
        }
    }
}
