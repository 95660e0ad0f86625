//! Soft/fatal error taxonomy shared by both transfer roles

use thiserror::Error;

/// A transfer error. `Soft` covers a single entity (one file or directory
/// that could not be opened, copied, or finalized) and never stops the
/// session. `Fatal` means the stream can no longer be trusted and the whole
/// invocation must unwind. `Many` aggregates the soft errors collected while
/// walking a path list or a directory body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CopyError {
    #[error("{0}")]
    Soft(String),
    #[error("{0}")]
    Fatal(String),
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Many(Vec<CopyError>),
}

impl CopyError {
    pub fn soft(msg: impl Into<String>) -> Self {
        CopyError::Soft(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CopyError::Fatal(msg.into())
    }

    /// Only a `Fatal` unwinds the session; `Many` is built exclusively from
    /// soft errors.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CopyError::Fatal(_))
    }

    /// Fold accumulated soft errors into a result. A single error is
    /// returned as itself, several are wrapped in `Many`.
    pub fn collect(mut errs: Vec<CopyError>) -> Result<(), CopyError> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(CopyError::Many(errs)),
        }
    }
}
