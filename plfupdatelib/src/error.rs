use std::{
    fmt,
    io,
    path::PathBuf,
};

use log::{error, info};
use thiserror::Error;

use crate::{
    check::{ProtocolError, ServerErrorKind},
    plf::PlfError,
    product::Product,
    transport::TransportError,
};

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("Bad parameter: {0}")]
    BadParameter(String),
    #[error("Already initialized")]
    AlreadyInitialized,
    #[error("Not initialized")]
    NotInitialized,
    #[error("System resource failure: {0}")]
    SystemResource(String),
    #[error("Worker is still running")]
    ThreadBusy,
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Update server reported an error: {0}")]
    Server(ServerErrorKind),
    #[error("Malformed update server response: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Checksum ({actual}) does not match expected checksum ({expected})")]
    ChecksumMismatch {
        expected: String,
        actual: String,
    },
    #[error("Could not move {staging:?} to {canonical:?}: {source}")]
    Install {
        staging: PathBuf,
        canonical: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No PLF file found in {0:?}")]
    PlfFileNotFound(PathBuf),
    #[error("PLF error: {0}")]
    Plf(#[from] PlfError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UpdaterError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A cancelled transfer is reported as [`UpdaterError::Cancelled`], never as a
/// transport failure.
impl From<TransportError> for UpdaterError {
    fn from(e: TransportError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Transport(e)
        }
    }
}

/// How a download or upload run ended. This is what the completion callback
/// receives, exactly once per run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every product was processed
    Completed,
    /// The run was stopped by a cancel request
    Cancelled,
    /// The run stopped at the first error
    Failed(UpdaterError),
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn error(&self) -> Option<&UpdaterError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<(), UpdaterError> {
        match self {
            Self::Completed => Ok(()),
            Self::Cancelled => Err(UpdaterError::Cancelled),
            Self::Failed(e) => Err(e),
        }
    }
}

impl From<Result<(), UpdaterError>> for RunOutcome {
    fn from(result: Result<(), UpdaterError>) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(UpdaterError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e),
        }
    }
}

/// Receives the outcome of a run on the worker.
pub type CompletionCallback = Box<dyn Fn(&RunOutcome) + Send + Sync>;

/// Stage of a per-product cycle. Failures are logged with it so they can be
/// diagnosed from a log alone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    Resolve,
    Check,
    Download,
    Verify,
    Install,
    Upload,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "resolve",
            Self::Check => "check",
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Install => "install",
            Self::Upload => "upload",
        })
    }
}

impl Step {
    /// Log `result` if it is a failure of this step and pass it through.
    pub fn report<T>(self, product: Product, result: Result<T, UpdaterError>) -> Result<T, UpdaterError> {
        match &result {
            Err(e) if e.is_cancelled() => info!("[{}] Cancelled during {}", product, self),
            Err(e) => error!("[{}] {} failed: {}", product, self, e),
            Ok(_) => {}
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_transport_conversion() {
        assert_matches!(UpdaterError::from(TransportError::Cancelled), UpdaterError::Cancelled);
        assert_matches!(UpdaterError::from(TransportError::Status(500)),
                        UpdaterError::Transport(TransportError::Status(500)));
    }

    #[test]
    fn test_outcome() {
        assert_matches!(RunOutcome::from(Ok(())), RunOutcome::Completed);
        assert_matches!(RunOutcome::from(Err(UpdaterError::Cancelled)), RunOutcome::Cancelled);

        let outcome = RunOutcome::from(Err(UpdaterError::ThreadBusy));
        assert_matches!(outcome.error(), Some(UpdaterError::ThreadBusy));
        assert_matches!(outcome.into_result(), Err(UpdaterError::ThreadBusy));
    }

    #[test]
    fn test_step_report_passes_through() {
        assert_matches!(Step::Check.report(Product::ArDrone3, Ok(1)), Ok(1));
        assert_matches!(Step::Download.report::<()>(Product::ArDrone3, Err(UpdaterError::Cancelled)),
                        Err(UpdaterError::Cancelled));
        assert_eq!(Step::Verify.to_string(), "verify");
        assert_eq!(Step::Install.to_string(), "install");
    }
}
