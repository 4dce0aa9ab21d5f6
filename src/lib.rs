#![allow(clippy::too_many_arguments)]

use anyhow::Result;
use rotator::RotatorError;
use storage::StorageError;
use task::TaskQueueError;
use url::Url;
use workflow::WorkflowError;

pub mod batch;
pub mod config;
pub mod gcp_oauth;
pub mod interval;
pub mod keys;
pub mod logging;
pub mod manifest;
pub mod metrics;
mod retries;
pub mod rotator;
pub mod secrets;
pub mod storage;
pub mod task;
pub mod test_utils;
mod work_queue;
pub mod workflow;

/// The format in which timestamps appear as object key path segments, e.g.
/// "2021/01/01/00/30".
pub const DATE_FORMAT: &str = "%Y/%m/%d/%H/%M";

/// The format in which timestamps appear in task marker names, e.g.
/// "2021-01-01-00-30".
pub const MARKER_DATE_FORMAT: &str = "%Y-%m-%d-%H-%M";

#[allow(clippy::large_enum_variant)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
    #[error("error parsing time: {0}")]
    TimeParse(#[from] chrono::ParseError),
    #[error("command line parsing error: {0}")]
    Clap(#[from] clap::Error),
    #[error("missing arguments: {0}")]
    MissingArguments(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    TaskQueue(#[from] TaskQueueError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Rotator(#[from] RotatorError),
    #[error(transparent)]
    Url(#[from] UrlParseError),
}

/// This trait captures whether a given error is due to corruption in data
/// obtained from an outside source, in which case it is unnecessary to retry
/// the operation, or due to I/O errors or cloud service API errors, in which
/// case the operation should be retried at a later time.
pub trait ErrorClassification {
    fn is_retryable(&self) -> bool;
}

impl ErrorClassification for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Catch-all error type -- retries OK.
            Error::AnyhowError(_) => true,
            // These errors likely indicate a problem with how this process
            // was invoked, its environment, or subsequent parsing of data
            // from an outside source. As such, the operation itself may be
            // retried once that is corrected.
            Error::Clap(_) | Error::MissingArguments(_) | Error::TimeParse(_) | Error::Url(_) => {
                true
            }
            // Dispatch to the wrapped error type.
            Error::Storage(e) => e.is_retryable(),
            Error::TaskQueue(e) => e.is_retryable(),
            Error::Workflow(e) => e.is_retryable(),
            Error::Rotator(e) => e.is_retryable(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse: {1}, {0}")]
pub struct UrlParseError(url::ParseError, String);

pub fn parse_url(input: String) -> Result<Url, UrlParseError> {
    Url::parse(&input).map_err(|e| UrlParseError(e, input))
}
