//! Error taxonomy shared by the page store, the applier and the client.

use thiserror::Error;

use crate::page::PageKey;

/// Errors surfaced by page-store operations.
///
/// `StaleWrite` never leaves the server: the applier absorbs it as a no-op.
/// `NotFound`/`NoVisibleVersion` are both reported as `not_found` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// No version of the page exists at all.
    #[error("page {0} not found")]
    NotFound(PageKey),

    /// The page exists, but nothing was stored at or below the requested LSN.
    #[error("page {key} has no version at or below lsn {lsn}")]
    NoVisibleVersion { key: PageKey, lsn: u64 },

    /// Write with a non-increasing LSN for the key.
    #[error("stale write to page {key}: lsn {lsn} <= current {current}")]
    StaleWrite { key: PageKey, lsn: u64, current: u64 },

    /// The applied watermark did not reach the requested LSN within the bounded wait.
    #[error("lsn {lsn} not applied yet (applied watermark {applied})")]
    NotApplied { lsn: u64, applied: u64 },

    /// Transport/connection failure after retries, or a timeout.
    #[error("page service unavailable: {0}")]
    Unavailable(String),

    /// Undecodable request, response or WAL payload.
    #[error("malformed {0}")]
    Malformed(String),

    /// Client was not configured with a service address or failed its startup ping.
    #[error("page service client is disabled")]
    Disabled,
}

impl PageError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        PageError::Malformed(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        PageError::Unavailable(msg.into())
    }

    /// Both "key unknown" and "nothing at or below LSN".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PageError::NotFound(_) | PageError::NoVisibleVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PageError>;
