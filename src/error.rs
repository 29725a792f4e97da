//! Error types for netrt
//!
//! One error enum covers every failure the service can hit, from association
//! handling through pipeline processing to egress. `Error::kind()` yields the
//! stable reason string recorded in `reason.txt` and the transaction log.

use thiserror::Error;

/// Main error type for the netrt service
#[derive(Error, Debug)]
pub enum Error {
    /// Study identifier failed sanitisation; the association is refused
    /// before anything touches the spool.
    #[error("malformed study identifier: {0:?}")]
    MalformedIdentifier(String),

    /// Study directory is missing required inputs (empty DCM/ or Structure/).
    #[error("incomplete study: {0}")]
    IncompleteStudy(String),

    /// No ROI survived the ignore-list filter.
    #[error("no region of interest left after filtering (ignored: {ignored:?})")]
    RoiEmpty { ignored: Vec<String> },

    /// Structure set references a different frame of reference than the
    /// image series.
    #[error("frame of reference mismatch: series {series}, structure set {structure_set}")]
    CoordinateMismatch {
        series: String,
        structure_set: String,
    },

    /// DICOM encoding/decoding errors from the codec layer.
    #[error("codec error: {0}")]
    Codec(String),

    /// File I/O errors on the spool or working tree.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network failure worth retrying (connection refused/reset, timeout).
    #[error("transient send failure: {0}")]
    SendTransient(String),

    /// Peer rejected the batch, or retries were exhausted.
    #[error("send failed: {0}")]
    SendFatal(String),

    /// Configuration is invalid; the service refuses to start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invariant violation or unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable lowercase error kind used in quarantine reasons and the
    /// transaction log.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedIdentifier(_) => "malformed-identifier",
            Error::IncompleteStudy(_) => "incomplete-study",
            Error::RoiEmpty { .. } => "roi-empty",
            Error::CoordinateMismatch { .. } => "coordinate-mismatch",
            Error::Codec(_) => "codec-error",
            Error::Io(_) => "io-error",
            Error::SendTransient(_) => "send-transient",
            Error::SendFatal(_) => "send-fatal",
            Error::Config(_) => "config-error",
            Error::Internal(_) => "internal",
        }
    }

    /// True for failures that quarantine the study rather than abort the
    /// service or refuse the association.
    pub fn quarantines(&self) -> bool {
        matches!(
            self,
            Error::IncompleteStudy(_)
                | Error::RoiEmpty { .. }
                | Error::CoordinateMismatch { .. }
                | Error::Codec(_)
                | Error::SendFatal(_)
                | Error::Internal(_)
        )
    }
}

impl From<dicom::object::ReadError> for Error {
    fn from(e: dicom::object::ReadError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<dicom::object::WriteError> for Error {
    fn from(e: dicom::object::WriteError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<dicom::object::AccessError> for Error {
    fn from(e: dicom::object::AccessError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<dicom::core::value::ConvertValueError> for Error {
    fn from(e: dicom::core::value::ConvertValueError) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Convenience Result type using the netrt Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(
            Error::MalformedIdentifier("..".into()).kind(),
            "malformed-identifier"
        );
        assert_eq!(Error::RoiEmpty { ignored: vec![] }.kind(), "roi-empty");
        assert_eq!(Error::SendFatal("x".into()).kind(), "send-fatal");
    }

    #[test]
    fn quarantine_policy_matches_error_class() {
        assert!(Error::IncompleteStudy("empty DCM".into()).quarantines());
        assert!(Error::Codec("truncated".into()).quarantines());
        // Refused at the association, never spooled.
        assert!(!Error::MalformedIdentifier("../evil".into()).quarantines());
        // Escalates to abort instead.
        assert!(!Error::Io(std::io::Error::other("disk gone")).quarantines());
        // Retried first; only the fatal form quarantines.
        assert!(!Error::SendTransient("refused".into()).quarantines());
    }
}
