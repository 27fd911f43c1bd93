//! Error taxonomy and phase attribution for ingestion jobs.
//!
//! Every failure is an explicit [`IngestError`] variant. The pipeline records
//! the [`Phase`] it had reached when the failure surfaced, and
//! [`ErrorCategory::classify`] combines the two into the category reported to
//! operators.

use crate::duplicates::DuplicateSummary;
use crate::storage::StorageError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that end an ingestion job early.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Source bucket {bucket} is not in the allowed source list")]
    SourceNotAllowed { bucket: String },

    #[error("Object size {size} bytes exceeds the {limit} byte limit")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("Key {key} is already under the {prefix} prefix")]
    AlreadyHandled { key: String, prefix: String },

    #[error("Unsupported file format: {extension:?}")]
    UnsupportedFormat { extension: String },

    #[error("Failed to download s3://{bucket}/{key}: {source}")]
    DownloadFailure {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error(
        "Duplicate of {} ({}), source handled with {}",
        .0.matched_record.as_deref().unwrap_or("unknown record"),
        .0.match_reason,
        .0.action
    )]
    DuplicateDetected(Box<DuplicateSummary>),

    #[error("Duplicate {action} failed for {key}: {source}")]
    DuplicateResolution {
        action: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Image processing failed: {0}")]
    ImageProcessing(String),

    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    ProcessingTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Failed to upload {key}: {source}")]
    UploadFailure {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("{0}")]
    Unknown(String),
}

impl IngestError {
    /// Category carried by the variant itself, independent of where it surfaced.
    fn intrinsic_category(&self) -> Option<ErrorCategory> {
        match self {
            IngestError::InvalidEvent(_) => Some(ErrorCategory::Validation),
            IngestError::SizeExceeded { .. } => Some(ErrorCategory::ResourceLimit),
            IngestError::DownloadFailure { .. } => Some(ErrorCategory::SourceDownload),
            IngestError::ProcessingTimeout { .. } => Some(ErrorCategory::Timeout),
            IngestError::UploadFailure { .. } => Some(ErrorCategory::Upload),
            IngestError::DuplicateResolution { .. } => Some(ErrorCategory::DuplicateCheck),
            IngestError::ImageProcessing(_) => Some(ErrorCategory::ImageProcessing),
            _ => None,
        }
    }

    /// Machine-readable skip reason when this error is a skip rather than a failure.
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            IngestError::SourceNotAllowed { .. } => Some("source_not_allowed"),
            IngestError::AlreadyHandled { .. } => Some("already_processed"),
            IngestError::UnsupportedFormat { .. } => Some("unsupported_format"),
            IngestError::DuplicateDetected { .. } => Some("duplicate_detected"),
            _ => None,
        }
    }
}

/// Pipeline state, recorded as the job advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Validated,
    Downloaded,
    MetadataExtracted,
    DuplicateChecked,
    Generated,
    Built,
    Uploaded,
    Done,
    Skipped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Validated => "validated",
            Phase::Downloaded => "downloaded",
            Phase::MetadataExtracted => "metadata_extracted",
            Phase::DuplicateChecked => "duplicate_checked",
            Phase::Generated => "generated",
            Phase::Built => "built",
            Phase::Uploaded => "uploaded",
            Phase::Done => "done",
            Phase::Skipped => "skipped",
        }
    }

    /// Category of the step that runs while the job sits in this state.
    fn active_category(&self) -> ErrorCategory {
        match self {
            Phase::Init => ErrorCategory::Validation,
            Phase::Validated => ErrorCategory::SourceDownload,
            Phase::Downloaded => ErrorCategory::MetadataParsing,
            Phase::MetadataExtracted => ErrorCategory::DuplicateCheck,
            Phase::DuplicateChecked | Phase::Generated => ErrorCategory::ImageProcessing,
            Phase::Built => ErrorCategory::Upload,
            Phase::Uploaded | Phase::Done | Phase::Skipped => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    SourceDownload,
    MetadataParsing,
    DuplicateCheck,
    ImageProcessing,
    Upload,
    Timeout,
    ResourceLimit,
    Unknown,
}

impl ErrorCategory {
    /// Classify a failure from its variant, falling back to the recorded phase.
    pub fn classify(phase: Phase, error: &IngestError) -> Self {
        error
            .intrinsic_category()
            .unwrap_or_else(|| phase.active_category())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::SourceDownload => "source_download",
            ErrorCategory::MetadataParsing => "metadata_parsing",
            ErrorCategory::DuplicateCheck => "duplicate_check",
            ErrorCategory::ImageProcessing => "image_processing",
            ErrorCategory::Upload => "upload",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ResourceLimit => "resource_limit",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_category_wins_over_phase() {
        let err = IngestError::ProcessingTimeout {
            operation: "rendition generation",
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            ErrorCategory::classify(Phase::DuplicateChecked, &err),
            ErrorCategory::Timeout
        );

        let err = IngestError::SizeExceeded { size: 10, limit: 5 };
        assert_eq!(
            ErrorCategory::classify(Phase::Init, &err),
            ErrorCategory::ResourceLimit
        );
    }

    #[test]
    fn test_unknown_error_classified_by_phase() {
        let err = IngestError::Unknown("boom".to_string());
        assert_eq!(
            ErrorCategory::classify(Phase::Validated, &err),
            ErrorCategory::SourceDownload
        );
        assert_eq!(
            ErrorCategory::classify(Phase::MetadataExtracted, &err),
            ErrorCategory::DuplicateCheck
        );
        assert_eq!(
            ErrorCategory::classify(Phase::Built, &err),
            ErrorCategory::Upload
        );
        assert_eq!(
            ErrorCategory::classify(Phase::Done, &err),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_skip_reasons() {
        let err = IngestError::UnsupportedFormat {
            extension: "gif".to_string(),
        };
        assert_eq!(err.skip_reason(), Some("unsupported_format"));

        let err = IngestError::InvalidEvent("no records".to_string());
        assert_eq!(err.skip_reason(), None);
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(
            serde_json::to_string(&Phase::MetadataExtracted).unwrap(),
            "\"metadata_extracted\""
        );
        assert_eq!(Phase::DuplicateChecked.to_string(), "duplicate_checked");
    }
}
