//! Structured job outcome returned to every invocation surface.

use crate::duplicates::DuplicateSummary;
use crate::error::{ErrorCategory, IngestError, Phase};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngestResponse {
    Success(SuccessResponse),
    Skipped(SkippedResponse),
    Error(ErrorResponse),
}

impl IngestResponse {
    pub fn status(&self) -> &'static str {
        match self {
            IngestResponse::Success(_) => "success",
            IngestResponse::Skipped(_) => "skipped",
            IngestResponse::Error(_) => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, IngestResponse::Error(_))
    }
}

/// Per-step wall clock timings, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub total_time_ms: u64,
    pub download_time_ms: u64,
    pub metadata_time_ms: u64,
    pub duplicate_check_time_ms: u64,
    pub generation_time_ms: u64,
    pub upload_time_ms: u64,
    pub original_size_bytes: u64,
    pub rendition_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub base_name: String,
    pub original_key: String,
    /// Original plus the four renditions
    pub processed_files: Vec<String>,
    pub metadata_path: String,
    pub processing_metrics: ProcessingMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_duplicate: Option<DuplicateSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedResponse {
    pub reason: &'static str,
    pub original_key: Option<String>,
    pub bucket: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub error_category: ErrorCategory,
    pub processing_phase: Phase,
    pub original_key: Option<String>,
    pub processing_time_ms: u64,
}

impl IngestResponse {
    /// Turn a job failure into a skip or an error report.
    pub fn from_error(
        error: &IngestError,
        phase: Phase,
        original_key: Option<String>,
        bucket: Option<String>,
        processing_time_ms: u64,
    ) -> Self {
        if let Some(reason) = error.skip_reason() {
            let duplicate = match error {
                IngestError::DuplicateDetected(summary) => Some((**summary).clone()),
                _ => None,
            };
            return IngestResponse::Skipped(SkippedResponse {
                reason,
                original_key,
                bucket,
                message: error.to_string(),
                duplicate,
            });
        }

        IngestResponse::Error(ErrorResponse {
            error: error.to_string(),
            error_category: ErrorCategory::classify(phase, error),
            processing_phase: phase,
            original_key,
            processing_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicateAction;
    use crate::duplicates::{Confidence, MatchReason};
    use serde_json::json;

    #[test]
    fn test_error_response_shape() {
        let err = IngestError::Unknown("boom".to_string());
        let response = IngestResponse::from_error(
            &err,
            Phase::Generated,
            Some("IMG_0001.jpg".to_string()),
            Some("ingress-1".to_string()),
            42,
        );

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "status": "error",
                "error": "boom",
                "errorCategory": "image_processing",
                "processingPhase": "generated",
                "originalKey": "IMG_0001.jpg",
                "processingTimeMs": 42
            })
        );
    }

    #[test]
    fn test_duplicate_skip_shape() {
        let err = IngestError::DuplicateDetected(Box::new(DuplicateSummary {
            action: DuplicateAction::Move,
            confidence: Some(Confidence::High),
            match_reason: MatchReason::ExactMatchExifTimestampCamera,
            matched_record: Some("processed/photo-x/photo-x.json".to_string()),
            quarantine_key: Some("duplicates/IMG_0001.jpg".to_string()),
        }));
        let response = IngestResponse::from_error(
            &err,
            Phase::MetadataExtracted,
            Some("IMG_0001.jpg".to_string()),
            Some("ingress-1".to_string()),
            5,
        );

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "skipped");
        assert_eq!(value["reason"], "duplicate_detected");
        assert_eq!(value["bucket"], "ingress-1");
        assert_eq!(value["duplicate"]["action"], "move");
        assert_eq!(value["duplicate"]["confidence"], "high");
        assert_eq!(value["duplicate"]["matchReason"], "exact_match_exif_timestamp_camera");
        assert_eq!(value["duplicate"]["quarantineKey"], "duplicates/IMG_0001.jpg");
        assert!(value["message"]
            .as_str()
            .unwrap()
            .contains("processed/photo-x/photo-x.json"));
    }

    #[test]
    fn test_success_shape() {
        let response = IngestResponse::Success(SuccessResponse {
            base_name: "photo-x".to_string(),
            original_key: "IMG_0001.jpg".to_string(),
            processed_files: vec!["a".to_string(); 5],
            metadata_path: "processed/photo-x/photo-x.json".to_string(),
            processing_metrics: ProcessingMetrics::default(),
            replaced_duplicate: None,
        });

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["processedFiles"].as_array().unwrap().len(), 5);
        assert!(value["processingMetrics"]["totalTimeMs"].is_u64());
        assert!(value.get("replacedDuplicate").is_none());
    }
}
