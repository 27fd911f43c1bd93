//! Heuristic duplicate detection against previously processed output, and
//! the disposition applied to a detected duplicate's source object.
//!
//! Detection lists the sidecar records of every folder sharing the photo's
//! capture day, then compares size, capture time, camera and dimensions. The
//! first qualifying record wins.

use crate::config::{DuplicateAction, DuplicateConfig};
use crate::error::IngestError;
use crate::record::{date_search_prefix, ProcessedRecord};
use crate::renditions::{ImageInfo, RenditionLabel};
use crate::storage::{ObjectStore, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Sidecar records are small; anything larger is not one of ours.
const MAX_RECORD_BYTES: u64 = 1024 * 1024;

/// Why a verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    ExactMatchExifTimestampCameraDimensions,
    ExactMatchExifTimestampCamera,
    SizeCameraMatchNoExifComparison,
    NoMatch,
    CheckDisabled,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::ExactMatchExifTimestampCameraDimensions => {
                "exact_match_exif_timestamp_camera_dimensions"
            }
            MatchReason::ExactMatchExifTimestampCamera => "exact_match_exif_timestamp_camera",
            MatchReason::SizeCameraMatchNoExifComparison => "size_camera_match_no_exif_comparison",
            MatchReason::NoMatch => "no_match",
            MatchReason::CheckDisabled => "check_disabled",
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
        }
    }
}

/// Outcome of one duplicate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateVerdict {
    pub is_duplicate: bool,
    pub reason: MatchReason,
    pub confidence: Option<Confidence>,
    /// Key of the matched sidecar record
    pub matched_record: Option<String>,
    pub matched_base_name: Option<String>,
    /// Stored original of the matched record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_original: Option<String>,
    pub scanned_count: usize,
}

impl DuplicateVerdict {
    fn negative(reason: MatchReason, scanned_count: usize) -> Self {
        Self {
            is_duplicate: false,
            reason,
            confidence: None,
            matched_record: None,
            matched_base_name: None,
            matched_original: None,
            scanned_count,
        }
    }
}

/// What is known about the incoming photo when the check runs.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub file_size_bytes: u64,
    pub capture_timestamp: Option<DateTime<Utc>>,
    pub camera: &'a str,
    pub dimensions: Option<&'a ImageInfo>,
}

/// Compare an existing record with the incoming photo.
pub fn match_record(
    existing: &ProcessedRecord,
    candidate: &Candidate<'_>,
    size_tolerance_bytes: u64,
) -> Option<(MatchReason, Confidence)> {
    if existing.file_size_bytes.abs_diff(candidate.file_size_bytes) >= size_tolerance_bytes {
        return None;
    }

    let same_camera = existing.camera.eq_ignore_ascii_case(candidate.camera);

    match (existing.capture_timestamp, candidate.capture_timestamp) {
        (Some(theirs), Some(ours)) => {
            if theirs != ours || !same_camera {
                return None;
            }
            let same_dimensions = match (&existing.original_dimensions, candidate.dimensions) {
                (Some(a), Some(b)) => a.width == b.width && a.height == b.height,
                _ => false,
            };
            if same_dimensions {
                Some((
                    MatchReason::ExactMatchExifTimestampCameraDimensions,
                    Confidence::High,
                ))
            } else {
                Some((MatchReason::ExactMatchExifTimestampCamera, Confidence::High))
            }
        }
        _ if same_camera => Some((
            MatchReason::SizeCameraMatchNoExifComparison,
            Confidence::Medium,
        )),
        _ => None,
    }
}

pub struct DuplicateDetector {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    config: DuplicateConfig,
    output_prefix: String,
}

impl DuplicateDetector {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        config: DuplicateConfig,
        output_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retry,
            config,
            output_prefix: output_prefix.into(),
        }
    }

    /// Scan `bucket` for a record of the same photo. Never fails: storage
    /// problems degrade to a negative verdict.
    #[instrument(skip(self, candidate), fields(camera = candidate.camera))]
    pub async fn check(
        &self,
        bucket: &str,
        candidate: &Candidate<'_>,
        now: DateTime<Utc>,
    ) -> DuplicateVerdict {
        if !self.config.enabled {
            return DuplicateVerdict::negative(MatchReason::CheckDisabled, 0);
        }

        let prefix = date_search_prefix(
            &self.output_prefix,
            candidate.capture_timestamp.unwrap_or(now),
        );

        let listing = self
            .retry
            .run("list_objects", || {
                self.store
                    .list_objects(bucket, &prefix, self.config.max_candidates)
            })
            .await;

        let entries = match listing {
            Ok(entries) => entries,
            Err(e) => {
                warn!(bucket, prefix = %prefix, error = %e, "Duplicate listing failed, assuming no duplicate");
                return DuplicateVerdict::negative(MatchReason::NoMatch, 0);
            }
        };

        let mut scanned = 0;
        for entry in entries.iter().filter(|e| e.key.ends_with(".json")) {
            scanned += 1;

            let body = match self
                .retry
                .run("get_object", || {
                    self.store.get_object(bucket, &entry.key, MAX_RECORD_BYTES)
                })
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    debug!(key = %entry.key, error = %e, "Skipping unreadable record");
                    continue;
                }
            };

            let existing: ProcessedRecord = match serde_json::from_slice(&body) {
                Ok(record) => record,
                Err(e) => {
                    debug!(key = %entry.key, error = %e, "Skipping unparsable record");
                    continue;
                }
            };

            if let Some((reason, confidence)) =
                match_record(&existing, candidate, self.config.size_tolerance_bytes)
            {
                info!(
                    matched_record = %entry.key,
                    reason = %reason,
                    confidence = confidence.as_str(),
                    scanned,
                    "Duplicate detected"
                );
                return DuplicateVerdict {
                    is_duplicate: true,
                    reason,
                    confidence: Some(confidence),
                    matched_record: Some(entry.key.clone()),
                    matched_original: existing
                        .rendition_paths
                        .get(&RenditionLabel::Original)
                        .cloned(),
                    matched_base_name: Some(existing.base_name),
                    scanned_count: scanned,
                };
            }
        }

        debug!(prefix = %prefix, scanned, "No duplicate found");
        DuplicateVerdict::negative(MatchReason::NoMatch, scanned)
    }
}

/// Duplicate details reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateSummary {
    pub action: DuplicateAction,
    pub confidence: Option<Confidence>,
    pub match_reason: MatchReason,
    pub matched_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_key: Option<String>,
}

impl DuplicateSummary {
    pub fn new(action: DuplicateAction, verdict: &DuplicateVerdict, quarantine_key: Option<String>) -> Self {
        Self {
            action,
            confidence: verdict.confidence,
            match_reason: verdict.reason,
            matched_record: verdict.matched_record.clone(),
            quarantine_key,
        }
    }
}

/// What the pipeline does after a duplicate was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The job ends here.
    Skip { quarantine_key: Option<String> },
    /// Keep processing, writing into the matched record's folder. The
    /// previous original is removed once the new output is stored.
    Replace {
        base_name: Option<String>,
        previous_original: Option<String>,
    },
}

pub struct DuplicateResolver {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    action: DuplicateAction,
    quarantine_prefix: String,
}

impl DuplicateResolver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        action: DuplicateAction,
        quarantine_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retry,
            action,
            quarantine_prefix: quarantine_prefix.into(),
        }
    }

    pub fn action(&self) -> DuplicateAction {
        self.action
    }

    /// Quarantine location for a source key.
    pub fn quarantine_key(&self, key: &str) -> String {
        format!("{}{}", self.quarantine_prefix, key)
    }

    /// Apply the configured action to the source object of a duplicate.
    #[instrument(skip(self, verdict), fields(action = self.action.as_str()))]
    pub async fn resolve(
        &self,
        bucket: &str,
        key: &str,
        verdict: &DuplicateVerdict,
        now: DateTime<Utc>,
    ) -> Result<Disposition, IngestError> {
        match self.action {
            DuplicateAction::Keep => Ok(Disposition::Skip {
                quarantine_key: None,
            }),
            DuplicateAction::Delete => {
                self.delete_source(bucket, key).await?;
                Ok(Disposition::Skip {
                    quarantine_key: None,
                })
            }
            DuplicateAction::Move => {
                let quarantine_key = self.quarantine_key(key);
                let tags = duplicate_tags(key, verdict, now);

                self.retry
                    .run("copy_object", || {
                        self.store.copy_object(bucket, key, &quarantine_key, &tags)
                    })
                    .await
                    .map_err(|source| self.failure(key, source))?;
                self.delete_source(bucket, key).await?;

                info!(bucket, key, quarantine_key = %quarantine_key, "Duplicate quarantined");
                Ok(Disposition::Skip {
                    quarantine_key: Some(quarantine_key),
                })
            }
            DuplicateAction::Replace => {
                self.delete_source(bucket, key).await?;
                Ok(Disposition::Replace {
                    base_name: verdict.matched_base_name.clone(),
                    previous_original: verdict.matched_original.clone(),
                })
            }
        }
    }

    async fn delete_source(&self, bucket: &str, key: &str) -> Result<(), IngestError> {
        self.retry
            .run("delete_object", || self.store.delete_object(bucket, key))
            .await
            .map_err(|source| self.failure(key, source))
    }

    fn failure(&self, key: &str, source: crate::storage::StorageError) -> IngestError {
        IngestError::DuplicateResolution {
            action: self.action.as_str().to_string(),
            key: key.to_string(),
            source,
        }
    }
}

/// Tags attached to a quarantined copy.
fn duplicate_tags(key: &str, verdict: &DuplicateVerdict, now: DateTime<Utc>) -> Vec<(String, String)> {
    vec![
        ("original-key".to_string(), tag_value(key)),
        ("duplicate-reason".to_string(), verdict.reason.as_str().to_string()),
        (
            "confidence".to_string(),
            verdict
                .confidence
                .map(|c| c.as_str())
                .unwrap_or("none")
                .to_string(),
        ),
        (
            "matched-record".to_string(),
            tag_value(verdict.matched_record.as_deref().unwrap_or("")),
        ),
        ("detected-at".to_string(), now.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
    ]
}

/// S3 tag values allow 256 characters from a restricted set.
fn tag_value(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | ' ' | '+' | '-' | '=' | '.' | '_' | ':' | '/'
            | '@' => c,
            _ => '_',
        })
        .take(256)
        .collect()
}
