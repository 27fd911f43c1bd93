//! The ingestion state machine.
//!
//! ```text
//! init -> validated -> downloaded -> metadata_extracted -> duplicate_checked
//!                                                            |-> skipped
//!                                                            '-> generated -> built -> uploaded -> done
//! ```
//!
//! [`Pipeline::handle`] never fails: every error is caught once, attributed
//! to the last reached [`Phase`], and turned into an [`IngestResponse`].

use crate::config::Config;
use crate::duplicates::{
    Candidate, Disposition, DuplicateDetector, DuplicateResolver, DuplicateSummary,
};
use crate::error::{IngestError, Phase};
use crate::event::{self, Job, Notification};
use crate::metadata::{ExifParser, MetadataExtractor, MetadataParser};
use crate::record::{self, OutputLayout};
use crate::renditions::RenditionLabel;
use crate::renditions::{ImageProcessor, ImageRsProcessor, RenditionGenerator};
use crate::response::{IngestResponse, ProcessingMetrics, SuccessResponse};
use crate::storage::{ObjectStore, RetryPolicy, StorageError};
use crate::upload::BatchUploader;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Original, four renditions and the record.
const OBJECTS_PER_JOB: usize = 6;

/// Progress of one job, kept outside the fallible path so failures can be
/// attributed.
struct JobState {
    phase: Phase,
    original_key: Option<String>,
    bucket: Option<String>,
    started: Instant,
}

impl JobState {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            original_key: None,
            bucket: None,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    extractor: MetadataExtractor,
    generator: RenditionGenerator,
    detector: DuplicateDetector,
    resolver: DuplicateResolver,
    uploader: BatchUploader,
}

impl Pipeline {
    /// Pipeline with the EXIF parser and the `image` crate codec.
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>) -> Self {
        Self::with_capabilities(config, store, Arc::new(ExifParser), Arc::new(ImageRsProcessor))
    }

    pub fn with_capabilities(
        config: Arc<Config>,
        store: Arc<dyn ObjectStore>,
        parser: Arc<dyn MetadataParser>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);

        Self {
            extractor: MetadataExtractor::new(parser, config.ingest.metadata_timeout()),
            generator: RenditionGenerator::new(
                processor,
                config.ingest.operation_timeout(),
            ),
            detector: DuplicateDetector::new(
                store.clone(),
                retry.clone(),
                config.duplicates.clone(),
                config.ingest.output_prefix.clone(),
            ),
            resolver: DuplicateResolver::new(
                store.clone(),
                retry.clone(),
                config.duplicates.action,
                config.duplicates.quarantine_prefix.clone(),
            ),
            uploader: BatchUploader::new(store.clone(), retry.clone(), OBJECTS_PER_JOB),
            retry,
            store,
            config,
        }
    }

    /// Run one job for a raw notification document.
    #[instrument(skip(self, event))]
    pub async fn handle(&self, event: serde_json::Value) -> IngestResponse {
        let mut state = JobState::new();
        let result = self.run(event, &mut state).await;
        respond(result, state)
    }

    /// Run one job for an undecoded request body. Bodies that are not JSON
    /// get the same validation error response as malformed notifications.
    pub async fn handle_bytes(&self, body: &[u8]) -> IngestResponse {
        match serde_json::from_slice(body) {
            Ok(event) => self.handle(event).await,
            Err(e) => respond(
                Err(IngestError::InvalidEvent(format!("notification is not valid JSON: {e}"))),
                JobState::new(),
            ),
        }
    }

    async fn run(
        &self,
        event: serde_json::Value,
        state: &mut JobState,
    ) -> Result<SuccessResponse, IngestError> {
        let notification = Notification::from_value(event)?;
        let object = notification.first_object()?;
        state.original_key = Some(object.key.clone());
        state.bucket = Some(object.bucket.clone());

        let validated = event::validate_object(object, &self.config)?;
        state.advance(Phase::Validated);
        info!(
            source_bucket = %validated.source_bucket,
            target_bucket = %validated.target_bucket,
            key = %validated.key,
            declared_size = ?validated.declared_size,
            "Processing photo"
        );

        let limit = self.config.ingest.max_object_size_bytes;
        let download_started = Instant::now();
        let raw_bytes = self
            .retry
            .run("get_object", || {
                self.store
                    .get_object(&validated.source_bucket, &validated.key, limit)
            })
            .await
            .map_err(|source| match source {
                StorageError::TooLarge { size, limit } => IngestError::SizeExceeded { size, limit },
                source => IngestError::DownloadFailure {
                    bucket: validated.source_bucket.clone(),
                    key: validated.key.clone(),
                    source,
                },
            })?;
        let download_ms = download_started.elapsed().as_millis() as u64;

        // Stores may not report a length up front
        event::check_size(raw_bytes.len() as u64, limit)?;
        let job = Job::new(validated, raw_bytes);
        state.advance(Phase::Downloaded);

        let metadata_started = Instant::now();
        let metadata = self.extractor.extract(job.raw_bytes.clone()).await;
        let metadata_ms = metadata_started.elapsed().as_millis() as u64;
        state.advance(Phase::MetadataExtracted);

        let duplicate_started = Instant::now();
        let now = Utc::now();
        let dimensions = match self.generator.probe(job.raw_bytes.clone()).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(key = %job.key, error = %e, "Could not probe original dimensions");
                None
            }
        };
        let candidate = Candidate {
            file_size_bytes: job.size(),
            capture_timestamp: metadata.capture_timestamp,
            camera: &metadata.camera,
            dimensions: dimensions.as_ref(),
        };
        let verdict = self
            .detector
            .check(&job.target_bucket, &candidate, now)
            .await;

        let mut replaced = None;
        let mut previous_original = None;
        let mut base_name = record::base_name(
            metadata.capture_timestamp.unwrap_or(now),
            &metadata.camera,
        );

        if verdict.is_duplicate {
            let disposition = self
                .resolver
                .resolve(&job.source_bucket, &job.key, &verdict, now)
                .await?;

            match disposition {
                Disposition::Skip { quarantine_key } => {
                    return Err(IngestError::DuplicateDetected(Box::new(
                        DuplicateSummary::new(self.resolver.action(), &verdict, quarantine_key),
                    )));
                }
                Disposition::Replace {
                    base_name: matched_base_name,
                    previous_original: matched_original,
                } => {
                    if let Some(matched) = matched_base_name {
                        base_name = matched;
                    }
                    previous_original = matched_original;
                    info!(base_name = %base_name, "Replacing previously processed photo");
                    replaced = Some(DuplicateSummary::new(self.resolver.action(), &verdict, None));
                }
            }
        }
        let duplicate_ms = duplicate_started.elapsed().as_millis() as u64;
        state.advance(Phase::DuplicateChecked);

        let generation_started = Instant::now();
        let generated = self
            .generator
            .generate(job.raw_bytes.clone(), dimensions)
            .await?;
        let generation_ms = generation_started.elapsed().as_millis() as u64;
        state.advance(Phase::Generated);

        let layout = OutputLayout::new(&self.config.ingest.output_prefix, base_name);
        let built = record::build_output(&job, &metadata, &generated, &layout, Utc::now())
            .map_err(|e| IngestError::Unknown(format!("Failed to serialize record: {e}")))?;
        let processed_files = built.processed_files();
        let metadata_path = built.record_key.clone();
        let original_path = built.record.rendition_paths.get(&RenditionLabel::Original).cloned();
        state.advance(Phase::Built);

        let upload_started = Instant::now();
        self.uploader
            .upload_all(&job.target_bucket, built.into_objects())
            .await?;
        let upload_ms = upload_started.elapsed().as_millis() as u64;
        state.advance(Phase::Uploaded);

        if let Some(stale) = previous_original {
            if original_path.as_deref() != Some(stale.as_str()) && stale.starts_with(&layout.folder) {
                self.remove_stale_original(&job.target_bucket, &stale).await;
            }
        }

        Ok(SuccessResponse {
            base_name: layout.base_name,
            original_key: job.key.clone(),
            processing_metrics: ProcessingMetrics {
                total_time_ms: state.elapsed_ms(),
                download_time_ms: download_ms,
                metadata_time_ms: metadata_ms,
                duplicate_check_time_ms: duplicate_ms,
                generation_time_ms: generation_ms,
                upload_time_ms: upload_ms,
                original_size_bytes: job.size(),
                rendition_count: processed_files.len(),
            },
            processed_files,
            metadata_path,
            replaced_duplicate: replaced,
        })
    }

    /// Drop the original a replaced record pointed at. The new output is
    /// already stored, so a failure here only leaves an extra file behind.
    async fn remove_stale_original(&self, bucket: &str, key: &str) {
        match self
            .retry
            .run("delete_object", || self.store.delete_object(bucket, key))
            .await
        {
            Ok(()) => info!(bucket, key, "Removed replaced original"),
            Err(e) => warn!(bucket, key, error = %e, "Failed to remove replaced original"),
        }
    }
}

/// Log, count and shape the outcome of one job.
fn respond(result: Result<SuccessResponse, IngestError>, mut state: JobState) -> IngestResponse {
    let response = match result {
        Ok(success) => {
            state.advance(Phase::Done);
            info!(
                base_name = %success.base_name,
                original_key = %success.original_key,
                total_ms = success.processing_metrics.total_time_ms,
                "Photo processed"
            );
            IngestResponse::Success(success)
        }
        Err(err) => {
            let response = IngestResponse::from_error(
                &err,
                state.phase,
                state.original_key.clone(),
                state.bucket.clone(),
                state.elapsed_ms(),
            );
            match &response {
                IngestResponse::Skipped(skipped) => {
                    state.advance(Phase::Skipped);
                    info!(
                        reason = skipped.reason,
                        key = ?state.original_key,
                        "Photo skipped: {err}"
                    );
                }
                _ => error!(
                    phase = %state.phase,
                    key = ?state.original_key,
                    error = %err,
                    "Photo ingestion failed"
                ),
            }
            response
        }
    };

    metrics::counter!(format!("photo_ingest.jobs.{}", response.status())).increment(1);
    metrics::histogram!("photo_ingest.job.duration_seconds")
        .record(state.started.elapsed().as_secs_f64());

    response
}
