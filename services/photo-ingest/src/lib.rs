//! Photo Ingest Service
//!
//! Stateless, per-object ingestion of newly uploaded photos. Each storage
//! notification becomes one job: the object is validated and routed,
//! downloaded, its capture metadata read, checked against previously processed
//! output for duplicates, resized into a fixed set of renditions and written
//! back with a JSON record describing the result.
//!
//! ## Features
//!
//! - **Routing**: source allow-list, source to destination bucket mapping and
//!   loop prevention for keys under the output or quarantine prefixes
//! - **Graceful metadata**: EXIF parsing under a timeout, falling back to an
//!   `unknown` camera without failing the job
//! - **Duplicate handling**: heuristic matching against same-day records with
//!   delete, move (quarantine), keep or replace dispositions
//! - **Concurrent renditions**: all size tiers resized in parallel under one
//!   timeout
//! - **Retrying storage**: every S3 call goes through bounded exponential
//!   backoff with jitter
//!
//! ## Architecture
//!
//! ```text
//! Notification (invoke / HTTP / Kafka)
//!        │
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ Event        │────▶│ Source       │  get_object (retry)
//! │ Validator    │     │ Bucket       │
//! └──────────────┘     └──────────────┘
//!        │                    │
//!        ▼                    ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Metadata     │────▶│ Duplicate    │────▶│ Duplicate    │─▶ skipped
//! │ Extractor    │     │ Detector     │     │ Resolver     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                             │                    │ replace
//!                             ▼                    ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │ Rendition    │────▶│ Record       │
//!                      │ Generator    │     │ Builder      │
//!                      └──────────────┘     └──────────────┘
//!                                                  │
//!                                                  ▼
//!                                           ┌──────────────┐
//!                                           │ Batch        │─▶ destination bucket
//!                                           │ Uploader     │   {prefix}{baseName}/
//!                                           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod event;
#[cfg(feature = "kafka")]
pub mod kafka_consumer;
pub mod metadata;
pub mod pipeline;
pub mod record;
pub mod renditions;
pub mod response;
pub mod storage;
pub mod upload;

pub use config::{Config, DuplicateAction};
pub use duplicates::{Confidence, DuplicateVerdict, MatchReason};
pub use error::{ErrorCategory, IngestError, Phase};
#[cfg(feature = "kafka")]
pub use kafka_consumer::NotificationConsumer;
pub use metadata::{CaptureMetadata, ExifParser, MetadataParser};
pub use pipeline::Pipeline;
pub use record::ProcessedRecord;
pub use renditions::{ImageProcessor, ImageRsProcessor, RenditionLabel};
pub use response::IngestResponse;
pub use storage::{MemoryObjectStore, ObjectStore, RetryPolicy, S3ObjectStore};
