//! Output naming, layout and the persisted processing record.
//!
//! Layout of one processed photo:
//!
//! ```text
//! {output_prefix}{base_name}/
//!     {original file name}            (original-{name} if named like a rendition)
//!     large.{ext} medium.{ext} small.{ext} thumb.{ext}
//!     {base_name}.json
//! ```

use crate::event::Job;
use crate::metadata::CaptureMetadata;
use crate::renditions::{GeneratedRenditions, ImageInfo, RenditionLabel, SIZE_TIERS};
use crate::storage::content_type_for;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Derive the folder name for a photo.
/// Format: photo-{YYYY-MM-DD_HH-MM-SS}-{camera}
pub fn base_name(timestamp: DateTime<Utc>, camera: &str) -> String {
    format!(
        "photo-{}-{}",
        timestamp.format("%Y-%m-%d_%H-%M-%S"),
        sanitize_camera(camera)
    )
}

/// Replace anything outside `[A-Za-z0-9-_]` with `_`.
pub fn sanitize_camera(camera: &str) -> String {
    camera
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Key prefix shared by every folder whose photo was taken on the same day.
pub fn date_search_prefix(output_prefix: &str, timestamp: DateTime<Utc>) -> String {
    format!("{output_prefix}photo-{}", timestamp.format("%Y-%m-%d"))
}

/// Keys of every artifact of one processed photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub base_name: String,
    pub folder: String,
}

impl OutputLayout {
    pub fn new(output_prefix: &str, base_name: impl Into<String>) -> Self {
        let base_name = base_name.into();
        let folder = format!("{output_prefix}{base_name}/");
        Self { base_name, folder }
    }

    pub fn rendition_key(&self, label: RenditionLabel, extension: &str) -> String {
        format!("{}{}.{}", self.folder, label, extension)
    }

    /// Key of the stored original. An upload named like one of the
    /// renditions (`thumb.jpg`) is stored as `original-thumb.jpg`.
    pub fn original_key(&self, file_name: &str, extension: &str) -> String {
        let collides = SIZE_TIERS
            .iter()
            .any(|tier| file_name == format!("{}.{}", tier.label, extension));

        if collides {
            format!("{}original-{}", self.folder, file_name)
        } else {
            format!("{}{}", self.folder, file_name)
        }
    }

    pub fn record_key(&self) -> String {
        format!("{}{}.json", self.folder, self.base_name)
    }
}

/// Size of one stored rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionSummary {
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// The sidecar document describing one processed photo.
///
/// Fields added over time are defaulted so that older sidecars still parse
/// during duplicate detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    pub original_key: String,
    pub base_name: String,
    #[serde(default)]
    pub capture_timestamp: Option<DateTime<Utc>>,
    pub camera: String,
    pub file_size_bytes: u64,
    #[serde(default)]
    pub original_dimensions: Option<ImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_metadata: Option<CaptureMetadata>,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub rendition_paths: BTreeMap<RenditionLabel, String>,
    #[serde(default)]
    pub source_bucket: Option<String>,
    #[serde(default)]
    pub renditions: BTreeMap<RenditionLabel, RenditionSummary>,
}

/// One object to write.
#[derive(Debug, Clone)]
pub struct OutputObject {
    pub key: String,
    pub body: Bytes,
    pub content_type: &'static str,
}

/// Everything a job writes, with the record first materialized.
#[derive(Debug, Clone)]
pub struct BuiltOutput {
    pub record: ProcessedRecord,
    pub record_key: String,
    /// Original then renditions, in tier order.
    pub artifacts: Vec<OutputObject>,
    pub record_object: OutputObject,
}

impl BuiltOutput {
    /// Keys of the five image artifacts.
    pub fn processed_files(&self) -> Vec<String> {
        self.artifacts.iter().map(|o| o.key.clone()).collect()
    }

    /// All six objects, record last.
    pub fn into_objects(self) -> Vec<OutputObject> {
        let mut objects = self.artifacts;
        objects.push(self.record_object);
        objects
    }
}

/// Assemble the record and the artifact set of a job.
pub fn build_output(
    job: &Job,
    metadata: &CaptureMetadata,
    generated: &GeneratedRenditions,
    layout: &OutputLayout,
    processed_at: DateTime<Utc>,
) -> Result<BuiltOutput, serde_json::Error> {
    let extension = job.extension.as_str();
    let original_key = layout.original_key(&job.file_name, extension);

    let mut artifacts = Vec::with_capacity(generated.renditions.len() + 1);
    artifacts.push(OutputObject {
        key: original_key.clone(),
        body: job.raw_bytes.clone(),
        content_type: content_type_for(extension),
    });

    let mut rendition_paths = BTreeMap::new();
    let mut renditions = BTreeMap::new();

    rendition_paths.insert(RenditionLabel::Original, original_key);
    renditions.insert(
        RenditionLabel::Original,
        RenditionSummary {
            width: generated.original.width,
            height: generated.original.height,
            size_bytes: job.size(),
        },
    );

    for rendition in &generated.renditions {
        let key = layout.rendition_key(rendition.label, extension);
        rendition_paths.insert(rendition.label, key.clone());
        renditions.insert(
            rendition.label,
            RenditionSummary {
                width: rendition.width,
                height: rendition.height,
                size_bytes: rendition.bytes.len() as u64,
            },
        );
        artifacts.push(OutputObject {
            key,
            body: rendition.bytes.clone(),
            content_type: content_type_for(extension),
        });
    }

    let record = ProcessedRecord {
        original_key: job.key.clone(),
        base_name: layout.base_name.clone(),
        capture_timestamp: metadata.capture_timestamp,
        camera: metadata.camera.clone(),
        file_size_bytes: job.size(),
        original_dimensions: Some(generated.original.clone()),
        capture_metadata: (*metadata != CaptureMetadata::unknown()).then(|| metadata.clone()),
        processed_at,
        rendition_paths,
        source_bucket: Some(job.source_bucket.clone()),
        renditions,
    };

    let record_key = layout.record_key();
    let record_object = OutputObject {
        key: record_key.clone(),
        body: Bytes::from(serde_json::to_vec_pretty(&record)?),
        content_type: content_type_for("json"),
    };

    Ok(BuiltOutput {
        record,
        record_key,
        artifacts,
        record_object,
    })
}
