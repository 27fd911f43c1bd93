//! Storage-change notifications and their validation into a job.

use crate::config::Config;
use crate::error::IngestError;
use bytes::Bytes;
use serde::Deserialize;
use tracing::warn;

/// Extensions accepted for processing (lowercase).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tiff", "tif", "webp"];

/// A storage-change notification as delivered by the trigger.
///
/// Either the S3 `Records` envelope, or a flat `{bucket, key, size}` document
/// for direct invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Notification {
    Records {
        #[serde(rename = "Records")]
        records: Vec<NotificationRecord>,
    },
    Direct(DirectObject),
}

/// One record of an S3 event notification
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "eventName", default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub s3: Option<S3Entity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    #[serde(default)]
    pub bucket: Option<BucketEntity>,
    #[serde(default)]
    pub object: Option<ObjectEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketEntity {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntity {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Flat object reference used for local and HTTP invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectObject {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// The object a notification points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub size: Option<u64>,
}

impl Notification {
    /// Parse a raw JSON document into a notification.
    pub fn from_value(value: serde_json::Value) -> Result<Self, IngestError> {
        serde_json::from_value(value)
            .map_err(|e| IngestError::InvalidEvent(format!("unrecognized notification: {e}")))
    }

    /// The object referenced by the first record. Later records are ignored.
    pub fn first_object(&self) -> Result<ObjectRef, IngestError> {
        match self {
            Notification::Direct(direct) => Ok(ObjectRef {
                bucket: direct.bucket.clone(),
                key: direct.key.clone(),
                size: direct.size,
            }),
            Notification::Records { records } => {
                let record = records
                    .first()
                    .ok_or_else(|| IngestError::InvalidEvent("notification has no records".to_string()))?;

                if records.len() > 1 {
                    warn!(
                        record_count = records.len(),
                        ignored = records.len() - 1,
                        "Notification carries multiple records, only the first is processed"
                    );
                }

                let s3 = record
                    .s3
                    .as_ref()
                    .ok_or_else(|| IngestError::InvalidEvent("record has no s3 entity".to_string()))?;
                let bucket = s3
                    .bucket
                    .as_ref()
                    .map(|b| b.name.clone())
                    .unwrap_or_default();
                let object = s3
                    .object
                    .as_ref()
                    .ok_or_else(|| IngestError::InvalidEvent("record has no object".to_string()))?;

                Ok(ObjectRef {
                    bucket,
                    key: decode_object_key(&object.key),
                    size: object.size,
                })
            }
        }
    }
}

/// S3 notifications carry form-encoded keys (`+` for space, `%XX` escapes).
pub fn decode_object_key(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(name, _)| name.into_owned())
        .unwrap_or_default()
}

/// A notification that passed validation and routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEvent {
    pub source_bucket: String,
    pub target_bucket: String,
    pub key: String,
    pub file_name: String,
    pub extension: String,
    pub declared_size: Option<u64>,
}

/// Validate an object reference and resolve its destination. Checks run in a
/// fixed order, so an object failing several of them reports the first.
pub fn validate_object(object: ObjectRef, config: &Config) -> Result<ValidatedEvent, IngestError> {
    if object.bucket.is_empty() {
        return Err(IngestError::InvalidEvent("missing source bucket".to_string()));
    }
    if object.key.is_empty() {
        return Err(IngestError::InvalidEvent("missing object key".to_string()));
    }

    let file_name = object
        .key
        .rsplit('/')
        .next()
        .unwrap_or(&object.key)
        .to_string();
    let extension = file_extension(&file_name);

    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(IngestError::UnsupportedFormat { extension });
    }

    if let Some(allowed) = &config.ingest.allowed_source_buckets {
        if !allowed.iter().any(|b| b == &object.bucket) {
            return Err(IngestError::SourceNotAllowed {
                bucket: object.bucket,
            });
        }
    }

    for prefix in [
        &config.ingest.output_prefix,
        &config.duplicates.quarantine_prefix,
    ] {
        if object.key.starts_with(prefix.as_str()) {
            return Err(IngestError::AlreadyHandled {
                key: object.key,
                prefix: prefix.clone(),
            });
        }
    }

    if let Some(size) = object.size {
        check_size(size, config.ingest.max_object_size_bytes)?;
    }

    let target_bucket = config.ingest.destination_for(&object.bucket).to_string();

    Ok(ValidatedEvent {
        source_bucket: object.bucket,
        target_bucket,
        key: object.key,
        file_name,
        extension,
        declared_size: object.size,
    })
}

pub fn check_size(size: u64, limit: u64) -> Result<(), IngestError> {
    if size > limit {
        return Err(IngestError::SizeExceeded { size, limit });
    }
    Ok(())
}

fn file_extension(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

/// A validated event together with the downloaded object bytes.
#[derive(Debug, Clone)]
pub struct Job {
    pub source_bucket: String,
    pub target_bucket: String,
    pub key: String,
    pub file_name: String,
    pub extension: String,
    pub raw_bytes: Bytes,
}

impl Job {
    pub fn new(event: ValidatedEvent, raw_bytes: Bytes) -> Self {
        Self {
            source_bucket: event.source_bucket,
            target_bucket: event.target_bucket,
            key: event.key,
            file_name: event.file_name,
            extension: event.extension,
            raw_bytes,
        }
    }

    /// Size of the downloaded object
    pub fn size(&self) -> u64 {
        self.raw_bytes.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(notification: &Notification, config: &Config) -> Result<ValidatedEvent, IngestError> {
        validate_object(notification.first_object()?, config)
    }

    fn s3_event(bucket: &str, key: &str, size: u64) -> Notification {
        Notification::from_value(json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": {"name": bucket},
                    "object": {"key": key, "size": size}
                }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_event_defaults_to_source_bucket() {
        let config = Config::default();
        let event = validate(&s3_event("ingress-1", "IMG_0001.JPG", 500_000), &config).unwrap();

        assert_eq!(event.source_bucket, "ingress-1");
        assert_eq!(event.target_bucket, "ingress-1");
        assert_eq!(event.extension, "jpg");
        assert_eq!(event.file_name, "IMG_0001.JPG");
        assert_eq!(event.declared_size, Some(500_000));
    }

    #[test]
    fn test_bucket_mapping_resolves_destination() {
        let mut config = Config::default();
        config
            .ingest
            .bucket_mappings
            .insert("ingress-1".to_string(), "gallery".to_string());

        let event = validate(&s3_event("ingress-1", "a/b.png", 10), &config).unwrap();
        assert_eq!(event.target_bucket, "gallery");
        assert_eq!(event.file_name, "b.png");
    }

    #[test]
    fn test_key_is_url_decoded() {
        let config = Config::default();
        let event = validate(
            &s3_event("ingress-1", "holiday/My+Photo%281%29.jpeg", 10),
            &config,
        )
        .unwrap();
        assert_eq!(event.key, "holiday/My Photo(1).jpeg");
    }

    #[test]
    fn test_direct_event_key_is_used_verbatim() {
        let config = Config::default();
        let notification = Notification::from_value(json!({
            "bucket": "ingress-1",
            "key": "a+b.jpg",
            "size": 500000
        }))
        .unwrap();
        let event = validate(&notification, &config).unwrap();
        assert_eq!(event.key, "a+b.jpg");
    }

    #[test]
    fn test_only_first_record_is_used() {
        let config = Config::default();
        let notification = Notification::from_value(json!({
            "Records": [
                {"s3": {"bucket": {"name": "ingress-1"}, "object": {"key": "first.jpg", "size": 1}}},
                {"s3": {"bucket": {"name": "ingress-1"}, "object": {"key": "second.jpg", "size": 1}}}
            ]
        }))
        .unwrap();
        assert_eq!(validate(&notification, &config).unwrap().key, "first.jpg");
    }

    #[test]
    fn test_invalid_events() {
        let config = Config::default();

        let empty = Notification::from_value(json!({"Records": []})).unwrap();
        assert!(matches!(
            validate(&empty, &config),
            Err(IngestError::InvalidEvent(_))
        ));

        let no_key = s3_event("ingress-1", "", 1);
        assert!(matches!(
            validate(&no_key, &config),
            Err(IngestError::InvalidEvent(_))
        ));

        assert!(matches!(
            Notification::from_value(json!({"hello": "world"})),
            Err(IngestError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_unsupported_formats() {
        let config = Config::default();
        for key in ["clip.mov", "image.gif", "README", ".jpg", "notes.txt"] {
            match validate(&s3_event("ingress-1", key, 1), &config) {
                Err(IngestError::UnsupportedFormat { .. }) => {}
                other => panic!("{key}: expected unsupported format, got {other:?}"),
            }
        }
        for key in ["a.jpg", "a.JPEG", "a.png", "a.tiff", "a.TIF", "a.webp"] {
            assert!(validate(&s3_event("ingress-1", key, 1), &config).is_ok(), "{key}");
        }
    }

    #[test]
    fn test_source_allow_list() {
        let mut config = Config::default();
        config.ingest.allowed_source_buckets = Some(vec!["ingress-1".to_string()]);

        assert!(validate(&s3_event("ingress-1", "a.jpg", 1), &config).is_ok());
        assert!(matches!(
            validate(&s3_event("ingress-2", "a.jpg", 1), &config),
            Err(IngestError::SourceNotAllowed { .. })
        ));
    }

    #[test]
    fn test_loop_prevention() {
        let config = Config::default();
        for key in [
            "processed/photo-2024-01-15_10-30-45-unknown/large.jpg",
            "duplicates/IMG_0001.jpg",
        ] {
            assert!(matches!(
                validate(&s3_event("ingress-1", key, 1), &config),
                Err(IngestError::AlreadyHandled { .. })
            ));
        }
    }

    #[test]
    fn test_size_limit() {
        let mut config = Config::default();
        config.ingest.max_object_size_bytes = 1000;

        assert!(validate(&s3_event("ingress-1", "a.jpg", 1000), &config).is_ok());
        assert!(matches!(
            validate(&s3_event("ingress-1", "a.jpg", 1001), &config),
            Err(IngestError::SizeExceeded {
                size: 1001,
                limit: 1000
            })
        ));
    }
}
