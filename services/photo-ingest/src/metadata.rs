//! Capture metadata extraction.
//!
//! Parsing is an enrichment: any parser failure, panic or timeout yields
//! [`CaptureMetadata::unknown`] and the job carries on.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{Exif, In, Tag, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Camera name used when none can be read.
pub const UNKNOWN_CAMERA: &str = "unknown";

/// Flat tag name -> value map produced by a [`MetadataParser`].
pub type TagMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("error from the exif crate: {0}")]
    Exif(#[from] exif::Error),

    #[error("metadata parse failed: {0}")]
    Parse(String),
}

/// Opaque capture-metadata parsing capability.
pub trait MetadataParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<TagMap, MetadataError>;
}

/// Position read from GPS tags, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub camera: String,
    pub capture_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gps: Option<GpsPosition>,
    #[serde(default)]
    pub raw_tags: TagMap,
}

impl CaptureMetadata {
    pub fn unknown() -> Self {
        Self {
            camera: UNKNOWN_CAMERA.to_string(),
            capture_timestamp: None,
            gps: None,
            raw_tags: TagMap::new(),
        }
    }

    /// Interpret a parsed tag map.
    pub fn from_tags(tags: TagMap) -> Self {
        let camera = ["Model", "Make"]
            .iter()
            .filter_map(|name| tags.get(*name))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .unwrap_or(UNKNOWN_CAMERA)
            .to_string();

        let capture_timestamp = ["DateTimeOriginal", "DateTimeDigitized", "DateTime"]
            .iter()
            .filter_map(|name| tags.get(*name))
            .find_map(|v| parse_exif_datetime(v));

        let gps = match (
            parse_f64(tags.get("GPSLatitude")),
            parse_f64(tags.get("GPSLongitude")),
        ) {
            (Some(latitude), Some(longitude)) => Some(GpsPosition {
                latitude,
                longitude,
                altitude: parse_f64(tags.get("GPSAltitude")),
            }),
            _ => None,
        };

        Self {
            camera,
            capture_timestamp,
            gps,
            raw_tags: tags,
        }
    }
}

fn parse_f64(value: Option<&String>) -> Option<f64> {
    value.and_then(|v| v.trim().parse().ok())
}

/// EXIF stores local capture time without zone; it is read as UTC.
pub fn parse_exif_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim().trim_end_matches('\0');
    ["%Y:%m:%d %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Runs a parser on the blocking pool under a timeout.
pub struct MetadataExtractor {
    parser: Arc<dyn MetadataParser>,
    timeout: Duration,
}

impl MetadataExtractor {
    pub fn new(parser: Arc<dyn MetadataParser>, timeout: Duration) -> Self {
        Self { parser, timeout }
    }

    pub async fn extract(&self, bytes: Bytes) -> CaptureMetadata {
        let parser = self.parser.clone();
        let task = tokio::task::spawn_blocking(move || parser.parse(&bytes));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(tags))) => {
                let metadata = CaptureMetadata::from_tags(tags);
                debug!(
                    camera = %metadata.camera,
                    capture_timestamp = ?metadata.capture_timestamp,
                    has_gps = metadata.gps.is_some(),
                    "Capture metadata extracted"
                );
                metadata
            }
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "No usable capture metadata");
                CaptureMetadata::unknown()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Capture metadata parser panicked");
                CaptureMetadata::unknown()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Capture metadata parsing timed out"
                );
                CaptureMetadata::unknown()
            }
        }
    }
}

/// EXIF parser backed by `kamadak-exif`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifParser;

/// Tags copied into the tag map.
const KEPT_TAGS: &[(Tag, &str)] = &[
    (Tag::Make, "Make"),
    (Tag::Model, "Model"),
    (Tag::DateTimeOriginal, "DateTimeOriginal"),
    (Tag::DateTimeDigitized, "DateTimeDigitized"),
    (Tag::DateTime, "DateTime"),
    (Tag::LensModel, "LensModel"),
    (Tag::FNumber, "FNumber"),
    (Tag::ExposureTime, "ExposureTime"),
    (Tag::PhotographicSensitivity, "ISO"),
    (Tag::FocalLength, "FocalLength"),
    (Tag::Orientation, "Orientation"),
    (Tag::Software, "Software"),
    (Tag::PixelXDimension, "PixelXDimension"),
    (Tag::PixelYDimension, "PixelYDimension"),
];

impl MetadataParser for ExifParser {
    fn parse(&self, bytes: &[u8]) -> Result<TagMap, MetadataError> {
        let exif = exif::Reader::new().read_from_container(&mut Cursor::new(bytes))?;
        let mut tags = TagMap::new();

        for (tag, name) in KEPT_TAGS {
            if let Some(field) = exif.get_field(*tag, In::PRIMARY) {
                let value = ascii_value(&field.value)
                    .unwrap_or_else(|| field.display_value().to_string());
                if !value.is_empty() {
                    tags.insert((*name).to_string(), value);
                }
            }
        }

        if let Some(latitude) = gps_degrees(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S") {
            tags.insert("GPSLatitude".to_string(), latitude.to_string());
        }
        if let Some(longitude) = gps_degrees(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W") {
            tags.insert("GPSLongitude".to_string(), longitude.to_string());
        }
        if let Some(altitude) = gps_altitude(&exif) {
            tags.insert("GPSAltitude".to_string(), altitude.to_string());
        }

        if tags.is_empty() {
            return Err(MetadataError::Parse("no recognised tags".to_string()));
        }

        Ok(tags)
    }
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(parts) => parts.first().map(|raw| {
            String::from_utf8_lossy(raw)
                .trim_end_matches('\0')
                .trim()
                .to_string()
        }),
        _ => None,
    }
}

fn gps_degrees(exif: &Exif, tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let Value::Rational(parts) = &field.value else {
        return None;
    };
    if parts.len() < 3 {
        return None;
    }

    let degrees = parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;
    let reference = exif
        .get_field(ref_tag, In::PRIMARY)
        .and_then(|f| ascii_value(&f.value));

    Some(if reference.as_deref() == Some(negative_ref) {
        -degrees
    } else {
        degrees
    })
}

fn gps_altitude(exif: &Exif) -> Option<f64> {
    let field = exif.get_field(Tag::GPSAltitude, In::PRIMARY)?;
    let altitude = match &field.value {
        Value::Rational(parts) => parts.first()?.to_f64(),
        _ => return None,
    };
    // GPSAltitudeRef 1 means below sea level
    let below = exif
        .get_field(Tag::GPSAltitudeRef, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        == Some(1);

    Some(if below { -altitude } else { altitude })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedParser(TagMap);

    impl MetadataParser for FixedParser {
        fn parse(&self, _bytes: &[u8]) -> Result<TagMap, MetadataError> {
            Ok(self.0.clone())
        }
    }

    struct FailingParser;

    impl MetadataParser for FailingParser {
        fn parse(&self, _bytes: &[u8]) -> Result<TagMap, MetadataError> {
            Err(MetadataError::Parse("garbage".to_string()))
        }
    }

    struct SlowParser;

    impl MetadataParser for SlowParser {
        fn parse(&self, _bytes: &[u8]) -> Result<TagMap, MetadataError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(TagMap::new())
        }
    }

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_tags() {
        let metadata = CaptureMetadata::from_tags(tags(&[
            ("Make", "Canon"),
            ("Model", "Canon EOS R5"),
            ("DateTimeOriginal", "2024:01:15 10:30:45"),
            ("GPSLatitude", "37.7749"),
            ("GPSLongitude", "-122.4194"),
        ]));

        assert_eq!(metadata.camera, "Canon EOS R5");
        assert_eq!(
            metadata.capture_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap())
        );
        let gps = metadata.gps.unwrap();
        assert_eq!(gps.latitude, 37.7749);
        assert_eq!(gps.longitude, -122.4194);
        assert_eq!(gps.altitude, None);
    }

    #[test]
    fn test_from_tags_falls_back() {
        let metadata = CaptureMetadata::from_tags(tags(&[
            ("Make", "FUJIFILM"),
            ("Model", "  "),
            ("DateTimeOriginal", "0000:00:00 00:00:00"),
            ("DateTime", "2023-06-01 08:00:00"),
        ]));
        assert_eq!(metadata.camera, "FUJIFILM");
        assert_eq!(
            metadata.capture_timestamp,
            Some(Utc.with_ymd_and_hms(2023, 6, 1, 8, 0, 0).unwrap())
        );

        let empty = CaptureMetadata::from_tags(TagMap::new());
        assert_eq!(empty.camera, UNKNOWN_CAMERA);
        assert!(empty.capture_timestamp.is_none());
    }

    #[tokio::test]
    async fn test_extract_success() {
        let extractor = MetadataExtractor::new(
            Arc::new(FixedParser(tags(&[("Model", "Pixel 8")]))),
            Duration::from_secs(1),
        );
        let metadata = extractor.extract(Bytes::from_static(b"jpeg")).await;
        assert_eq!(metadata.camera, "Pixel 8");
    }

    #[tokio::test]
    async fn test_parse_failure_degrades_to_unknown() {
        let extractor = MetadataExtractor::new(Arc::new(FailingParser), Duration::from_secs(1));
        assert_eq!(
            extractor.extract(Bytes::from_static(b"jpeg")).await,
            CaptureMetadata::unknown()
        );
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_unknown() {
        let extractor = MetadataExtractor::new(Arc::new(SlowParser), Duration::from_millis(20));
        assert_eq!(
            extractor.extract(Bytes::from_static(b"jpeg")).await,
            CaptureMetadata::unknown()
        );
    }

    #[test]
    fn test_exif_parser_rejects_non_image() {
        assert!(ExifParser.parse(b"definitely not an image").is_err());
    }

    #[test]
    fn test_metadata_serializes_camel_case() {
        let json = serde_json::to_value(CaptureMetadata::unknown()).unwrap();
        assert_eq!(json["camera"], "unknown");
        assert!(json["captureTimestamp"].is_null());
        assert!(json.get("rawTags").is_some());
    }
}
