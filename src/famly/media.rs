use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// What a media item is, which decides its on-disk extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Photo,
    Video,
    File,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

/// Which feed produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaOrigin {
    TaggedImages,
    Observations,
    Messages,
}

impl MediaOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaggedImages => "tagged-images",
            Self::Observations => "observations",
            Self::Messages => "messages",
        }
    }

    /// Whether items from this feed are filtered by, and advance, the
    /// watermark. Other feeds rely on the on-disk check alone.
    pub fn follows_watermark(&self) -> bool {
        matches!(self, Self::TaggedImages)
    }
}

/// Which rendition of a tagged image to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    Full,
    Thumbnail,
}

/// A downloadable photo, video or file, rebuilt from API responses on every
/// run. Nothing about it is persisted except the file it turns into.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub kind: MediaKind,
    /// Pre-signed, time-limited URL.
    pub source_url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub captured_at: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub origin: MediaOrigin,
    /// Name the uploader gave a file attachment; drives its extension.
    pub original_name: Option<String>,
}

/// Parse the assorted timestamp shapes Famly emits.
///
/// Accepts RFC 3339 (`2024-05-01T10:20:30+00:00`, `...Z`), offsets without a
/// colon (`+0000`), naive datetimes (taken as UTC) and bare dates (midnight
/// UTC).
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a JSON timestamp that may be a string or epoch milliseconds.
pub(crate) fn parse_timestamp_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_timestamp(s),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_rfc3339_with_offset() {
        let dt = parse_timestamp("2024-05-01T12:20:30+02:00").unwrap();
        assert_eq!(dt.hour(), 10);
        assert_eq!(dt.to_rfc3339(), "2024-05-01T10:20:30+00:00");
    }

    #[test]
    fn parses_fractional_zulu() {
        let dt = parse_timestamp("2024-05-01T10:20:30.123Z").unwrap();
        assert_eq!(dt.second(), 30);
    }

    #[test]
    fn parses_offset_without_colon() {
        let dt = parse_timestamp("2024-05-01T10:20:30+0000").unwrap();
        assert_eq!(dt.minute(), 20);
    }

    #[test]
    fn parses_bare_date_as_midnight() {
        let dt = parse_timestamp("2023-11-02").unwrap();
        assert_eq!(dt.to_rfc3339(), "2023-11-02T00:00:00+00:00");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn only_tagged_images_follow_the_watermark() {
        assert!(MediaOrigin::TaggedImages.follows_watermark());
        assert!(!MediaOrigin::Observations.follows_watermark());
        assert!(!MediaOrigin::Messages.follows_watermark());
    }

    #[test]
    fn parses_epoch_millis_value() {
        let dt = parse_timestamp_value(&serde_json::json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert!(parse_timestamp_value(&serde_json::Value::Null).is_none());
    }
}
