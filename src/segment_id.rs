use percent_encoding::{
    AsciiSet,
    NON_ALPHANUMERIC,
    percent_decode_str,
    utf8_percent_encode,
};

/// Characters kept verbatim in segment file names.
const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "sqlite";

/// Identifier of one immutable segment.
///
/// Generated ids are `seg-<millis>-<fingerprint prefix>`, zero-padded so
/// that lexicographic order is creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(String);

impl SegmentId {
    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id from a creation time and a content fingerprint.
    pub fn generate(created_at_millis: u64, fingerprint: &str) -> Self {
        let prefix: String = fingerprint.chars().take(12).collect();
        Self(format!("seg-{created_at_millis:013}-{prefix}"))
    }

    /// Whether the id has the shape produced by [`SegmentId::generate`].
    pub fn is_generated(&self) -> bool {
        let Some(rest) = self.0.strip_prefix("seg-") else {
            return false;
        };
        let Some((millis, prefix)) = rest.split_once('-') else {
            return false;
        };
        millis.len() >= 13
            && millis.bytes().all(|b| b.is_ascii_digit())
            && (1..=12).contains(&prefix.len())
            && prefix.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name under the segment directory, percent-encoded so any id is
    /// a single safe path component.
    pub fn file_name(&self) -> String {
        format!(
            "{}.{SEGMENT_EXTENSION}",
            utf8_percent_encode(&self.0, FILE_NAME_SET)
        )
    }

    /// Reverse of [`SegmentId::file_name`]. Returns `None` for names that
    /// are not segment files.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
        if stem.is_empty() {
            return None;
        }
        let decoded = percent_decode_str(stem).decode_utf8().ok()?;
        Some(Self(decoded.into_owned()))
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
