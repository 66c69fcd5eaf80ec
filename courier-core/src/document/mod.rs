mod asset;
mod model;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use asset::{Asset, AssetKind, MediaProperties, StreamInfo, ThumbnailSize};
pub use model::{AssetExtractable, CourseModel, PostModel, VideoModel};

static VIDEO_MODEL: VideoModel = VideoModel;
static POST_MODEL: PostModel = PostModel;
static COURSE_MODEL: CourseModel = CourseModel;

/// Document variant. Each variant owns its asset extraction and rewrite
/// rules; the coordinator composes them through [`AssetExtractable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Video,
    Post,
    Course,
}

impl DocumentKind {
    pub fn model(&self) -> &'static dyn AssetExtractable {
        match self {
            DocumentKind::Video => &VIDEO_MODEL,
            DocumentKind::Post => &POST_MODEL,
            DocumentKind::Course => &COURSE_MODEL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Video => "video",
            DocumentKind::Post => "post",
            DocumentKind::Course => "course",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable external identity of a document: `(site, post_id)`. At most one
/// transfer may be in flight per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub site: String,
    pub post_id: i64,
}

impl DocumentKey {
    pub fn new(site: impl Into<String>, post_id: i64) -> Self {
        Self {
            site: site.into(),
            post_id,
        }
    }

    pub fn from_value(doc: &Value) -> Option<Self> {
        let site = doc.get("site")?.as_str()?;
        let post_id = doc.get("post_id")?.as_i64()?;
        if site.is_empty() {
            return None;
        }
        Some(Self::new(site, post_id))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.site, self.post_id)
    }
}

/// Assets of `previous` whose hash no longer appears in `current`. These
/// are the storage objects to delete after a successful finalize.
pub fn orphaned_assets(previous: &[Asset], current: &[Asset]) -> Vec<Asset> {
    previous
        .iter()
        .filter(|asset| asset.content_hash.is_some())
        .filter(|asset| !current.iter().any(|other| other.hash_matches(asset)))
        .filter(|asset| asset.has_download_url() || asset.stream.is_some())
        .cloned()
        .collect()
}

/// Publish date of the document, used as the storage key date bucket.
/// Falls back to `None` (callers substitute the current date).
pub fn publish_date(doc: &Value) -> Option<DateTime<Utc>> {
    let raw = doc.get("published")?.as_str()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_requires_site_and_post_id() {
        let doc = json!({ "site": "publisher", "post_id": 42 });
        let key = DocumentKey::from_value(&doc).unwrap();
        assert_eq!(key.to_string(), "publisher_42");
        assert!(DocumentKey::from_value(&json!({ "site": "publisher" })).is_none());
        assert!(DocumentKey::from_value(&json!({ "site": "", "post_id": 1 })).is_none());
    }

    #[test]
    fn orphans_are_hashes_that_vanished() {
        let keep = Asset {
            kind: AssetKind::Source {
                unit_index: Some(0),
                source_index: Some(0),
            },
            download_url: "https://assets/a.mp4".into(),
            content_hash: Some("aaa".into()),
            media: None,
            stream: None,
        };
        let gone = Asset {
            kind: AssetKind::Source {
                unit_index: Some(0),
                source_index: Some(1),
            },
            download_url: "https://assets/b.mp4".into(),
            content_hash: Some("bbb".into()),
            media: None,
            stream: None,
        };
        let orphans = orphaned_assets(&[keep.clone(), gone.clone()], &[keep]);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].content_hash.as_deref(), Some("bbb"));
    }

    #[test]
    fn publish_date_parses_common_formats() {
        assert!(publish_date(&json!({ "published": "2024-01-15T10:00:00Z" })).is_some());
        assert!(publish_date(&json!({ "published": "2024-01-15" })).is_some());
        assert!(publish_date(&json!({ "published": "not a date" })).is_none());
        assert!(publish_date(&json!({})).is_none());
    }
}
