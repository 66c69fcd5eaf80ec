use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Thumbnail slot within a document's `thumbnail` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
    Full,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 4] = [
        ThumbnailSize::Small,
        ThumbnailSize::Medium,
        ThumbnailSize::Large,
        ThumbnailSize::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailSize::Small => "small",
            ThumbnailSize::Medium => "medium",
            ThumbnailSize::Large => "large",
            ThumbnailSize::Full => "full",
        }
    }
}

/// Structural location of an asset inside its document.
///
/// Source assets may lose their indices when they travel through the
/// asynchronous reprocessing path; `put_asset` then falls back to matching
/// by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetKind {
    Source {
        unit_index: Option<usize>,
        source_index: Option<usize>,
    },
    Transcript {
        unit_index: usize,
    },
    Srt {
        unit_index: usize,
    },
    Thumbnail {
        size: ThumbnailSize,
        width: Option<u64>,
        height: Option<u64>,
        orientation: Option<String>,
    },
}

/// Pixel dimensions, size and duration of a video asset, extracted by the
/// media prober after download. All fields stay `None` for non-video
/// content or when probing fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaProperties {
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub file_size: Option<u64>,
    pub bitrate: Option<u64>,
    pub duration: Option<f64>,
}

impl MediaProperties {
    pub fn is_empty(&self) -> bool {
        self.width.is_none()
            && self.height.is_none()
            && self.file_size.is_none()
            && self.bitrate.is_none()
            && self.duration.is_none()
    }

    pub(crate) fn to_value(&self) -> Value {
        json!({
            "width": self.width,
            "height": self.height,
            "filesize": self.file_size,
            "bitrate": self.bitrate,
        })
    }

    pub(crate) fn from_value(size: Option<&Value>, duration: Option<&Value>) -> Option<Self> {
        let props = MediaProperties {
            width: size.and_then(|s| s.get("width")).and_then(Value::as_u64),
            height: size.and_then(|s| s.get("height")).and_then(Value::as_u64),
            file_size: size.and_then(|s| s.get("filesize")).and_then(Value::as_u64),
            bitrate: size.and_then(|s| s.get("bitrate")).and_then(Value::as_u64),
            duration: duration.and_then(Value::as_f64),
        };
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    }
}

/// Location of an encoded copy at the external streaming provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub url: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl StreamInfo {
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        let uid = value.get("uid")?.as_str()?.to_string();
        let url = value
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(StreamInfo {
            url,
            uid,
            site: value
                .get("site")
                .and_then(Value::as_str)
                .map(str::to_string),
            link: value
                .get("link")
                .and_then(Value::as_str)
                .map(str::to_string),
            thumbnail: value
                .get("thumbnail")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// One media reference embedded in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub kind: AssetKind,
    pub download_url: String,
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamInfo>,
}

impl Asset {
    pub fn has_download_url(&self) -> bool {
        !self.download_url.is_empty()
    }

    /// True when this request asset already matches `other` by hash and no
    /// transfer is needed.
    pub fn hash_matches(&self, other: &Asset) -> bool {
        match (&self.content_hash, &other.content_hash) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn is_video_source(&self) -> bool {
        matches!(self.kind, AssetKind::Source { .. })
    }
}
