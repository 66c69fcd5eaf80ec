use serde_json::{json, Value};

use super::asset::{Asset, AssetKind, MediaProperties, StreamInfo, ThumbnailSize};

/// Capability interface over a document variant: extract its embedded asset
/// references and write a mutated asset back to its structural location.
pub trait AssetExtractable: Send + Sync {
    fn get_assets(&self, doc: &Value) -> Vec<Asset>;
    fn put_asset(&self, doc: &mut Value, asset: &Asset);
    fn get_units<'a>(&self, doc: &'a Value) -> Vec<&'a Value>;
}

/// Video documents: assets under `unit[].source[]`, `unit[].transcript`,
/// `unit[].srt` and the shared `thumbnail.*` slots.
#[derive(Debug, Default)]
pub struct VideoModel;

/// Post documents carry thumbnails only.
#[derive(Debug, Default)]
pub struct PostModel;

/// Course documents carry thumbnails only.
#[derive(Debug, Default)]
pub struct CourseModel;

impl AssetExtractable for VideoModel {
    fn get_assets(&self, doc: &Value) -> Vec<Asset> {
        let mut assets = Vec::new();
        if let Some(units) = doc.get("unit").and_then(Value::as_array) {
            for (unit_index, unit) in units.iter().enumerate() {
                if let Some(sources) = unit.get("source").and_then(Value::as_array) {
                    for (source_index, source) in sources.iter().enumerate() {
                        assets.push(Asset {
                            kind: AssetKind::Source {
                                unit_index: Some(unit_index),
                                source_index: Some(source_index),
                            },
                            download_url: text_field(source, "downloadUrl"),
                            content_hash: optional_text_field(source, "md5"),
                            media: MediaProperties::from_value(
                                source.get("size"),
                                source.get("duration"),
                            ),
                            stream: source.get("stream").and_then(StreamInfo::from_value),
                        });
                    }
                }
                if let Some(transcript) = present(unit.get("transcript")) {
                    assets.push(caption_asset(
                        AssetKind::Transcript { unit_index },
                        transcript,
                    ));
                }
                if let Some(srt) = present(unit.get("srt")) {
                    assets.push(caption_asset(AssetKind::Srt { unit_index }, srt));
                }
            }
        }
        assets.extend(thumbnail_assets(doc));
        assets
    }

    fn put_asset(&self, doc: &mut Value, asset: &Asset) {
        match &asset.kind {
            AssetKind::Source {
                unit_index: Some(unit_index),
                source_index: Some(source_index),
            } => {
                if let Some(source) = source_slot_mut(doc, *unit_index, *source_index) {
                    source["downloadUrl"] = Value::String(asset.download_url.clone());
                    source["md5"] = optional_text_value(&asset.content_hash);
                    source["stream"] = stream_value(&asset.stream);
                    match &asset.media {
                        Some(media) => {
                            source["size"] = media.to_value();
                            source["duration"] = media
                                .duration
                                .map(|d| json!(d))
                                .unwrap_or(Value::Null);
                        }
                        None => {
                            source["size"] = Value::Null;
                            source["duration"] = Value::Null;
                        }
                    }
                }
            }
            // Location lost in the async reprocessing path: find the source
            // by content hash instead. First match wins.
            AssetKind::Source { .. } => {
                let Some(hash) = asset.content_hash.as_deref() else {
                    return;
                };
                let Some(units) = doc.get_mut("unit").and_then(Value::as_array_mut) else {
                    return;
                };
                for unit in units.iter_mut() {
                    let Some(sources) = unit.get_mut("source").and_then(Value::as_array_mut)
                    else {
                        continue;
                    };
                    for source in sources.iter_mut() {
                        if source.get("md5").and_then(Value::as_str) == Some(hash) {
                            source["stream"] = stream_value(&asset.stream);
                            if let Some(media) = &asset.media {
                                source["size"] = media.to_value();
                                source["duration"] = media
                                    .duration
                                    .map(|d| json!(d))
                                    .unwrap_or(Value::Null);
                            }
                            return;
                        }
                    }
                }
            }
            AssetKind::Transcript { unit_index } => {
                put_caption(doc, *unit_index, "transcript", asset);
            }
            AssetKind::Srt { unit_index } => {
                put_caption(doc, *unit_index, "srt", asset);
            }
            AssetKind::Thumbnail { .. } => put_thumbnail(doc, asset),
        }
    }

    fn get_units<'a>(&self, doc: &'a Value) -> Vec<&'a Value> {
        doc.get("unit")
            .and_then(Value::as_array)
            .map(|units| units.iter().collect())
            .unwrap_or_default()
    }
}

impl AssetExtractable for PostModel {
    fn get_assets(&self, doc: &Value) -> Vec<Asset> {
        thumbnail_assets(doc)
    }

    fn put_asset(&self, doc: &mut Value, asset: &Asset) {
        if matches!(asset.kind, AssetKind::Thumbnail { .. }) {
            put_thumbnail(doc, asset);
        }
    }

    fn get_units<'a>(&self, doc: &'a Value) -> Vec<&'a Value> {
        vec![doc]
    }
}

impl AssetExtractable for CourseModel {
    fn get_assets(&self, doc: &Value) -> Vec<Asset> {
        thumbnail_assets(doc)
    }

    fn put_asset(&self, doc: &mut Value, asset: &Asset) {
        if matches!(asset.kind, AssetKind::Thumbnail { .. }) {
            put_thumbnail(doc, asset);
        }
    }

    fn get_units<'a>(&self, doc: &'a Value) -> Vec<&'a Value> {
        vec![doc]
    }
}

fn caption_asset(kind: AssetKind, node: &Value) -> Asset {
    Asset {
        kind,
        download_url: text_field(node, "srcUrl"),
        content_hash: optional_text_field(node, "md5"),
        media: None,
        stream: None,
    }
}

fn put_caption(doc: &mut Value, unit_index: usize, field: &str, asset: &Asset) {
    let Some(node) = doc
        .get_mut("unit")
        .and_then(Value::as_array_mut)
        .and_then(|units| units.get_mut(unit_index))
        .and_then(|unit| unit.get_mut(field))
    else {
        return;
    };
    node["srcUrl"] = Value::String(asset.download_url.clone());
    node["md5"] = optional_text_value(&asset.content_hash);
}

fn thumbnail_assets(doc: &Value) -> Vec<Asset> {
    let mut assets = Vec::new();
    let Some(thumbnail) = doc.get("thumbnail") else {
        return assets;
    };
    for size in ThumbnailSize::ALL {
        if let Some(slot) = present(thumbnail.get(size.as_str())) {
            assets.push(Asset {
                kind: AssetKind::Thumbnail {
                    size,
                    width: slot.get("width").and_then(Value::as_u64),
                    height: slot.get("height").and_then(Value::as_u64),
                    orientation: slot
                        .get("orientation")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
                download_url: text_field(slot, "url"),
                content_hash: optional_text_field(slot, "md5"),
                media: None,
                stream: None,
            });
        }
    }
    assets
}

fn put_thumbnail(doc: &mut Value, asset: &Asset) {
    let AssetKind::Thumbnail {
        size,
        width,
        height,
        orientation,
    } = &asset.kind
    else {
        return;
    };
    let Some(slot) = doc
        .get_mut("thumbnail")
        .and_then(|thumbnail| thumbnail.get_mut(size.as_str()))
    else {
        return;
    };
    slot["url"] = Value::String(asset.download_url.clone());
    slot["md5"] = optional_text_value(&asset.content_hash);
    slot["width"] = width.map(|w| json!(w)).unwrap_or(Value::Null);
    slot["height"] = height.map(|h| json!(h)).unwrap_or(Value::Null);
    slot["orientation"] = orientation
        .as_ref()
        .map(|o| Value::String(o.clone()))
        .unwrap_or(Value::Null);
}

fn source_slot_mut(doc: &mut Value, unit_index: usize, source_index: usize) -> Option<&mut Value> {
    doc.get_mut("unit")
        .and_then(Value::as_array_mut)
        .and_then(|units| units.get_mut(unit_index))
        .and_then(|unit| unit.get_mut("source"))
        .and_then(Value::as_array_mut)
        .and_then(|sources| sources.get_mut(source_index))
}

fn stream_value(stream: &Option<StreamInfo>) -> Value {
    match stream {
        Some(info) => serde_json::to_value(info).unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn text_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn optional_text_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn optional_text_value(value: &Option<String>) -> Value {
    value
        .as_ref()
        .map(|text| Value::String(text.clone()))
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn video_doc() -> Value {
        json!({
            "site": "publisher",
            "post_id": 42,
            "unit": [
                {
                    "source": [
                        { "downloadUrl": "http://origin/v1.mp4", "md5": "aaa" },
                        { "downloadUrl": "http://origin/v2.mp4" }
                    ],
                    "transcript": { "srcUrl": "http://origin/v.txt" },
                    "srt": { "srcUrl": "http://origin/v.srt", "md5": "ccc" }
                },
                {
                    "source": [
                        { "downloadUrl": "http://origin/fr.mp4", "md5": "ddd" }
                    ]
                }
            ],
            "thumbnail": {
                "small": { "url": "http://origin/t-s.jpg", "width": 160, "height": 90 },
                "full": { "url": "http://origin/t-f.jpg", "md5": "eee" }
            }
        })
    }

    #[test]
    fn video_assets_cover_all_units() {
        let doc = video_doc();
        let assets = VideoModel.get_assets(&doc);
        let sources = assets
            .iter()
            .filter(|a| matches!(a.kind, AssetKind::Source { .. }))
            .count();
        let thumbnails = assets
            .iter()
            .filter(|a| matches!(a.kind, AssetKind::Thumbnail { .. }))
            .count();
        assert_eq!(sources, 3);
        assert_eq!(thumbnails, 2);
        assert_eq!(assets.len(), 7);
        assert!(assets.iter().any(|a| matches!(
            a.kind,
            AssetKind::Source { unit_index: Some(1), source_index: Some(0) }
        )));
    }

    #[test]
    fn put_source_rewrites_in_place() {
        let mut doc = video_doc();
        let mut asset = VideoModel.get_assets(&doc).remove(0);
        asset.download_url = "https://assets/2024/01/publisher_42/aaa.mp4".into();
        asset.content_hash = Some("aaa".into());
        asset.media = Some(MediaProperties {
            width: Some(1920),
            height: Some(1080),
            file_size: Some(1000),
            bitrate: Some(4000),
            duration: Some(12.5),
        });
        VideoModel.put_asset(&mut doc, &asset);
        let source = &doc["unit"][0]["source"][0];
        assert_eq!(
            source["downloadUrl"],
            "https://assets/2024/01/publisher_42/aaa.mp4"
        );
        assert_eq!(source["md5"], "aaa");
        assert_eq!(source["size"]["width"], 1920);
        assert_eq!(source["duration"], 12.5);
    }

    #[test]
    fn put_source_without_indices_matches_by_hash() {
        let mut doc = video_doc();
        let asset = Asset {
            kind: AssetKind::Source {
                unit_index: None,
                source_index: None,
            },
            download_url: String::new(),
            content_hash: Some("ddd".into()),
            media: None,
            stream: Some(StreamInfo {
                url: "https://player/video/99".into(),
                uid: "99".into(),
                site: None,
                link: None,
                thumbnail: None,
            }),
        };
        VideoModel.put_asset(&mut doc, &asset);
        assert_eq!(doc["unit"][1]["source"][0]["stream"]["uid"], "99");
        // untouched siblings keep their urls
        assert_eq!(doc["unit"][0]["source"][0]["downloadUrl"], "http://origin/v1.mp4");
    }

    #[test]
    fn put_caption_rewrites_src_url() {
        let mut doc = video_doc();
        let asset = Asset {
            kind: AssetKind::Srt { unit_index: 0 },
            download_url: "https://assets/2024/01/publisher_42/ccc.srt".into(),
            content_hash: Some("ccc".into()),
            media: None,
            stream: None,
        };
        VideoModel.put_asset(&mut doc, &asset);
        assert_eq!(
            doc["unit"][0]["srt"]["srcUrl"],
            "https://assets/2024/01/publisher_42/ccc.srt"
        );
    }

    #[test]
    fn post_assets_are_thumbnails_only() {
        let doc = json!({
            "site": "publisher",
            "post_id": 7,
            "thumbnail": {
                "small": { "url": "http://origin/s.jpg", "width": 160, "height": 90,
                           "orientation": "landscape" },
                "medium": { "url": "http://origin/m.jpg" }
            }
        });
        let assets = PostModel.get_assets(&doc);
        assert_eq!(assets.len(), 2);
        assert!(assets
            .iter()
            .all(|a| matches!(a.kind, AssetKind::Thumbnail { .. })));

        let mut doc = doc;
        let mut asset = assets[0].clone();
        asset.download_url = "https://assets/2024/01/publisher_7/fff.jpg".into();
        asset.content_hash = Some("fff".into());
        PostModel.put_asset(&mut doc, &asset);
        assert_eq!(
            doc["thumbnail"]["small"]["url"],
            "https://assets/2024/01/publisher_7/fff.jpg"
        );
        assert_eq!(doc["thumbnail"]["small"]["md5"], "fff");
        assert_eq!(doc["thumbnail"]["small"]["width"], 160);
    }
}
