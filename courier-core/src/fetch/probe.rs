use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::document::MediaProperties;

/// Extracts pixel dimensions, duration and bitrate from a downloaded video
/// file. Probe failures are reported, never fatal to the transfer.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> io::Result<MediaProperties>;
}

/// Shells out to ffprobe with JSON output.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    command: String,
}

impl FfprobeProber {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> io::Result<MediaProperties> {
        let output = Command::new(&self.command)
            .arg("-i")
            .arg(path)
            .args([
                "-hide_banner",
                "-show_format",
                "-show_streams",
                "-v",
                "error",
                "-print_format",
                "json",
            ])
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {:?}: {}",
                self.command,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        parse_probe_output(&output.stdout)
            .ok_or_else(|| io::Error::other("media properties could not be obtained"))
    }
}

fn parse_probe_output(stdout: &[u8]) -> Option<MediaProperties> {
    let meta: Value = serde_json::from_slice(stdout).ok()?;
    let mut props = MediaProperties::default();
    if let Some(streams) = meta.get("streams").and_then(Value::as_array) {
        for stream in streams {
            if stream.get("codec_type").and_then(Value::as_str) == Some("video") {
                props.width = stream.get("width").and_then(Value::as_u64);
                props.height = stream.get("height").and_then(Value::as_u64);
                break;
            }
        }
    }
    if let Some(format) = meta.get("format") {
        props.file_size = numeric_field(format, "size");
        props.bitrate = numeric_field(format, "bit_rate");
        props.duration = format
            .get("duration")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<f64>().ok());
    }
    if props.is_empty() {
        None
    } else {
        Some(props)
    }
}

// ffprobe reports format numbers as strings
fn numeric_field(format: &Value, field: &str) -> Option<u64> {
    match format.get(field) {
        Some(Value::String(raw)) => raw.parse().ok(),
        Some(value) => value.as_u64(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffprobe_json() {
        let stdout = br#"{
            "streams": [
                { "codec_type": "audio", "codec_name": "aac" },
                { "codec_type": "video", "width": 1920, "height": 1080 }
            ],
            "format": {
                "size": "1048576",
                "bit_rate": "4000000",
                "duration": "12.480000"
            }
        }"#;
        let props = parse_probe_output(stdout).unwrap();
        assert_eq!(props.width, Some(1920));
        assert_eq!(props.height, Some(1080));
        assert_eq!(props.file_size, Some(1_048_576));
        assert_eq!(props.bitrate, Some(4_000_000));
        assert_eq!(props.duration, Some(12.48));
    }

    #[test]
    fn empty_probe_yields_none() {
        assert!(parse_probe_output(b"{}").is_none());
        assert!(parse_probe_output(b"not json").is_none());
    }
}
