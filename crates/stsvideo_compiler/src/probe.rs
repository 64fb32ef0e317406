//! Asset Probe (§4.3): queries the external probe binary for duration,
//! dimensions, rotation, and stream presence. Blocking I/O is acceptable —
//! probes for distinct assets run sequentially.

use crate::error::{CompileError, Result};
use serde::Deserialize;
use std::path::Path;
use stsvideo_core::types::AssetKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeData {
    pub duration_ms: i64,
    pub width: u32,
    pub height: u32,
    pub rotation: u16,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    tags: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,
    rotation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

pub fn probe_asset(path: impl AsRef<Path>) -> Result<ProbeData> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CompileError::AssetMissing(path.to_path_buf()));
    }

    if is_image_extension(path) {
        let (width, height) = probe_image_dimensions(path)?;
        return Ok(ProbeData {
            duration_ms: 0,
            width,
            height,
            rotation: 0,
            has_video: false,
            has_audio: false,
        });
    }

    let output = std::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompileError::ProbeNotFound
            } else {
                CompileError::AssetProbeFailed {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            }
        })?;

    if !output.status.success() {
        return Err(CompileError::AssetProbeFailed {
            path: path.to_path_buf(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
        CompileError::AssetProbeFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;

    parse_probe_output(&parsed, path)
}

fn parse_probe_output(probe: &FfprobeOutput, path: &Path) -> Result<ProbeData> {
    let video_stream = probe.streams.iter().find(|s| s.codec_type == "video");
    let has_audio = probe.streams.iter().any(|s| s.codec_type == "audio");

    let duration_ms = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round() as i64)
        .ok_or_else(|| CompileError::AssetProbeFailed {
            path: path.to_path_buf(),
            message: "missing format.duration".to_string(),
        })?;

    let width = video_stream.and_then(|s| s.width).unwrap_or(0);
    let height = video_stream.and_then(|s| s.height).unwrap_or(0);
    let rotation = video_stream.map(extract_rotation).unwrap_or(0);

    Ok(ProbeData {
        duration_ms,
        width,
        height,
        rotation,
        has_video: video_stream.is_some(),
        has_audio,
    })
}

/// ffprobe exposes rotation either via a `Display Matrix` side-data entry
/// (negative degrees, clockwise) or a legacy `rotate` stream tag.
fn extract_rotation(stream: &FfprobeStream) -> u16 {
    if let Some(side) = stream
        .side_data_list
        .iter()
        .find(|sd| sd.side_data_type.as_deref() == Some("Display Matrix"))
    {
        if let Some(degrees) = side.rotation {
            return normalize_rotation(-degrees as i64);
        }
    }
    if let Some(tags) = &stream.tags {
        if let Some(rotate) = tags.get("rotate").and_then(|r| r.parse::<i64>().ok()) {
            return normalize_rotation(rotate);
        }
    }
    0
}

fn normalize_rotation(degrees: i64) -> u16 {
    (((degrees % 360) + 360) % 360) as u16
}

fn is_image_extension(path: &Path) -> bool {
    matches!(
        extension_lowercase(path).as_deref(),
        Some("png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" | "tiff" | "svg")
    )
}

fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Images have no media stream to probe for dimensions; read the PNG/JPEG
/// header directly rather than shelling out to ffprobe for a static file.
fn probe_image_dimensions(path: &Path) -> Result<(u32, u32)> {
    let bytes = std::fs::read(path)?;
    if bytes.len() > 24 && &bytes[0..8] == b"\x89PNG\r\n\x1a\n" {
        let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        return Ok((width, height));
    }
    // Non-PNG stills (jpg, gif, ...) fall back to ffprobe for dimensions.
    let output = std::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .map_err(|e| CompileError::AssetProbeFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let text = String::from_utf8_lossy(&output.stdout);
    let mut parts = text.trim().split(',');
    let width = parts.next().and_then(|w| w.parse().ok()).unwrap_or(0);
    let height = parts.next().and_then(|h| h.parse().ok()).unwrap_or(0);
    Ok((width, height))
}

pub fn detect_kind_from_extension(path: &Path) -> Option<AssetKind> {
    match extension_lowercase(path).as_deref() {
        Some("png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" | "tiff" | "svg") => {
            Some(AssetKind::Image)
        }
        Some("mp3" | "wav" | "flac" | "aac" | "ogg" | "m4a" | "wma") => Some(AssetKind::Audio),
        Some("mp4" | "mov" | "mkv" | "webm" | "avi") => Some(AssetKind::Video),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rotation_wraps_negative_values() {
        assert_eq!(normalize_rotation(-90), 270);
        assert_eq!(normalize_rotation(-270), 90);
        assert_eq!(normalize_rotation(450), 90);
        assert_eq!(normalize_rotation(0), 0);
    }

    #[test]
    fn detect_kind_by_extension() {
        assert_eq!(
            detect_kind_from_extension(Path::new("photo.PNG")),
            Some(AssetKind::Image)
        );
        assert_eq!(
            detect_kind_from_extension(Path::new("song.mp3")),
            Some(AssetKind::Audio)
        );
        assert_eq!(
            detect_kind_from_extension(Path::new("clip.mp4")),
            Some(AssetKind::Video)
        );
        assert_eq!(detect_kind_from_extension(Path::new("unknown.xyz")), None);
    }

    #[test]
    fn parse_probe_output_video_and_audio() {
        let json = r#"{
            "streams": [
                { "codec_type": "video", "width": 1920, "height": 1080 },
                { "codec_type": "audio" }
            ],
            "format": { "duration": "10.5" }
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        let result = parse_probe_output(&parsed, Path::new("clip.mp4")).unwrap();
        assert_eq!(result.width, 1920);
        assert_eq!(result.height, 1080);
        assert_eq!(result.duration_ms, 10_500);
        assert!(result.has_video);
        assert!(result.has_audio);
    }

    #[test]
    fn parse_probe_output_reads_display_matrix_rotation() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "video",
                    "width": 1080,
                    "height": 1920,
                    "side_data_list": [{ "side_data_type": "Display Matrix", "rotation": -90.0 }]
                }
            ],
            "format": { "duration": "3.0" }
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        let result = parse_probe_output(&parsed, Path::new("clip.mp4")).unwrap();
        assert_eq!(result.rotation, 90);
    }

    #[test]
    fn probe_nonexistent_file_errors() {
        let err = probe_asset("/tmp/does_not_exist_stsvideo_probe_test.mp4").unwrap_err();
        assert!(matches!(err, CompileError::AssetMissing(_)));
    }
}
