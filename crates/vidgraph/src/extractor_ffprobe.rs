//! Extractor backed by an external `ffprobe` binary.
//!
//! Runs `ffprobe -v error -print_format json -show_format -show_streams
//! <file>` and maps its JSON onto a [`MediaSummary`]. The child is spawned
//! with `kill_on_drop`, so when the worker's deadline drops the future the
//! process is killed with it.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;

use vidgraph_core::delta::GraphDelta;
use vidgraph_core::error::IngestError;
use vidgraph_core::extract::Extractor;
use vidgraph_core::models::StagedFile;

use crate::extraction::{MediaSummary, TrackKind, TrackSummary};

#[derive(Debug, Deserialize)]
pub struct ProbeOutput {
    pub format: Option<ProbeFormat>,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
pub struct ProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ProbeStream {
    pub index: u64,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub sample_rate: Option<String>,
    pub channels: Option<u64>,
}

pub struct FfprobeExtractor {
    program: String,
}

impl FfprobeExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Extractor for FfprobeExtractor {
    fn name(&self) -> &str {
        "ffprobe"
    }

    async fn extract(&self, staged: &StagedFile) -> Result<GraphDelta, IngestError> {
        let output = tokio::process::Command::new(&self.program)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(&staged.path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| IngestError::io(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IngestError::CorruptInput(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| IngestError::CorruptInput(format!("unreadable ffprobe output: {}", e)))?;
        Ok(summary_from_probe(&probe, &staged.content_type)?.to_delta(staged))
    }
}

/// Map ffprobe's `format_name` list (`"mov,mp4,m4a,3gp,3g2,mj2"`) to a
/// container name. ffprobe reports Matroska and WebM under one demuxer,
/// so the declared content type decides between them.
fn container_name(format_name: &str, major_brand: Option<&str>, content_type: &str) -> String {
    let names: Vec<&str> = format_name.split(',').map(str::trim).collect();
    if names.contains(&"mov") || names.contains(&"mp4") {
        if major_brand == Some("qt") {
            "quicktime".to_string()
        } else {
            "mp4".to_string()
        }
    } else if names.contains(&"webm") && content_type == "video/webm" {
        "webm".to_string()
    } else if names.contains(&"matroska") {
        "matroska".to_string()
    } else {
        names.first().copied().unwrap_or("unknown").to_string()
    }
}

pub fn summary_from_probe(probe: &ProbeOutput, content_type: &str) -> Result<MediaSummary, IngestError> {
    let format = probe
        .format
        .as_ref()
        .ok_or_else(|| IngestError::CorruptInput("ffprobe reported no format".to_string()))?;
    let format_name = format
        .format_name
        .as_deref()
        .ok_or_else(|| IngestError::CorruptInput("ffprobe reported no format name".to_string()))?;

    let major_brand = format.tags.get("major_brand").map(|b| b.trim().to_string());
    let compatible_brands = format
        .tags
        .get("compatible_brands")
        .map(|b| {
            b.as_bytes()
                .chunks(4)
                .map(|c| String::from_utf8_lossy(c).trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let tracks = probe
        .streams
        .iter()
        .map(|s| TrackSummary {
            number: s.index + 1,
            kind: match s.codec_type.as_deref() {
                Some("video") => TrackKind::Video,
                Some("audio") => TrackKind::Audio,
                Some("subtitle") => TrackKind::Subtitle,
                _ => TrackKind::Other,
            },
            codec: s.codec_name.clone(),
            width: s.width,
            height: s.height,
            sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
            channels: s.channels,
        })
        .collect();

    Ok(MediaSummary {
        container: container_name(format_name, major_brand.as_deref(), content_type),
        duration_secs: format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0),
        major_brand,
        compatible_brands,
        muxing_app: None,
        writing_app: format.tags.get("encoder").cloned(),
        tracks,
    })
}
