//! Extraction worker and the media summary shared by all extractors.
//!
//! Extractors read a staged artifact into a [`MediaSummary`];
//! [`MediaSummary::to_delta`] maps it onto graph nodes:
//!
//! | Node | Key | Relationship |
//! |------|-----|--------------|
//! | `Video` | `video:<hash>` | |
//! | `Container` | `container:<name>` | `Video -PACKAGED_AS-> Container` |
//! | `Track` | `track:<hash>:<n>` | `Video -HAS_TRACK-> Track` |
//! | `Codec` | `codec:<id>` | `Track -ENCODED_WITH-> Codec` |
//! | `Brand` | `brand:<b>` | `Video -COMPATIBLE_WITH-> Brand` |
//!
//! [`ExtractionWorker`] wraps the configured extractor in a hard deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use vidgraph_core::delta::{no_props, GraphDelta, PropertyValue};
use vidgraph_core::error::IngestError;
use vidgraph_core::extract::Extractor;
use vidgraph_core::models::StagedFile;

use crate::config::Config;
use crate::extractor_container::ContainerExtractor;
use crate::extractor_ffprobe::FfprobeExtractor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
            TrackKind::Subtitle => "subtitle",
            TrackKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSummary {
    pub number: u64,
    pub kind: TrackKind,
    pub codec: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub sample_rate: Option<f64>,
    pub channels: Option<u64>,
}

impl TrackSummary {
    pub fn new(number: u64, kind: TrackKind) -> Self {
        Self {
            number,
            kind,
            codec: None,
            width: None,
            height: None,
            sample_rate: None,
            channels: None,
        }
    }
}

/// What an extractor learned about one file.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MediaSummary {
    /// `webm`, `matroska`, `mp4`, `quicktime`, `avi` or `ogg`.
    pub container: String,
    pub duration_secs: Option<f64>,
    pub major_brand: Option<String>,
    pub compatible_brands: Vec<String>,
    pub muxing_app: Option<String>,
    pub writing_app: Option<String>,
    pub tracks: Vec<TrackSummary>,
}

fn codec_key(codec: &str) -> String {
    format!("codec:{}", codec.trim().to_ascii_lowercase())
}

impl MediaSummary {
    pub fn to_delta(&self, staged: &StagedFile) -> GraphDelta {
        let hash = &staged.content_hash;
        let video_key = format!("video:{}", hash);
        let container_key = format!("container:{}", self.container);

        let mut video: Vec<(&str, PropertyValue)> = vec![
            ("content_hash", hash.as_str().into()),
            ("size_bytes", staged.size_bytes.into()),
            ("content_type", staged.content_type.as_str().into()),
            ("container", self.container.as_str().into()),
            ("track_count", (self.tracks.len() as u64).into()),
        ];
        if let Some(d) = self.duration_secs.filter(|d| d.is_finite()) {
            video.push(("duration_secs", d.into()));
        }
        if let Some(ref b) = self.major_brand {
            video.push(("major_brand", b.as_str().into()));
        }
        if let Some(ref app) = self.muxing_app {
            video.push(("muxing_app", app.as_str().into()));
        }
        if let Some(ref app) = self.writing_app {
            video.push(("writing_app", app.as_str().into()));
        }

        let mut builder = GraphDelta::builder()
            .node(&video_key, "Video", video)
            .node(
                &container_key,
                "Container",
                [("name", self.container.as_str())],
            )
            .relationship(&video_key, "PACKAGED_AS", &container_key, no_props());

        for brand in &self.compatible_brands {
            let brand_key = format!("brand:{}", brand);
            builder = builder
                .node(&brand_key, "Brand", [("name", brand.as_str())])
                .relationship(&video_key, "COMPATIBLE_WITH", &brand_key, no_props());
        }

        for track in &self.tracks {
            let track_key = format!("track:{}:{}", hash, track.number);
            let mut props: Vec<(&str, PropertyValue)> = vec![
                ("number", track.number.into()),
                ("kind", track.kind.as_str().into()),
            ];
            if let Some(ref codec) = track.codec {
                props.push(("codec", codec.as_str().into()));
            }
            if let Some(w) = track.width {
                props.push(("width", w.into()));
            }
            if let Some(h) = track.height {
                props.push(("height", h.into()));
            }
            if let Some(rate) = track.sample_rate.filter(|r| r.is_finite()) {
                props.push(("sample_rate", rate.into()));
            }
            if let Some(c) = track.channels {
                props.push(("channels", c.into()));
            }

            builder = builder
                .node(&track_key, "Track", props)
                .relationship(
                    &video_key,
                    "HAS_TRACK",
                    &track_key,
                    [("number", track.number)],
                );

            if let Some(ref codec) = track.codec {
                let key = codec_key(codec);
                builder = builder
                    .node(&key, "Codec", [("id", codec.as_str())])
                    .relationship(&track_key, "ENCODED_WITH", &key, no_props());
            }
        }

        builder.build()
    }
}

/// Runs one extractor under a deadline.
#[derive(Clone)]
pub struct ExtractionWorker {
    extractor: Arc<dyn Extractor>,
    timeout: Duration,
}

impl ExtractionWorker {
    pub fn new(extractor: Arc<dyn Extractor>, timeout: Duration) -> Self {
        Self { extractor, timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(create_extractor(config), config.extraction.timeout())
    }

    pub fn extractor_name(&self) -> &str {
        self.extractor.name()
    }

    pub async fn extract(&self, staged: &StagedFile) -> Result<GraphDelta, IngestError> {
        let started = std::time::Instant::now();
        let delta = tokio::time::timeout(self.timeout, self.extractor.extract(staged))
            .await
            .map_err(|_| IngestError::ExtractionTimeout(self.timeout))??;
        tracing::debug!(
            extractor = self.extractor.name(),
            content_hash = %staged.content_hash,
            nodes = delta.nodes().len(),
            relationships = delta.relationships().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction finished"
        );
        Ok(delta)
    }
}

/// Build the extractor named by `extraction.extractor`.
pub fn create_extractor(config: &Config) -> Arc<dyn Extractor> {
    match config.extraction.extractor.as_str() {
        "ffprobe" => Arc::new(FfprobeExtractor::new(config.extraction.ffprobe_path.clone())),
        _ => Arc::new(ContainerExtractor::new()),
    }
}
