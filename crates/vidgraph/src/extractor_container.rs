//! Header-only container probe.
//!
//! Reads just enough of a file to describe its container and tracks. No
//! frame is ever decoded.
//!
//! - **Matroska / WebM**: EBML header `DocType`, segment `Info` and `Tracks`.
//!   Scanning stops at the first `Cluster`; unknown-size segments (live
//!   recorders such as MediaRecorder) are walked to the end of the file.
//! - **MP4 / QuickTime**: `ftyp` brands, then the `moov` box wherever it is
//!   (before or after `mdat`): `mvhd` duration, and per `trak` the `tkhd`
//!   id and size, `hdlr` handler and first `stsd` sample entry.
//! - **AVI** and **Ogg**: recognised, container only.
//!
//! The probe is synchronous `Read + Seek` code run on a blocking thread.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use async_trait::async_trait;

use vidgraph_core::delta::GraphDelta;
use vidgraph_core::error::IngestError;
use vidgraph_core::extract::Extractor;
use vidgraph_core::models::StagedFile;

use crate::extraction::{MediaSummary, TrackKind, TrackSummary};

/// Largest header structure (`Info`, `Tracks`, `moov`) read into memory.
const MAX_HEADER_BYTES: u64 = 64 * 1024 * 1024;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

mod ebml {
    pub const HEADER: u32 = 0x1A45_DFA3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const INFO: u32 = 0x1549_A966;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CODEC_ID: u32 = 0x86;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
}

fn corrupt(message: impl Into<String>) -> IngestError {
    IngestError::CorruptInput(message.into())
}

/// Default extractor: parses container headers in-process.
#[derive(Debug, Default)]
pub struct ContainerExtractor;

impl ContainerExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for ContainerExtractor {
    fn name(&self) -> &str {
        "container"
    }

    async fn extract(&self, staged: &StagedFile) -> Result<GraphDelta, IngestError> {
        let path = staged.path.clone();
        let summary = tokio::task::spawn_blocking(move || probe_file(&path))
            .await
            .map_err(|e| IngestError::Internal(format!("container probe panicked: {}", e)))??;
        Ok(summary.to_delta(staged))
    }
}

/// Probe a file on disk.
pub fn probe_file(path: &Path) -> Result<MediaSummary, IngestError> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    probe(&mut BufReader::new(file), len)
}

/// Probe any seekable source of `len` bytes.
pub fn probe<R: Read + Seek>(reader: &mut R, len: u64) -> Result<MediaSummary, IngestError> {
    let mut magic = [0u8; 12];
    let got = read_up_to(reader, &mut magic)?;
    let magic = &magic[..got];
    reader.seek(SeekFrom::Start(0))?;

    if magic.starts_with(&EBML_MAGIC) {
        probe_matroska(reader, len)
    } else if got >= 8 && is_mp4_top_level(&magic[4..8]) {
        probe_mp4(reader, len)
    } else if got >= 12 && &magic[..4] == b"RIFF" && &magic[8..12] == b"AVI " {
        Ok(MediaSummary {
            container: "avi".to_string(),
            ..Default::default()
        })
    } else if magic.starts_with(b"OggS") {
        Ok(MediaSummary {
            container: "ogg".to_string(),
            ..Default::default()
        })
    } else {
        Err(corrupt("unrecognized container format"))
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, IngestError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_body<R: Read>(reader: &mut R, size: u64, what: &str) -> Result<Vec<u8>, IngestError> {
    if size > MAX_HEADER_BYTES {
        return Err(corrupt(format!("{} is {} bytes", what, size)));
    }
    let mut body = vec![0u8; size as usize];
    reader
        .read_exact(&mut body)
        .map_err(|_| corrupt(format!("{} is truncated", what)))?;
    Ok(body)
}

// ============ Matroska / WebM ============

struct ElementHeader {
    id: u32,
    /// `None` for the reserved "unknown size" value.
    size: Option<u64>,
}

/// Read an EBML variable-length integer. Returns `(value, length, all_ones)`.
fn read_vint<R: Read>(reader: &mut R, keep_marker: bool) -> Result<Option<(u64, usize, bool)>, IngestError> {
    let mut first = [0u8; 1];
    if reader.read(&mut first)? == 0 {
        return Ok(None);
    }
    let first = first[0];
    if first == 0 {
        return Err(corrupt("invalid EBML variable-length integer"));
    }
    let len = first.leading_zeros() as usize + 1;
    let mut value = if keep_marker {
        first as u64
    } else {
        first as u64 & (0xFF_u64 >> len)
    };
    let mut rest = [0u8; 7];
    reader
        .read_exact(&mut rest[..len - 1])
        .map_err(|_| corrupt("truncated EBML integer"))?;
    for b in &rest[..len - 1] {
        value = (value << 8) | *b as u64;
    }
    let all_ones = !keep_marker && value == (1u64 << (7 * len)) - 1;
    Ok(Some((value, len, all_ones)))
}

fn read_element_header<R: Read>(reader: &mut R) -> Result<Option<ElementHeader>, IngestError> {
    let (id, id_len, _) = match read_vint(reader, true)? {
        Some(v) => v,
        None => return Ok(None),
    };
    if id_len > 4 {
        return Err(corrupt("EBML element id longer than 4 bytes"));
    }
    let (size, _, unknown) =
        read_vint(reader, false)?.ok_or_else(|| corrupt("EBML element without size"))?;
    Ok(Some(ElementHeader {
        id: id as u32,
        size: if unknown { None } else { Some(size) },
    }))
}

/// Child elements of an in-memory master element.
fn children(mut body: &[u8]) -> Result<Vec<(u32, &[u8])>, IngestError> {
    let mut out = Vec::new();
    while !body.is_empty() {
        let header = read_element_header(&mut body)?
            .ok_or_else(|| corrupt("truncated EBML element"))?;
        let size = header
            .size
            .ok_or_else(|| corrupt("unknown-size element inside a header"))?;
        if size > body.len() as u64 {
            return Err(corrupt(format!(
                "EBML element {:#x} overruns its parent",
                header.id
            )));
        }
        let (child, rest) = body.split_at(size as usize);
        out.push((header.id, child));
        body = rest;
    }
    Ok(out)
}

fn ebml_uint(data: &[u8]) -> Result<u64, IngestError> {
    if data.len() > 8 {
        return Err(corrupt("EBML unsigned integer longer than 8 bytes"));
    }
    Ok(data.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn ebml_float(data: &[u8]) -> Result<f64, IngestError> {
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64),
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(data);
            Ok(f64::from_be_bytes(b))
        }
        n => Err(corrupt(format!("EBML float of {} bytes", n))),
    }
}

fn ebml_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

fn probe_matroska<R: Read + Seek>(reader: &mut R, len: u64) -> Result<MediaSummary, IngestError> {
    let header = read_element_header(reader)?.ok_or_else(|| corrupt("empty file"))?;
    if header.id != ebml::HEADER {
        return Err(corrupt("missing EBML header"));
    }
    let size = header
        .size
        .ok_or_else(|| corrupt("EBML header has unknown size"))?;
    let body = read_body(reader, size, "EBML header")?;

    let mut doc_type = "matroska".to_string();
    for (id, data) in children(&body)? {
        if id == ebml::DOC_TYPE {
            doc_type = ebml_string(data);
        }
    }
    let container = match doc_type.as_str() {
        "webm" | "matroska" => doc_type,
        other => return Err(corrupt(format!("unsupported EBML DocType '{}'", other))),
    };

    // Skip anything (Void, CRC) until the Segment.
    let segment = loop {
        let el = read_element_header(reader)?.ok_or_else(|| corrupt("no Segment element"))?;
        if el.id == ebml::SEGMENT {
            break el;
        }
        let skip = el
            .size
            .ok_or_else(|| corrupt("unknown-size element before Segment"))?;
        reader.seek(SeekFrom::Current(skip as i64))?;
    };

    let start = reader.stream_position()?;
    let end = segment.size.map(|s| start.saturating_add(s).min(len)).unwrap_or(len);

    let mut summary = MediaSummary {
        container,
        ..Default::default()
    };
    let mut seen_info = false;
    let mut seen_tracks = false;

    while reader.stream_position()? < end && !(seen_info && seen_tracks) {
        let el = match read_element_header(reader)? {
            Some(el) => el,
            None => break,
        };
        if el.id == ebml::CLUSTER {
            break;
        }
        let size = match el.size {
            Some(size) => size,
            None => break,
        };
        match el.id {
            ebml::INFO => {
                let body = read_body(reader, size, "segment Info")?;
                parse_info(&body, &mut summary)?;
                seen_info = true;
            }
            ebml::TRACKS => {
                let body = read_body(reader, size, "Tracks")?;
                summary.tracks = parse_tracks(&body)?;
                seen_tracks = true;
            }
            _ => {
                let pos = reader.stream_position()?;
                if pos.saturating_add(size) > len {
                    break;
                }
                reader.seek(SeekFrom::Current(size as i64))?;
            }
        }
    }

    Ok(summary)
}

fn parse_info(body: &[u8], summary: &mut MediaSummary) -> Result<(), IngestError> {
    let mut scale: u64 = 1_000_000;
    let mut duration: Option<f64> = None;
    for (id, data) in children(body)? {
        match id {
            ebml::TIMECODE_SCALE => scale = ebml_uint(data)?,
            ebml::DURATION => duration = Some(ebml_float(data)?),
            ebml::MUXING_APP => summary.muxing_app = Some(ebml_string(data)),
            ebml::WRITING_APP => summary.writing_app = Some(ebml_string(data)),
            _ => {}
        }
    }
    summary.duration_secs = duration
        .map(|d| d * scale as f64 / 1e9)
        .filter(|d| d.is_finite() && *d >= 0.0);
    Ok(())
}

fn parse_tracks(body: &[u8]) -> Result<Vec<TrackSummary>, IngestError> {
    let mut tracks = Vec::new();
    for (id, entry) in children(body)? {
        if id != ebml::TRACK_ENTRY {
            continue;
        }
        let mut track = TrackSummary::new(0, TrackKind::Other);
        for (field, data) in children(entry)? {
            match field {
                ebml::TRACK_NUMBER => track.number = ebml_uint(data)?,
                ebml::TRACK_TYPE => {
                    track.kind = match ebml_uint(data)? {
                        1 => TrackKind::Video,
                        2 => TrackKind::Audio,
                        17 => TrackKind::Subtitle,
                        _ => TrackKind::Other,
                    }
                }
                ebml::CODEC_ID => track.codec = Some(ebml_string(data)),
                ebml::VIDEO => {
                    for (v, vd) in children(data)? {
                        match v {
                            ebml::PIXEL_WIDTH => track.width = Some(ebml_uint(vd)?),
                            ebml::PIXEL_HEIGHT => track.height = Some(ebml_uint(vd)?),
                            _ => {}
                        }
                    }
                }
                ebml::AUDIO => {
                    for (a, ad) in children(data)? {
                        match a {
                            ebml::SAMPLING_FREQUENCY => track.sample_rate = Some(ebml_float(ad)?),
                            ebml::CHANNELS => track.channels = Some(ebml_uint(ad)?),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        if track.number == 0 {
            return Err(corrupt("TrackEntry without TrackNumber"));
        }
        tracks.push(track);
    }
    Ok(tracks)
}

// ============ MP4 / QuickTime ============

fn is_mp4_top_level(fourcc: &[u8]) -> bool {
    matches!(
        fourcc,
        b"ftyp" | b"moov" | b"mdat" | b"wide" | b"free" | b"skip" | b"pnot"
    )
}

fn fourcc_string(code: &[u8]) -> String {
    String::from_utf8_lossy(code).trim().to_string()
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at + 8).map(|b| {
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        u64::from_be_bytes(a)
    })
}

/// Child boxes of an in-memory container box.
fn boxes(mut body: &[u8]) -> Result<Vec<([u8; 4], &[u8])>, IngestError> {
    let mut out = Vec::new();
    while body.len() >= 8 {
        let size32 = be_u32(body, 0).unwrap_or(0) as u64;
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&body[4..8]);
        let (size, header) = match size32 {
            0 => (body.len() as u64, 8),
            1 => (
                be_u64(body, 8).ok_or_else(|| corrupt("truncated 64-bit box size"))?,
                16,
            ),
            n => (n, 8),
        };
        if size < header as u64 || size > body.len() as u64 {
            return Err(corrupt(format!(
                "box '{}' has invalid size {}",
                fourcc_string(&kind),
                size
            )));
        }
        out.push((kind, &body[header..size as usize]));
        body = &body[size as usize..];
    }
    Ok(out)
}

fn probe_mp4<R: Read + Seek>(reader: &mut R, len: u64) -> Result<MediaSummary, IngestError> {
    let mut summary = MediaSummary {
        container: "mp4".to_string(),
        ..Default::default()
    };
    let mut found_moov = false;
    let mut pos: u64 = 0;

    while pos + 8 <= len {
        reader.seek(SeekFrom::Start(pos))?;
        let mut head = [0u8; 8];
        reader.read_exact(&mut head)?;
        let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as u64;
        let kind = [head[4], head[5], head[6], head[7]];
        let (size, header_len) = match size32 {
            0 => (len - pos, 8u64),
            1 => {
                let mut large = [0u8; 8];
                reader
                    .read_exact(&mut large)
                    .map_err(|_| corrupt("truncated 64-bit box size"))?;
                (u64::from_be_bytes(large), 16u64)
            }
            n => (n, 8u64),
        };
        if size < header_len {
            return Err(corrupt(format!(
                "top-level box '{}' has invalid size {}",
                fourcc_string(&kind),
                size
            )));
        }
        let body_len = size - header_len;
        match &kind {
            b"ftyp" => {
                let body = read_body(reader, body_len, "ftyp")?;
                parse_ftyp(&body, &mut summary)?;
            }
            b"moov" => {
                let body = read_body(reader, body_len, "moov")?;
                parse_moov(&body, &mut summary)?;
                found_moov = true;
                break;
            }
            _ => {}
        }
        pos = pos.saturating_add(size);
    }

    if !found_moov {
        return Err(corrupt("no moov box"));
    }
    Ok(summary)
}

fn parse_ftyp(body: &[u8], summary: &mut MediaSummary) -> Result<(), IngestError> {
    if body.len() < 8 {
        return Err(corrupt("ftyp box too short"));
    }
    let major = fourcc_string(&body[..4]);
    if major == "qt" {
        summary.container = "quicktime".to_string();
    }
    summary.major_brand = Some(major);
    summary.compatible_brands = body[8..]
        .chunks_exact(4)
        .map(fourcc_string)
        .filter(|b| !b.is_empty())
        .collect();
    summary.compatible_brands.dedup();
    Ok(())
}

fn parse_moov(body: &[u8], summary: &mut MediaSummary) -> Result<(), IngestError> {
    for (kind, data) in boxes(body)? {
        match &kind {
            b"mvhd" => summary.duration_secs = parse_mvhd(data)?,
            b"trak" => {
                if let Some(track) = parse_trak(data)? {
                    summary.tracks.push(track);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_mvhd(data: &[u8]) -> Result<Option<f64>, IngestError> {
    let version = *data.first().ok_or_else(|| corrupt("empty mvhd"))?;
    let (timescale, duration) = if version == 1 {
        (be_u32(data, 20), be_u64(data, 24))
    } else {
        (be_u32(data, 12), be_u32(data, 16).map(u64::from))
    };
    let (timescale, duration) = match (timescale, duration) {
        (Some(t), Some(d)) => (t, d),
        _ => return Err(corrupt("mvhd box too short")),
    };
    // All-ones duration means "unknown".
    if timescale == 0 || duration == u64::MAX || (version == 0 && duration == u32::MAX as u64) {
        return Ok(None);
    }
    Ok(Some(duration as f64 / timescale as f64))
}

fn parse_trak(data: &[u8]) -> Result<Option<TrackSummary>, IngestError> {
    let children = boxes(data)?;
    let tkhd = match children.iter().find(|(k, _)| k == b"tkhd") {
        Some((_, d)) => *d,
        None => return Ok(None),
    };
    let version = *tkhd.first().ok_or_else(|| corrupt("empty tkhd"))?;
    let (id_at, size_at) = if version == 1 { (20, 88) } else { (12, 76) };
    let id = be_u32(tkhd, id_at).ok_or_else(|| corrupt("tkhd box too short"))?;
    let mut track = TrackSummary::new(id as u64, TrackKind::Other);

    let width = be_u32(tkhd, size_at).map(|w| (w >> 16) as u64);
    let height = be_u32(tkhd, size_at + 4).map(|h| (h >> 16) as u64);

    if let Some((_, mdia)) = children.iter().find(|(k, _)| k == b"mdia") {
        let mdia = boxes(mdia)?;
        if let Some((_, hdlr)) = mdia.iter().find(|(k, _)| k == b"hdlr") {
            track.kind = match hdlr.get(8..12) {
                Some(b"vide") => TrackKind::Video,
                Some(b"soun") => TrackKind::Audio,
                Some(b"sbtl") | Some(b"subt") | Some(b"text") => TrackKind::Subtitle,
                _ => TrackKind::Other,
            };
        }
        if let Some(stsd) = find_path(&mdia, &[b"minf", b"stbl", b"stsd"])? {
            parse_stsd(stsd, &mut track);
        }
    }

    if track.kind == TrackKind::Video {
        track.width = width.filter(|w| *w > 0);
        track.height = height.filter(|h| *h > 0);
    }
    Ok(Some(track))
}

fn find_path<'a>(
    level: &[([u8; 4], &'a [u8])],
    path: &[&[u8; 4]],
) -> Result<Option<&'a [u8]>, IngestError> {
    let (first, rest) = match path.split_first() {
        Some(split) => split,
        None => return Ok(None),
    };
    let data = match level.iter().find(|(k, _)| k == *first) {
        Some((_, d)) => *d,
        None => return Ok(None),
    };
    if rest.is_empty() {
        return Ok(Some(data));
    }
    find_path(&boxes(data)?, rest)
}

fn parse_stsd(stsd: &[u8], track: &mut TrackSummary) {
    // version/flags (4), entry_count (4), then the first sample entry box.
    let entry = match stsd.get(8..) {
        Some(e) if e.len() >= 8 => e,
        _ => return,
    };
    let format = fourcc_string(&entry[4..8]);
    if !format.is_empty() {
        track.codec = Some(format);
    }
    if track.kind == TrackKind::Audio {
        track.channels = be_u16(entry, 24).map(u64::from).filter(|c| *c > 0);
        track.sample_rate = be_u32(entry, 32)
            .map(|r| (r >> 16) as f64)
            .filter(|r| *r > 0.0);
    }
}
