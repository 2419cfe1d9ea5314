//! Shared fixtures: synthetic WebM files and throwaway configurations.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};

const HEADER: u32 = 0x1A45_DFA3;
const DOC_TYPE: u32 = 0x4282;
const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const TRACKS: u32 = 0x1654_AE6B;
const CLUSTER: u32 = 0x1F43_B675;
const TIMECODE_SCALE: u32 = 0x2A_D7B1;
const DURATION: u32 = 0x4489;
const MUXING_APP: u32 = 0x4D80;
const WRITING_APP: u32 = 0x5741;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const VIDEO: u32 = 0xE0;
const PIXEL_WIDTH: u32 = 0xB0;
const PIXEL_HEIGHT: u32 = 0xBA;
const AUDIO: u32 = 0xE1;
const SAMPLING_FREQUENCY: u32 = 0xB5;
const CHANNELS: u32 = 0x9F;

fn id_bytes(id: u32) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// EBML element with an 8-byte size field.
fn el(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = id_bytes(id);
    out.push(0x01);
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes()[1..]);
    out.extend_from_slice(payload);
    out
}

fn uint(id: u32, v: u64) -> Vec<u8> {
    el(id, &v.to_be_bytes())
}

/// A WebM file of exactly `total_len` bytes (padded in the first cluster)
/// with a VP8 video track and an Opus audio track. `seed` varies the
/// cluster payload so different seeds give different content hashes.
pub fn webm_file(total_len: usize, seed: u8) -> Vec<u8> {
    let header = el(HEADER, &el(DOC_TYPE, b"webm"));
    let info = el(
        INFO,
        &[
            uint(TIMECODE_SCALE, 1_000_000),
            el(DURATION, &12_500.0f64.to_be_bytes()),
            el(MUXING_APP, b"vidgraph-tests"),
            el(WRITING_APP, b"vidgraph-tests"),
        ]
        .concat(),
    );
    let video = el(
        TRACK_ENTRY,
        &[
            uint(TRACK_NUMBER, 1),
            uint(TRACK_TYPE, 1),
            el(CODEC_ID, b"V_VP8"),
            el(VIDEO, &[uint(PIXEL_WIDTH, 1280), uint(PIXEL_HEIGHT, 720)].concat()),
        ]
        .concat(),
    );
    let audio = el(
        TRACK_ENTRY,
        &[
            uint(TRACK_NUMBER, 2),
            uint(TRACK_TYPE, 2),
            el(CODEC_ID, b"A_OPUS"),
            el(
                AUDIO,
                &[
                    el(SAMPLING_FREQUENCY, &48000.0f32.to_be_bytes()),
                    uint(CHANNELS, 2),
                ]
                .concat(),
            ),
        ]
        .concat(),
    );
    let tracks = el(TRACKS, &[video, audio].concat());

    // header + segment(id 4, size 8) + info + tracks + cluster(id 4, size 8)
    let fixed = header.len() + 12 + info.len() + tracks.len() + 12;
    let padding = total_len.saturating_sub(fixed);
    let payload: Vec<u8> = (0..padding)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    let cluster = el(CLUSTER, &payload);

    let segment = el(SEGMENT, &[info, tracks, cluster].concat());
    [header, segment].concat()
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// `data` as a stream of 64 KiB chunks.
pub fn chunked(data: &[u8]) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    let chunks: Vec<Result<Bytes, std::io::Error>> = data
        .chunks(64 * 1024)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks)
}

/// Write a config rooted in `dir`. `extra` is appended verbatim and may
/// add sections such as `[server]` or `[retry]`.
pub fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let config_dir = dir.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let path = config_dir.join("vidgraph.toml");
    let content = format!(
        r#"[db]
path = "{db}"

[storage]
root = "{storage}"

{extra}
"#,
        db = dir.join("data").join("vidgraph.sqlite").display(),
        storage = dir.join("data").join("uploads").display(),
        extra = extra,
    );
    fs::write(&path, content).unwrap();
    path
}

/// Number of staged objects under a storage root.
pub fn object_count(storage_root: &Path) -> usize {
    let objects = storage_root.join("objects");
    let Ok(prefixes) = fs::read_dir(&objects) else {
        return 0;
    };
    prefixes
        .filter_map(|p| p.ok())
        .filter_map(|p| fs::read_dir(p.path()).ok())
        .map(|entries| entries.count())
        .sum()
}
