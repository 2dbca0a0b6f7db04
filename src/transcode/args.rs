//! FFmpeg argument assembly.
//!
//! Global options always precede the input specification; `-ss` sits
//! before `-i` so FFmpeg seeks on the input side (cheap for seekable
//! inputs, decode-discard for pipes). HTTP inputs get `-reconnect` and
//! `-reconnect_streamed` but never `-reconnect_at_eof`: the engine's
//! range endpoint closes at the download boundary and `-reconnect_at_eof`
//! would restart the stream from byte zero, silently destroying the seek
//! offset.

use crate::config::EncodingProfile;
use crate::job::job::VariantInfo;
use crate::probe::ProbeResult;
use std::path::{Path, PathBuf};

/// Probe windows: generous for seekable inputs, FFmpeg defaults for pipes
/// to keep startup latency down.
const ANALYZE_SEEKABLE_US: &str = "20000000";
const ANALYZE_PIPE_US: &str = "5000000";
const PROBESIZE_SEEKABLE: &str = "10000000";
const PROBESIZE_PIPE: &str = "5000000";

/// Quality ladder candidates, lowest first.
pub const VARIANT_LADDER: [u32; 3] = [480, 720, 1080];

/// Bitrate assigned to a non-top ladder rung.
fn variant_bitrate_kbps(height: u32) -> u32 {
    match height {
        h if h >= 1080 => 6000,
        h if h >= 720 => 3500,
        _ => 1800,
    }
}

/// Ceiling applied to the CRF-encoded top rung, capping HEVC-source
/// bitrate runaway.
fn top_rung_maxrate_kbps(height: u32) -> u32 {
    match height {
        h if h >= 1080 => 8000,
        h if h >= 720 => 4500,
        _ => 2200,
    }
}

/// Build the quality ladder for a source of the given height: candidate
/// heights not exceeding the source, highest first. Fewer than two rungs
/// means adaptive streaming is not worth the split.
pub fn variant_ladder(source_height: u32) -> Vec<VariantInfo> {
    let heights: Vec<u32> = VARIANT_LADDER
        .iter()
        .rev()
        .copied()
        .filter(|h| *h <= source_height)
        .collect();
    if heights.len() < 2 {
        return Vec::new();
    }
    heights
        .into_iter()
        .enumerate()
        .map(|(index, height)| VariantInfo { index, height })
        .collect()
}

/// How the transcoder encodes this job.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingMode {
    /// H.264 source on local disk, no subtitle burn: mux without
    /// re-encoding video. Audio is copied only when it is already AAC.
    StreamCopy { copy_audio: bool },
    /// Adaptive ladder behind a master playlist.
    MultiVariant { variants: Vec<VariantInfo> },
    /// Plain single-rendition libx264 encode.
    Single,
}

impl EncodingMode {
    pub fn is_multi_variant(&self) -> bool {
        matches!(self, EncodingMode::MultiVariant { .. })
    }

    pub fn variants(&self) -> &[VariantInfo] {
        match self {
            EncodingMode::MultiVariant { variants } => variants,
            _ => &[],
        }
    }
}

/// Pick the encoding mode from source placement and probe results.
pub fn choose_mode(
    local_file: bool,
    burn_subtitles: bool,
    probe: Option<&ProbeResult>,
) -> EncodingMode {
    if let Some(probe) = probe {
        if local_file && !burn_subtitles && probe.flags.is_h264 {
            return EncodingMode::StreamCopy {
                copy_audio: probe.flags.is_aac_audio,
            };
        }
        if probe.info.height > 0 {
            let variants = variant_ladder(probe.info.height);
            if !variants.is_empty() {
                return EncodingMode::MultiVariant { variants };
            }
        }
    }
    EncodingMode::Single
}

/// Subtitle burn request: a seekable source file plus the stream index.
#[derive(Debug, Clone)]
pub struct SubtitleBurn {
    pub source: PathBuf,
    pub stream_index: i32,
}

/// Everything needed to render the argument vector.
pub struct TranscodeSpec<'a> {
    pub input_spec: String,
    pub seekable: bool,
    pub http: bool,
    pub seek_seconds: f64,
    pub audio_track: i32,
    pub subtitle: Option<SubtitleBurn>,
    pub mode: &'a EncodingMode,
    pub profile: &'a EncodingProfile,
    pub job_dir: &'a Path,
}

/// Escape a path for use inside an FFmpeg filter argument.
fn escape_filter_path(path: &Path) -> String {
    let mut out = String::new();
    for c in path.to_string_lossy().chars() {
        if matches!(c, '\\' | ':' | '\'' | '[' | ']' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn subtitles_filter(burn: &SubtitleBurn) -> String {
    format!(
        "subtitles='{}':si={}",
        escape_filter_path(&burn.source),
        burn.stream_index
    )
}

/// Top-level playlist path for a job directory.
pub fn playlist_path(job_dir: &Path, multi_variant: bool) -> PathBuf {
    if multi_variant {
        job_dir.join("master.m3u8")
    } else {
        job_dir.join("index.m3u8")
    }
}

/// Render the canonical argument vector.
pub fn build_args(spec: &TranscodeSpec) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(48);
    let push = |args: &mut Vec<String>, items: &[&str]| {
        args.extend(items.iter().map(|s| s.to_string()));
    };

    // Global options, always ahead of any input.
    push(
        &mut args,
        &["-hide_banner", "-loglevel", "error", "-progress", "pipe:1"],
    );
    push(
        &mut args,
        &[
            "-fflags",
            "+genpts+discardcorrupt",
            "-err_detect",
            "ignore_err",
        ],
    );
    let (analyze, probesize) = if spec.seekable {
        (ANALYZE_SEEKABLE_US, PROBESIZE_SEEKABLE)
    } else {
        (ANALYZE_PIPE_US, PROBESIZE_PIPE)
    };
    push(&mut args, &["-analyzeduration", analyze, "-probesize", probesize]);
    push(&mut args, &["-avoid_negative_ts", "make_zero"]);

    // Input-side seek precedes -i.
    if spec.seek_seconds > 0.0 {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", spec.seek_seconds));
    }
    if spec.http {
        push(&mut args, &["-reconnect", "1", "-reconnect_streamed", "1"]);
    }
    args.push("-i".to_string());
    args.push(spec.input_spec.clone());

    let audio_map = format!("0:a:{}?", spec.audio_track.max(0));
    let audio_bitrate = format!("{}k", spec.profile.audio_bitrate_kbps);

    match spec.mode {
        EncodingMode::StreamCopy { copy_audio } => {
            push(&mut args, &["-map", "0:v:0", "-map", &audio_map]);
            push(&mut args, &["-c:v", "copy"]);
            if *copy_audio {
                push(&mut args, &["-c:a", "copy"]);
            } else {
                push(&mut args, &["-c:a", "aac", "-b:a", &audio_bitrate]);
            }
        }
        EncodingMode::MultiVariant { variants } => {
            args.push("-filter_complex".to_string());
            args.push(variant_filter(variants, spec.subtitle.as_ref()));
            for variant in variants {
                args.push("-map".to_string());
                args.push(format!("[{}out]", variant.name()));
                push(&mut args, &["-map", &audio_map]);
            }
            push(&mut args, &["-c:v", "libx264", "-preset", &spec.profile.preset]);
            for variant in variants {
                if variant.index == 0 {
                    // Top rung: CRF with a hard ceiling.
                    let maxrate = top_rung_maxrate_kbps(variant.height);
                    args.push(format!("-crf:v:{}", variant.index));
                    args.push(spec.profile.crf.to_string());
                    args.push(format!("-maxrate:v:{}", variant.index));
                    args.push(format!("{maxrate}k"));
                    args.push(format!("-bufsize:v:{}", variant.index));
                    args.push(format!("{}k", maxrate * 2));
                } else {
                    args.push(format!("-b:v:{}", variant.index));
                    args.push(format!("{}k", variant_bitrate_kbps(variant.height)));
                }
            }
            push(&mut args, &["-c:a", "aac", "-b:a", &audio_bitrate]);
            args.push("-var_stream_map".to_string());
            args.push(
                variants
                    .iter()
                    .map(|v| format!("v:{i},a:{i}", i = v.index))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            push(&mut args, &["-master_pl_name", "master.m3u8"]);
        }
        EncodingMode::Single => {
            push(&mut args, &["-map", "0:v:0", "-map", &audio_map]);
            push(
                &mut args,
                &["-c:v", "libx264", "-preset", &spec.profile.preset],
            );
            args.push("-crf".to_string());
            args.push(spec.profile.crf.to_string());
            if let Some(burn) = &spec.subtitle {
                args.push("-vf".to_string());
                args.push(subtitles_filter(burn));
            }
            push(&mut args, &["-c:a", "aac", "-b:a", &audio_bitrate]);
        }
    }

    // HLS muxer: always an event playlist so playback can start before
    // the encode finishes.
    push(
        &mut args,
        &["-f", "hls", "-hls_time", &spec.profile.segment_duration_secs.to_string()],
    );
    push(&mut args, &["-hls_list_size", "0"]);
    push(&mut args, &["-hls_playlist_type", "event"]);
    push(
        &mut args,
        &["-hls_flags", "append_list+independent_segments"],
    );

    let dir = spec.job_dir.to_string_lossy();
    if spec.mode.is_multi_variant() {
        args.push("-hls_segment_filename".to_string());
        args.push(format!("{dir}/v%v/seg-%05d.ts"));
        args.push(format!("{dir}/v%v/index.m3u8"));
    } else {
        args.push("-hls_segment_filename".to_string());
        args.push(format!("{dir}/seg-%05d.ts"));
        args.push(format!("{dir}/index.m3u8"));
    }

    args
}

/// Build the `filter_complex` for the variant ladder: optional subtitle
/// burn, then a split feeding one scaler per rung.
fn variant_filter(variants: &[VariantInfo], subtitle: Option<&SubtitleBurn>) -> String {
    let split_labels: Vec<String> = variants.iter().map(|v| format!("[t{}]", v.index)).collect();
    let mut chains = Vec::with_capacity(variants.len() + 1);
    match subtitle {
        Some(burn) => chains.push(format!(
            "[0:v]{},split={}{}",
            subtitles_filter(burn),
            variants.len(),
            split_labels.join("")
        )),
        None => chains.push(format!(
            "[0:v]split={}{}",
            variants.len(),
            split_labels.join("")
        )),
    }
    for variant in variants {
        chains.push(format!(
            "[t{i}]scale=-2:{h}[v{i}out]",
            i = variant.index,
            h = variant.height
        ));
    }
    chains.join(";")
}
