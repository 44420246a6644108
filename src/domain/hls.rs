//! HLS transcode profile.
//!
//! Produces the command line handed to the transcoder. Orchestration treats
//! the result as opaque: a program, its arguments and a working directory.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// One output variant of the multi-bitrate ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    /// Output frame size. `None` keeps the source size.
    pub size: Option<(u32, u32)>,
    /// Constant video bitrate, e.g. "5M"
    pub video_bitrate: &'static str,
    /// Video rate-control buffer, e.g. "10M"
    pub buffer_size: &'static str,
    /// AAC audio bitrate, e.g. "96k"
    pub audio_bitrate: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsProfile {
    pub program: String,
    pub segment_seconds: u32,
    pub renditions: Vec<Rendition>,
}

impl Default for HlsProfile {
    fn default() -> Self {
        Self::new("ffmpeg", 2)
    }
}

impl HlsProfile {
    /// Standard three-rung ladder: source size, 720p and 360p.
    pub fn new(program: impl Into<String>, segment_seconds: u32) -> Self {
        Self {
            program: program.into(),
            segment_seconds,
            renditions: vec![
                Rendition {
                    size: None,
                    video_bitrate: "5M",
                    buffer_size: "10M",
                    audio_bitrate: "96k",
                },
                Rendition {
                    size: Some((1280, 720)),
                    video_bitrate: "3M",
                    buffer_size: "3M",
                    audio_bitrate: "96k",
                },
                Rendition {
                    size: Some((640, 360)),
                    video_bitrate: "1M",
                    buffer_size: "1M",
                    audio_bitrate: "48k",
                },
            ],
        }
    }

    /// Build the command that transcodes `input` into segments and manifests
    /// under `output_dir`.
    pub fn command(&self, input: &Path, output_dir: &Path) -> TranscodeCommand {
        let mut args: Vec<String> = vec!["-y".into(), "-i".into(), path_arg(input)];

        args.push("-filter_complex".into());
        args.push(self.filter_graph());

        for (i, rendition) in self.renditions.iter().enumerate() {
            args.push("-map".into());
            args.push(format!("[v{}out]", i + 1));
            args.extend(
                [
                    format!("-c:v:{i}"),
                    "libx264".into(),
                    "-x264-params".into(),
                    "nal-hrd=cbr:force-cfr=1".into(),
                    format!("-b:v:{i}"),
                    rendition.video_bitrate.into(),
                    format!("-maxrate:v:{i}"),
                    rendition.video_bitrate.into(),
                    format!("-minrate:v:{i}"),
                    rendition.video_bitrate.into(),
                    format!("-bufsize:v:{i}"),
                    rendition.buffer_size.into(),
                    "-preset".into(),
                    "slow".into(),
                    "-g".into(),
                    "48".into(),
                    "-sc_threshold".into(),
                    "0".into(),
                    "-keyint_min".into(),
                    "48".into(),
                ],
            );
        }

        for (i, rendition) in self.renditions.iter().enumerate() {
            args.extend(
                [
                    String::from("-map"),
                    "a:0".into(),
                    format!("-c:a:{i}"),
                    "aac".into(),
                    format!("-b:a:{i}"),
                    rendition.audio_bitrate.into(),
                    "-ac".into(),
                    "2".into(),
                ],
            );
        }

        args.extend(
            [
                String::from("-f"),
                "hls".into(),
                "-hls_time".into(),
                self.segment_seconds.to_string(),
                "-hls_playlist_type".into(),
                "vod".into(),
                "-hls_flags".into(),
                "independent_segments".into(),
                "-hls_segment_type".into(),
                "mpegts".into(),
                "-hls_segment_filename".into(),
                path_arg(&output_dir.join("%v").join("data%02d.ts")),
                "-master_pl_name".into(),
                "manifest_master.m3u8".into(),
                "-var_stream_map".into(),
                self.var_stream_map(),
                path_arg(&output_dir.join("manifest_%v.m3u8")),
            ],
        );

        TranscodeCommand {
            program: self.program.clone(),
            args,
            working_dir: output_dir.to_path_buf(),
        }
    }

    fn filter_graph(&self) -> String {
        let count = self.renditions.len();
        let labels: String = (1..=count).map(|i| format!("[v{i}]")).collect();
        let mut graph = format!("[0:v]split={count}{labels}");
        for (i, rendition) in self.renditions.iter().enumerate() {
            let n = i + 1;
            match rendition.size {
                None => graph.push_str(&format!("; [v{n}]copy[v{n}out]")),
                Some((w, h)) => graph.push_str(&format!("; [v{n}]scale=w={w}:h={h}[v{n}out]")),
            }
        }
        graph
    }

    fn var_stream_map(&self) -> String {
        (0..self.renditions.len())
            .map(|i| format!("v:{i},a:{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
