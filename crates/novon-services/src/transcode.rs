//! Segment transcoding through external ffmpeg/ffprobe processes.
//!
//! Every operation pipes one MPEG-TS segment into the tool's stdin and
//! collects stdout.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use novon_core::config::TranscodeProfile;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Video properties of the incoming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub codec: String,
    pub width: u32,
    /// Vertical resolution, e.g. 1080.
    pub resolution: u32,
    pub framerate: u32,
}

impl SourceInfo {
    pub fn as_profile(&self) -> TranscodeProfile {
        TranscodeProfile {
            resolution: self.resolution,
            framerate: self.framerate,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unreadable probe output: {0}")]
    Probe(String),
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn probe(&self, segment: Bytes) -> Result<SourceInfo, TranscodeError>;

    /// Re-encode `segment` at `profile`.
    async fn transcode(&self, profile: TranscodeProfile, segment: Bytes) -> Result<Bytes, TranscodeError>;

    /// Single-frame still image of `segment`.
    async fn thumbnail(&self, segment: Bytes) -> Result<Bytes, TranscodeError>;
}

/// Profiles strictly below the source resolution, highest first.
pub fn select_profiles(configured: &[TranscodeProfile], source: &SourceInfo) -> Vec<TranscodeProfile> {
    let mut selected: Vec<TranscodeProfile> = configured
        .iter()
        .copied()
        .filter(|p| p.resolution < source.resolution)
        .collect();
    selected.sort_by(|a, b| b.resolution.cmp(&a.resolution));
    selected.dedup();
    selected
}

// ── ffmpeg ────────────────────────────────────────────────────────────────────

pub const THUMBNAIL_WIDTH: u32 = 256;
pub const THUMBNAIL_HEIGHT: u32 = 144;

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// True if `ffmpeg -version` runs.
    pub async fn is_installed(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn transcode_args(profile: TranscodeProfile) -> Vec<String> {
        [
            "-hwaccel", "auto", "-i", "-", "-c:v", "libx264", "-crf", "30", "-preset", "ultrafast",
            "-acodec", "copy", "-filter:v",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            format!("scale=-2:{},fps={}", profile.resolution, profile.framerate),
            "-copyts".to_string(),
            "-f".to_string(),
            "mpegts".to_string(),
            "-".to_string(),
        ])
        .collect()
    }

    fn thumbnail_args() -> Vec<String> {
        vec![
            "-i".into(),
            "-".into(),
            "-vframes".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={THUMBNAIL_WIDTH}:{THUMBNAIL_HEIGHT}"),
            "-f".into(),
            "image2pipe".into(),
            "-".into(),
        ]
    }
}

/// Run `program args`, feed `input` on stdin, return stdout.
async fn pipe_through(
    tool: &'static str,
    program: &str,
    args: &[String],
    input: Bytes,
) -> Result<Bytes, TranscodeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TranscodeError::Spawn { tool, source })?;

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(tool, error = %e, "stdin closed early");
            }
        });
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| TranscodeError::Spawn { tool, source })?;
    if !output.status.success() {
        return Err(TranscodeError::Failed {
            tool,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(Bytes::from(output.stdout))
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

/// Extract the first video stream from `ffprobe -print_format json` output.
pub fn parse_probe(json: &[u8]) -> Result<SourceInfo, TranscodeError> {
    let out: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| TranscodeError::Probe(e.to_string()))?;
    let video = out
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| TranscodeError::Probe("no video stream".into()))?;

    // "30/1", "30000/1001"
    let framerate = video
        .r_frame_rate
        .as_deref()
        .and_then(|r| {
            let (num, den) = r.split_once('/').unwrap_or((r, "1"));
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den > 0.0).then(|| (num / den).round() as u32)
        })
        .unwrap_or(0);

    Ok(SourceInfo {
        codec: video.codec_name.unwrap_or_default(),
        width: video.width.unwrap_or(0),
        resolution: video.height.unwrap_or(0),
        framerate,
    })
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, segment: Bytes) -> Result<SourceInfo, TranscodeError> {
        let args: Vec<String> = [
            "-v", "quiet", "-print_format", "json", "-show_format", "-show_streams", "-i", "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let out = pipe_through("ffprobe", &self.ffprobe, &args, segment).await?;
        parse_probe(&out)
    }

    async fn transcode(&self, profile: TranscodeProfile, segment: Bytes) -> Result<Bytes, TranscodeError> {
        pipe_through("ffmpeg", &self.ffmpeg, &Self::transcode_args(profile), segment).await
    }

    async fn thumbnail(&self, segment: Bytes) -> Result<Bytes, TranscodeError> {
        pipe_through("ffmpeg", &self.ffmpeg, &Self::thumbnail_args(), segment).await
    }
}
