//! ffmpeg / ffprobe child processes for audio and frame extraction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use tokio::process::Command;

use crate::cache::FRAME_EXTENSION;
use crate::error::{Error, IoContext, Result};

const LOSSY_AUDIO_BITRATE: &str = "192k";
const FRAME_PATTERN: &str = "frame_%04d.png";
const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    #[default]
    Mp3,
    Aac,
    Ogg,
    Wav,
}

impl AudioFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Ogg => "ogg",
            Self::Wav => "wav",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Aac => "m4a",
            other => other.as_str(),
        }
    }

    pub fn codec(self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::Aac => "aac",
            Self::Ogg => "libvorbis",
            Self::Wav => "pcm_s16le",
        }
    }

    pub fn is_lossy(self) -> bool {
        !matches!(self, Self::Wav)
    }

    /// Prefix of the `data:` URL handed back to clients.
    pub fn data_url_prefix(self) -> String {
        format!("data:audio/{};base64,", self.as_str())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "aac" | "m4a" => Ok(Self::Aac),
            "ogg" | "vorbis" => Ok(Self::Ogg),
            "wav" => Ok(Self::Wav),
            other => Err(Error::invalid_input(format!(
                "unsupported audio format: {other} (expected mp3, aac, ogg or wav)"
            ))),
        }
    }
}

/// How frames are sampled from the source video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameSampling {
    /// Frames per second of video.
    Rate(f64),
    /// Roughly evenly spaced frames across the whole video.
    Count(u32),
}

impl Default for FrameSampling {
    fn default() -> Self {
        Self::Rate(1.0)
    }
}

impl FrameSampling {
    /// Builds a sampling from the optional request fields. A frame count wins
    /// over a rate when both are present.
    pub fn from_request(frame_count: Option<u32>, frame_rate: Option<f64>) -> Result<Self> {
        match (frame_count, frame_rate) {
            (Some(0), _) => Err(Error::invalid_input("frameCount must be at least 1")),
            (Some(count), _) => Ok(Self::Count(count)),
            (None, Some(rate)) if !rate.is_finite() || rate <= 0.0 => {
                Err(Error::invalid_input("frameRate must be a positive number"))
            }
            (None, Some(rate)) => Ok(Self::Rate(rate)),
            (None, None) => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Transcoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub async fn extract_audio(&self, input: &Path, output: &Path, format: AudioFormat) -> Result<()> {
        let mut command = self.ffmpeg_command(input);
        command.arg("-vn").arg("-acodec").arg(format.codec());
        if format.is_lossy() {
            command.arg("-b:a").arg(LOSSY_AUDIO_BITRATE);
        }
        command.arg(output);

        tracing::info!(input = %input.display(), %format, "extracting audio");
        if let Err(err) = run(command, "ffmpeg").await {
            let _ = tokio::fs::remove_file(output).await;
            return Err(err);
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(Error::Transcode(format!(
                "ffmpeg produced no audio at {}",
                output.display()
            ))),
        }
    }

    /// Writes `frame_0001.png`, `frame_0002.png`, ... into `out_dir` and
    /// returns them sorted.
    pub async fn extract_frames(
        &self,
        input: &Path,
        out_dir: &Path,
        sampling: FrameSampling,
    ) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .io_context(|| format!("creating {}", out_dir.display()))?;

        let mut command = self.ffmpeg_command(input);
        match sampling {
            FrameSampling::Rate(rate) => {
                command.arg("-vf").arg(format!("fps={rate}"));
            }
            FrameSampling::Count(count) => {
                let interval = match self.count_frames(input).await {
                    Some(total) => sampling_interval(total, count),
                    None => 1,
                };
                command
                    .arg("-vf")
                    .arg(format!("select=not(mod(n\\,{interval}))"))
                    .arg("-vsync")
                    .arg("vfr")
                    .arg("-frames:v")
                    .arg(count.to_string());
            }
        }
        command.arg(out_dir.join(FRAME_PATTERN));

        tracing::info!(input = %input.display(), ?sampling, "extracting frames");
        if let Err(err) = run(command, "ffmpeg").await {
            let _ = tokio::fs::remove_dir_all(out_dir).await;
            return Err(err);
        }

        let frames = list_pngs(out_dir).await?;
        if frames.is_empty() {
            return Err(Error::Transcode("ffmpeg produced no frames".into()));
        }
        Ok(frames)
    }

    /// Total number of video frames, or `None` when the probe fails.
    pub async fn count_frames(&self, input: &Path) -> Option<u64> {
        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-count_packets")
            .arg("-show_entries")
            .arg("stream=nb_read_packets")
            .arg("-of")
            .arg("csv=p=0")
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(error = %err, "failed to launch ffprobe");
                return None;
            }
        };
        if !output.status.success() {
            tracing::warn!(
                stderr = %stderr_tail(&output.stderr),
                "ffprobe failed, sampling every frame"
            );
            return None;
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_end_matches(',')
            .parse::<u64>()
            .ok()
            .filter(|total| *total > 0)
    }

    fn ffmpeg_command(&self, input: &Path) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

/// Keeps every `interval`-th frame so roughly `count` frames span the video.
pub fn sampling_interval(total_frames: u64, count: u32) -> u64 {
    let count = u64::from(count.max(1));
    total_frames.div_ceil(count).max(1)
}

async fn run(mut command: Command, program: &str) -> Result<()> {
    let output = command
        .output()
        .await
        .map_err(|err| Error::Transcode(format!("failed to launch {program}: {err}")))?;
    if output.status.success() {
        return Ok(());
    }

    let tail = stderr_tail(&output.stderr);
    tracing::warn!(%program, status = %output.status, stderr = %tail, "transcoder exited unsuccessfully");
    Err(Error::Transcode(format!(
        "{program} exited with {}: {tail}",
        output.status
    )))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

async fn list_pngs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .io_context(|| format!("listing {}", dir.display()))?;
    let mut frames = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .io_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAME_EXTENSION))
        {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}
