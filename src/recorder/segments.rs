//! Pause/resume support: a paused recording is a series of segment files
//! that are joined into the final output when the recording stops.

use super::{FfmpegLocator, RecordingError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// `<dir>/<stem>.part<NNN><.ext>` next to the final output.
pub fn segment_path(output: &Path, index: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}.part{:03}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}.part{:03}", stem, index),
    };
    output.with_file_name(name)
}

/// Joins finished segments, in order, into one file.
#[async_trait]
pub trait SegmentJoiner: Send + Sync {
    async fn join(&self, segments: &[PathBuf], output: &Path) -> Result<(), RecordingError>;
}

/// Stream-copy concatenation through the ffmpeg concat demuxer.
pub struct FfmpegConcat {
    locator: FfmpegLocator,
}

impl FfmpegConcat {
    pub fn new(locator: FfmpegLocator) -> Self {
        Self { locator }
    }
}

/// Concat demuxer list. Single quotes are closed, escaped and reopened.
fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| {
            let path = p.to_string_lossy().replace('\\', "/").replace('\'', r"'\''");
            format!("file '{}'\n", path)
        })
        .collect()
}

#[async_trait]
impl SegmentJoiner for FfmpegConcat {
    async fn join(&self, segments: &[PathBuf], output: &Path) -> Result<(), RecordingError> {
        let exe = self.locator.locate().ok_or(RecordingError::FfmpegNotFound)?;
        let list = output.with_extension("concat.txt");
        tokio::fs::write(&list, concat_list(segments)).await?;

        log::info!(
            target: "screenrec::segments",
            "Joining {} segments into {}",
            segments.len(),
            output.display()
        );
        let result = Command::new(&exe)
            .args(["-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list)
            .args(["-c", "copy", "-y"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        if let Err(e) = tokio::fs::remove_file(&list).await {
            log::debug!(target: "screenrec::segments", "Could not remove {}: {}", list.display(), e);
        }

        let out = result.map_err(|e| RecordingError::Process(format!("{}: {}", exe.display(), e)))?;
        if !out.status.success() {
            return Err(RecordingError::ProcessExited {
                code: out.status.code(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
