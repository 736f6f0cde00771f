//! Ingest side: the external RTMP server process and the segment directory
//! it writes into.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};

use novon_services::Streamer;

pub const SEGMENT_EXTENSION: &str = "ts";

// ── Segment directory ─────────────────────────────────────────────────────────

/// Picks up finished segments from a directory, oldest name first.
pub struct SegmentWatcher {
    dir: PathBuf,
    poll: Duration,
    /// A file must be untouched this long before it is considered finished.
    settle: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl SegmentWatcher {
    pub fn new(dir: PathBuf, poll: Duration, settle: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            dir,
            poll,
            settle,
            shutdown,
        }
    }

    pub async fn run(mut self, streamer: Arc<Streamer>) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::error!(dir = %self.dir.display(), error = %e, "segment directory unavailable");
            return;
        }
        tracing::info!(dir = %self.dir.display(), "watching for segments");

        let mut interval = tokio::time::interval(self.poll);
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("segment watcher shutting down");
                    return;
                }
                _ = interval.tick() => {
                    for path in finished_segments(&self.dir, self.settle, SystemTime::now()).await {
                        match take_segment(&path).await {
                            Ok(data) => {
                                tracing::debug!(path = %path.display(), bytes = data.len(), "segment ready");
                                streamer.on_segment(data);
                            }
                            Err(e) => tracing::warn!(path = %path.display(), error = %e, "segment unreadable"),
                        }
                    }
                }
            }
        }
    }
}

/// `.ts` files in `dir` last modified at least `settle` before `now`,
/// sorted by file name.
pub async fn finished_segments(dir: &Path, settle: Duration, now: SystemTime) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let settled = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .is_some_and(|age| age >= settle);
        if meta.is_file() && settled {
            out.push(path);
        }
    }
    out.sort();
    out
}

/// Read a segment and remove it from disk.
async fn take_segment(path: &Path) -> std::io::Result<Bytes> {
    let data = tokio::fs::read(path).await?;
    tokio::fs::remove_file(path).await?;
    Ok(Bytes::from(data))
}

// ── Ingest server process ─────────────────────────────────────────────────────

/// Start the ingest server. Every stdout and stderr line is forwarded to
/// `lines` for log scanning.
pub fn spawn_ingest(command: &[String], lines: mpsc::Sender<String>) -> Result<Child> {
    let (program, args) = command
        .split_first()
        .context("ingest command is empty")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start ingest server {program}"))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(BufReader::new(stdout), lines.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(BufReader::new(stderr), lines));
    }
    tracing::info!(program = %program, pid = child.id(), "ingest server started");
    Ok(child)
}

async fn forward_lines<R>(reader: BufReader<R>, lines: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = reader.lines();
    while let Ok(Some(line)) = reader.next_line().await {
        tracing::trace!(target: "ingest", "{line}");
        if lines.send(line).await.is_err() {
            return;
        }
    }
}
