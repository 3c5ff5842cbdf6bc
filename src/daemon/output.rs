use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter, Stdout};

use crate::producer::{DumpReport, PullRequest};

/// A record written to the output stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord<'a> {
    PullRequest(&'a PullRequest),
    Report(&'a DumpReport),
}

/// JSON-lines writer for pull requests and reports.
pub enum Output {
    Stdout(BufWriter<Stdout>),
    File(BufWriter<File>),
    /// Collects lines in memory.
    Buffer(Vec<u8>),
}

impl Output {
    /// Opens `path` for appending, or stdout for "-".
    pub async fn open(path: &str) -> Result<Self> {
        if path == "-" {
            return Ok(Self::Stdout(BufWriter::new(tokio::io::stdout())));
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Path::new(path))
            .await
            .with_context(|| format!("opening output file {path}"))?;

        Ok(Self::File(BufWriter::new(file)))
    }

    pub fn buffer() -> Self {
        Self::Buffer(Vec::new())
    }

    /// Returns the sink name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdout(_) => "stdout",
            Self::File(_) => "file",
            Self::Buffer(_) => "buffer",
        }
    }

    /// Serializes and writes one record followed by a newline.
    pub async fn write(&mut self, record: &OutputRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("serializing output record")?;
        line.push(b'\n');

        match self {
            Self::Stdout(w) => w.write_all(&line).await?,
            Self::File(w) => w.write_all(&line).await?,
            Self::Buffer(b) => b.extend_from_slice(&line),
        }

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Stdout(w) => w.flush().await?,
            Self::File(w) => w.flush().await?,
            Self::Buffer(_) => {}
        }

        Ok(())
    }

    /// Lines written so far, for the in-memory sink.
    pub fn buffered_lines(&self) -> Vec<&str> {
        match self {
            Self::Buffer(b) => std::str::from_utf8(b)
                .map(|s| s.lines().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}
