//! Per-feature summary stream
//!
//! One JSON object per line (`name`, `outcome`, `message`) for every
//! completed feature, written either to a TCP listener (`tcp://host:port`)
//! or appended to a file (`file:///path`).

use std::path::PathBuf;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::{Error, Result};

use super::feature::Outcome;

/// Outcome label as written to the summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Passed,
    Failed,
    Skipped,
}

/// One line of the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub name: String,
    pub outcome: OutcomeKind,
    #[serde(default)]
    pub message: String,
}

impl SummaryEntry {
    pub fn new(name: impl Into<String>, outcome: &Outcome) -> Self {
        let kind = match outcome {
            Outcome::Passed => OutcomeKind::Passed,
            Outcome::Failed(_) => OutcomeKind::Failed,
            Outcome::Skipped(_) => OutcomeKind::Skipped,
        };
        Self {
            name: name.into(),
            outcome: kind,
            message: outcome.message().to_string(),
        }
    }
}

/// Where summary lines are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryTarget {
    Tcp(String),
    File(PathBuf),
}

impl SummaryTarget {
    /// Select the target from the URI scheme
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| Error::Config(format!("Invalid summary URI '{}': {}", uri, e)))?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::Config(format!("Summary URI '{}' has no host", uri)))?;
                let port = url
                    .port()
                    .ok_or_else(|| Error::Config(format!("Summary URI '{}' has no port", uri)))?;
                Ok(SummaryTarget::Tcp(format!("{}:{}", host, port)))
            }
            "file" => url
                .to_file_path()
                .map(SummaryTarget::File)
                .map_err(|_| Error::Config(format!("Summary URI '{}' is not a file path", uri))),
            other => Err(Error::Config(format!(
                "Unsupported summary URI scheme '{}', expected tcp or file",
                other
            ))),
        }
    }
}

/// Open summary stream
pub struct SummarySink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl SummarySink {
    pub async fn open(target: &SummaryTarget) -> Result<Self> {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = match target {
            SummaryTarget::Tcp(addr) => Box::new(TcpStream::connect(addr).await?),
            SummaryTarget::File(path) => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
        };
        Ok(Self { writer })
    }

    /// Open from a `tcp://` or `file://` URI
    pub async fn connect(uri: &str) -> Result<Self> {
        Self::open(&SummaryTarget::parse(uri)?).await
    }

    /// Write one entry as a JSON line
    pub async fn write(&mut self, entry: &SummaryEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and close the stream
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_entry_serialization() {
        let entry = SummaryEntry::new("update/self", &Outcome::Skipped("too old".to_string()));
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"name":"update/self","outcome":"SKIPPED","message":"too old"}"#
        );

        let entry = SummaryEntry::new("activity/basic", &Outcome::Passed);
        assert_eq!(entry.outcome, OutcomeKind::Passed);
        assert_eq!(entry.message, "");
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            SummaryTarget::parse("tcp://127.0.0.1:4000").unwrap(),
            SummaryTarget::Tcp("127.0.0.1:4000".to_string())
        );
        assert_eq!(
            SummaryTarget::parse("file:///tmp/summary.jsonl").unwrap(),
            SummaryTarget::File(PathBuf::from("/tmp/summary.jsonl"))
        );
        assert!(SummaryTarget::parse("http://example.com").is_err());
        assert!(SummaryTarget::parse("tcp://127.0.0.1").is_err());
    }

    #[tokio::test]
    async fn test_file_sink_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("summary.jsonl");
        let target = SummaryTarget::File(path.clone());

        for outcome in [Outcome::Passed, Outcome::Failed("boom".to_string())] {
            let mut sink = SummarySink::open(&target).await.unwrap();
            sink.write(&SummaryEntry::new("a/b", &outcome)).await.unwrap();
            sink.close().await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<SummaryEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].outcome, OutcomeKind::Failed);
        assert_eq!(entries[1].message, "boom");
    }

    #[tokio::test]
    async fn test_tcp_sink_streams_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());

        let reader = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut out = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                out.push(line);
            }
            out
        });

        let mut sink = SummarySink::connect(&uri).await.unwrap();
        sink.write(&SummaryEntry::new("x/y", &Outcome::Passed))
            .await
            .unwrap();
        sink.close().await.unwrap();

        let lines = reader.await.unwrap();
        assert_eq!(lines.len(), 1);
        let entry: SummaryEntry = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(entry.name, "x/y");
    }
}
