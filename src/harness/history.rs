//! Versioned history fixtures and replay verification
//!
//! Each feature may bundle `history/history.<sdk>.<version>.json` files under
//! its fixture namespace. A file holds a JSON array of execution histories
//! recorded by that SDK version. Every history from a version not newer than
//! the current SDK must still replay against today's workflow code.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::sdk::{Worker, WorkflowExecutionHistory};

use super::version::Version;

/// A fixture file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureFile {
    pub version: Version,
    pub path: PathBuf,
}

/// Histories grouped by the SDK version that recorded them
pub type PastHistories = BTreeMap<Version, Vec<WorkflowExecutionHistory>>;

/// The fixture namespace of one feature for one SDK
#[derive(Debug, Clone)]
pub struct FixtureStore {
    dir: PathBuf,
    sdk: String,
}

impl FixtureStore {
    /// Store rooted at `<fixtures_root>/<feature_dir>/history`
    pub fn for_feature(fixtures_root: &Path, feature_dir: &str, sdk: &str) -> Self {
        let mut dir = fixtures_root.to_path_buf();
        for segment in feature_dir.split('/').filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        dir.push("history");
        Self::new(dir, sdk)
    }

    pub fn new(dir: impl Into<PathBuf>, sdk: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            sdk: sdk.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn prefix(&self) -> String {
        format!("history.{}.", self.sdk)
    }

    /// File name used for a version
    pub fn file_name(&self, version: &str) -> String {
        format!("{}{}.json", self.prefix(), version)
    }

    /// Parse the version out of a fixture file name, `None` if the file
    /// belongs to another SDK or is not a fixture
    fn version_of(&self, path: &Path) -> Result<Option<Version>> {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return Ok(None),
        };
        let prefix = self.prefix();
        let raw = match name
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_suffix(".json"))
        {
            Some(raw) => raw,
            None => return Ok(None),
        };
        Version::parse(raw)
            .map(Some)
            .map_err(|e| Error::invalid_fixture(path, format!("has invalid version: {}", e)))
    }

    /// Enumerate this SDK's fixture files, sorted by version
    ///
    /// A missing directory simply has no fixtures.
    pub fn discover(&self) -> Result<Vec<FixtureFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(version) = self.version_of(&path)? {
                files.push(FixtureFile { version, path });
            }
        }
        files.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(files)
    }

    /// Read one fixture file
    pub fn read(path: &Path) -> Result<Vec<WorkflowExecutionHistory>> {
        let content = fs::read_to_string(path).map_err(|e| Error::invalid_fixture(path, e))?;
        let raw: Vec<serde_json::Value> = serde_json::from_str(&content)
            .map_err(|e| Error::invalid_fixture(path, format!("has invalid JSON: {}", e)))?;
        raw.into_iter()
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|e| Error::invalid_fixture(path, format!("has invalid history: {}", e)))
            })
            .collect()
    }

    /// Load every fixture recorded by a version `<= current`
    ///
    /// Newer fixtures are ignored without being read.
    pub fn load_up_to(&self, current: &Version) -> Result<PastHistories> {
        let mut past = PastHistories::new();
        for file in self.discover()? {
            if file.version > *current {
                tracing::debug!(
                    "Ignoring history {} from newer version {}",
                    file.path.display(),
                    file.version
                );
                continue;
            }
            let histories = Self::read(&file.path)?;
            // Suffixes are not kept, so "1.0.0-a" and "1.0.0-b" share a key
            past.entry(file.version).or_default().extend(histories);
        }
        Ok(past)
    }

    /// Write histories as the fixture for a version, replacing any existing file
    pub fn store(&self, version: &str, histories: &[WorkflowExecutionHistory]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(self.file_name(version));
        let json = serde_json::to_string_pretty(histories)?;
        fs::write(&path, json)?;
        tracing::info!("Stored history fixture {}", path.display());
        Ok(path)
    }
}

/// Replays histories through a worker
pub struct HistoryVerifier<'a> {
    worker: &'a dyn Worker,
}

impl<'a> HistoryVerifier<'a> {
    pub fn new(worker: &'a dyn Worker) -> Self {
        Self { worker }
    }

    /// The history just produced must replay cleanly
    pub async fn verify_current(&self, history: &WorkflowExecutionHistory) -> Result<()> {
        tracing::info!("Checking current history");
        self.worker
            .replay(history)
            .await
            .map_err(|e| Error::replay(None, e))
    }

    /// Every recorded history must replay; the first failure names its version
    pub async fn verify_past(&self, past: &PastHistories) -> Result<()> {
        for (version, histories) in past {
            tracing::info!("Checking history for version {}", version);
            for history in histories {
                self.worker
                    .replay(history)
                    .await
                    .map_err(|e| Error::replay(Some(*version), e))?;
            }
        }
        Ok(())
    }
}
