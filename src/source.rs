//! Content source: where source records come from.
//!
//! The baker only ever talks to a [`ContentSource`]. The CMS database, a
//! REST export or a directory of JSON files are all equally valid behind
//! it. [`DirectorySource`] is the filesystem implementation used by the CLI.
//!
//! ## Directory Layout
//!
//! ```text
//! content/
//! ├── posts/
//! │   └── co2-emissions.json        # {"payload": {...}}
//! ├── charts/
//! │   └── life-expectancy.json      # {"version": 12, "payload": {"dimensions": [...]}}
//! ├── pages/
//! │   ├── index.json
//! │   └── headerMenu.json.json      # id "headerMenu.json" → written verbatim
//! ├── redirects/_redirects.json
//! ├── feeds/atom.xml.json
//! └── sitemaps/sitemap.xml.json
//! ```
//!
//! Each file is `{"id"?, "version"?, "payload"?}`:
//! - missing `id` → the file stem
//! - missing `version` → SHA-256 of the payload
//! - a numeric `version` is kept as its decimal string
//!
//! A missing kind directory simply has no records. An unreadable directory
//! or a malformed record file is an error: the baker cannot know what the
//! site should contain, so it must not bake (or delete) anything.

use crate::cache::hash_payload;
use crate::types::{ArtifactKind, SourceRecord, Version};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed record {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No {0} record with id '{1}'")]
    NotFound(ArtifactKind, String),
}

/// Collaborator interface consumed by the baker.
pub trait ContentSource: Send + Sync {
    /// All current records of one kind.
    fn list_records(&self, kind: ArtifactKind) -> Result<Vec<SourceRecord>, SourceError>;

    /// A single record by id.
    fn get_record(&self, kind: ArtifactKind, id: &str) -> Result<SourceRecord, SourceError> {
        self.list_records(kind)?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| SourceError::NotFound(kind, id.to_string()))
    }
}

/// Directory name holding records of each kind.
pub fn kind_dir(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Post => "posts",
        ArtifactKind::Chart => "charts",
        ArtifactKind::SpecialPage => "pages",
        ArtifactKind::RedirectSet => "redirects",
        ArtifactKind::Feed => "feeds",
        ArtifactKind::Sitemap => "sitemaps",
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordFile {
    id: Option<String>,
    version: Option<RawVersion>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u64),
    Text(String),
}

impl From<RawVersion> for Version {
    fn from(raw: RawVersion) -> Self {
        match raw {
            RawVersion::Number(n) => Version::from(n),
            RawVersion::Text(s) => Version(s),
        }
    }
}

/// Reads records from `<root>/<kind-dir>/*.json`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_record(&self, kind: ArtifactKind, path: &Path) -> Result<SourceRecord, SourceError> {
        let content = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: RecordFile =
            serde_json::from_str(&content).map_err(|source| SourceError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let id = match file.id {
            Some(id) => id,
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let version = match file.version {
            Some(raw) => raw.into(),
            None => hash_payload(&file.payload),
        };
        Ok(SourceRecord {
            kind,
            id,
            version,
            payload: file.payload,
        })
    }
}

impl ContentSource for DirectorySource {
    fn list_records(&self, kind: ArtifactKind) -> Result<Vec<SourceRecord>, SourceError> {
        let dir = self.root.join(kind_dir(kind));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let io_err = |source| SourceError::Io {
            path: dir.clone(),
            source,
        };
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(io_err)?
            .map(|entry| entry.map(|e| e.path()).map_err(io_err))
            .collect::<Result<_, _>>()?;
        paths.retain(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"));
        paths.sort();

        let mut records = paths
            .iter()
            .map(|p| self.read_record(kind, p))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
