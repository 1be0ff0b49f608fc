//! Artifact version cache for incremental bakes.
//!
//! Rendering chart images is the bottleneck of a full bake: every chart
//! produces an SVG, rasterizes it to PNG, and pulls its variable data. This
//! module lets the baker skip all of that when the artifact already on disk
//! was produced from the same record version.
//!
//! # Design
//!
//! There is no separate cache database. Every stamped artifact carries its
//! own provenance on a dedicated first line:
//!
//! ```text
//! <!-- baked {"kind":"chart","id":"gdp","version":"7","siblings":["grapher/exports/gdp.svg"]} -->
//! <!doctype html><html>...
//! ```
//!
//! The marker is JSON, so the version is never scraped out of rendered
//! markup, and it travels with the file when the output tree is committed
//! or copied elsewhere. Only the first line is ever read.
//!
//! A lookup is a hit when:
//! 1. The artifact exists and its first line is a well-formed marker
//! 2. The marker's `version` equals the record's current version
//!
//! Anything else (missing file, I/O error, no marker, garbage) is a miss:
//! "dirty" is the safe default and a lookup never fails.
//!
//! ## Siblings
//!
//! The marker also lists the other files that belong to the same artifact
//! set (chart exports and variable data). Reconciliation uses the list to
//! delete an orphan's full set without having to know how it was laid out.

use crate::types::{ArtifactKind, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

const MARKER_PREFIX: &str = "<!-- baked ";
const MARKER_SUFFIX: &str = " -->";

/// Upper bound on how much of a file is read looking for the marker line.
const MAX_MARKER_LINE: u64 = 16 * 1024;

/// Provenance stamped on the first line of every baked HTML artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMarker {
    pub kind: ArtifactKind,
    pub id: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub siblings: Vec<String>,
}

impl ArtifactMarker {
    /// Render as a single HTML comment line (no trailing newline).
    pub fn to_line(&self) -> String {
        // serde_json never emits raw newlines, so the marker stays on one line
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{MARKER_PREFIX}{json}{MARKER_SUFFIX}")
    }

    /// Parse a marker line. Returns `None` for anything that is not a
    /// well-formed marker.
    pub fn parse_line(line: &str) -> Option<Self> {
        let json = line
            .trim_end_matches(['\r', '\n'])
            .strip_prefix(MARKER_PREFIX)?
            .strip_suffix(MARKER_SUFFIX)?;
        serde_json::from_str(json).ok()
    }
}

/// Prepend the marker line to a rendered document.
pub fn stamp(marker: &ArtifactMarker, body: &str) -> String {
    format!("{}\n{}", marker.to_line(), body)
}

/// On-disk view of one artifact, as seen at job start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Relative to the output root.
    pub path: String,
    pub declared_version: Option<Version>,
    pub exists: bool,
}

impl ArtifactRecord {
    pub fn is_current(&self, expected: &Version) -> bool {
        self.exists && self.declared_version.as_ref() == Some(expected)
    }
}

/// Read the marker from the first line of a file.
///
/// I/O errors other than "not found" are logged at debug level and treated
/// as a miss.
pub fn read_marker_at(path: &Path) -> Option<ArtifactMarker> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "artifact unreadable");
            }
            return None;
        }
    };
    let mut line = String::new();
    let mut reader = BufReader::new(file).take(MAX_MARKER_LINE);
    if let Err(e) = reader.read_line(&mut line) {
        tracing::debug!(path = %path.display(), error = %e, "artifact unreadable");
        return None;
    }
    ArtifactMarker::parse_line(&line)
}

/// Answers "is this artifact already up to date?" for one output root.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    pub fn exists(&self, rel_path: &str) -> bool {
        self.resolve(rel_path).is_file()
    }

    pub fn read_marker(&self, rel_path: &str) -> Option<ArtifactMarker> {
        read_marker_at(&self.resolve(rel_path))
    }

    pub fn inspect(&self, rel_path: &str) -> ArtifactRecord {
        let exists = self.exists(rel_path);
        let declared_version = if exists {
            self.read_marker(rel_path).map(|m| m.version)
        } else {
            None
        };
        ArtifactRecord {
            path: rel_path.to_string(),
            declared_version,
            exists,
        }
    }

    /// True iff the artifact exists and declares exactly `expected`.
    pub fn is_current(&self, rel_path: &str, expected: &Version) -> bool {
        self.inspect(rel_path).is_current(expected)
    }
}

/// SHA-256 content version of a payload, for sources without explicit
/// version numbers.
///
/// `serde_json` objects serialize with sorted keys, so equal payloads hash
/// equally regardless of the order they were read in.
pub fn hash_payload(payload: &serde_json::Value) -> Version {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    Version(format!("{:x}", digest))
}

/// Summary of cache performance for a bake run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub clean: u32,
    pub rendered: u32,
    pub failed: u32,
}

impl CacheStats {
    pub fn clean(&mut self) {
        self.clean += 1;
    }

    pub fn rendered(&mut self) {
        self.rendered += 1;
    }

    pub fn failed(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> u32 {
        self.clean + self.rendered + self.failed
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clean == 0 && self.failed == 0 {
            return write!(f, "{} rendered", self.rendered);
        }
        write!(f, "{} cached, {} rendered", self.clean, self.rendered)?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        write!(f, " ({} total)", self.total())
    }
}
