//! Shared types used across the bake and deploy stages.
//!
//! A [`SourceRecord`] is the unit the content source hands to the baker. It
//! is created once at the start of a bake run and never mutated afterwards;
//! everything downstream (cache checks, rendering, reconciliation) keys off
//! its `kind`, `id` and `version`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of content the baker knows how to lay out.
///
/// Posts and charts are **versioned**: their artifacts are only re-rendered
/// when the record version changes. Every other kind is a **derivative**
/// artifact that is cheap to produce and always rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    Post,
    Chart,
    SpecialPage,
    RedirectSet,
    Feed,
    Sitemap,
}

impl ArtifactKind {
    /// All kinds, in bake order.
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::RedirectSet,
        ArtifactKind::Feed,
        ArtifactKind::SpecialPage,
        ArtifactKind::Sitemap,
        ArtifactKind::Post,
        ArtifactKind::Chart,
    ];

    /// Derivative kinds skip the cache and are rewritten on every run.
    pub fn is_derivative(self) -> bool {
        !matches!(self, ArtifactKind::Post | ArtifactKind::Chart)
    }

    /// Wire name, as used in markers and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Post => "post",
            ArtifactKind::Chart => "chart",
            ArtifactKind::SpecialPage => "specialPage",
            ArtifactKind::RedirectSet => "redirectSet",
            ArtifactKind::Feed => "feed",
            ArtifactKind::Sitemap => "sitemap",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown artifact kind '{s}'"))
    }
}

/// Opaque version marker of a source record.
///
/// Either a monotonically increasing integer (chart configs carry one) or a
/// content hash of the payload. Only equality matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub String);

impl Version {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Version {
    fn from(n: u64) -> Self {
        Version(n.to_string())
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version(s.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One thing to bake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub kind: ArtifactKind,
    /// Stable key: post slug, chart slug, or output path for derivatives.
    pub id: String,
    pub version: Version,
    /// Data the renderer needs. Opaque to the baker except for chart
    /// dimensions, see [`SourceRecord::variable_ids`].
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SourceRecord {
    pub fn new(
        kind: ArtifactKind,
        id: impl Into<String>,
        version: impl Into<Version>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            version: version.into(),
            payload,
        }
    }

    /// Variable ids referenced by a chart's `dimensions[].variableId`,
    /// sorted and deduplicated so the data file name is stable.
    pub fn variable_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .payload
            .get("dimensions")
            .and_then(|d| d.as_array())
            .map(|dims| {
                dims.iter()
                    .filter_map(|d| d.get("variableId").and_then(|v| v.as_u64()))
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// `kind:id`, used in logs and reports.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}
