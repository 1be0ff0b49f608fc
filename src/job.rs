//! Bake jobs: one source record plus the artifact paths it must produce.

use crate::cache::{ArtifactCache, ArtifactMarker};
use crate::naming;
use crate::types::{ArtifactKind, SourceRecord};

/// Expected output files for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    /// The file that carries the marker (for HTML) or the sole output.
    pub primary: String,
    pub svg: Option<String>,
    pub png: Option<String>,
    pub variable_data: Option<String>,
}

impl ArtifactSet {
    pub fn for_record(record: &SourceRecord) -> Self {
        let primary = naming::primary_path(record);
        match record.kind {
            ArtifactKind::Chart => {
                let id = record.id.trim_matches('/');
                Self {
                    primary,
                    svg: Some(naming::chart_svg_path(id)),
                    png: Some(naming::chart_png_path(id)),
                    variable_data: naming::variable_data_path(&record.variable_ids()),
                }
            }
            _ => Self {
                primary,
                svg: None,
                png: None,
                variable_data: None,
            },
        }
    }

    /// Every path except the primary, in write order.
    pub fn siblings(&self) -> Vec<String> {
        [&self.variable_data, &self.svg, &self.png]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<String> {
        let mut paths = self.siblings();
        paths.push(self.primary.clone());
        paths
    }

    /// Every path lands inside the site root.
    pub fn is_contained(&self) -> bool {
        self.all().iter().all(|path| naming::is_contained(path))
    }
}

/// A unit of bake work. Created per run, discarded afterwards.
#[derive(Debug, Clone)]
pub struct BakeJob {
    pub record: SourceRecord,
    pub artifacts: ArtifactSet,
}

impl BakeJob {
    pub fn for_record(record: SourceRecord) -> Self {
        let artifacts = ArtifactSet::for_record(&record);
        Self { record, artifacts }
    }

    pub fn key(&self) -> String {
        self.record.key()
    }

    /// The marker stamped on this job's primary artifact, if it is HTML.
    pub fn marker(&self) -> Option<ArtifactMarker> {
        naming::is_stampable(&self.artifacts.primary).then(|| ArtifactMarker {
            kind: self.record.kind,
            id: self.record.id.clone(),
            version: self.record.version.clone(),
            siblings: self.artifacts.siblings(),
        })
    }

    /// Clean means nothing needs to be rendered.
    ///
    /// Derivative kinds are never clean. Versioned kinds are clean when the
    /// primary declares the current version and every sibling is on disk.
    pub fn is_clean(&self, cache: &ArtifactCache) -> bool {
        if self.record.kind.is_derivative() {
            return false;
        }
        cache.is_current(&self.artifacts.primary, &self.record.version)
            && self
                .artifacts
                .siblings()
                .iter()
                .all(|path| cache.exists(path))
    }
}
