//! Shared test doubles for the bakehouse test suite.
//!
//! All doubles record through a `Mutex` (not `RefCell`) so they are `Sync`
//! and can be called from rayon workers and drain threads.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let source = MemorySource::new(vec![post("hello", 1), chart("gdp", 3, &[12])]);
//! let baker = Baker::new(source, MockRenderer::new(), tmp.path());
//! baker.renderer().fail_on("gdp");
//! let report = baker.bake_all().unwrap();
//! assert_eq!(report.failures[0].id, "gdp");
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::publish::{PublishError, PublishRequest, Publisher};
use crate::render::{ChartImages, RenderError, Renderer};
use crate::source::{ContentSource, SourceError};
use crate::types::{ArtifactKind, SourceRecord};

// =========================================================================
// Record builders
// =========================================================================

pub fn post(id: &str, version: u64) -> SourceRecord {
    SourceRecord::new(
        ArtifactKind::Post,
        id,
        version,
        serde_json::json!({"title": id}),
    )
}

/// A chart whose dimensions reference `variable_ids`.
pub fn chart(id: &str, version: u64, variable_ids: &[u64]) -> SourceRecord {
    let dimensions: Vec<serde_json::Value> = variable_ids
        .iter()
        .map(|v| serde_json::json!({"variableId": v}))
        .collect();
    SourceRecord::new(
        ArtifactKind::Chart,
        id,
        version,
        serde_json::json!({"title": id, "dimensions": dimensions}),
    )
}

// =========================================================================
// MemorySource
// =========================================================================

/// In-memory content source. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemorySource {
    records: Arc<Mutex<Vec<SourceRecord>>>,
    failing: Arc<Mutex<HashSet<ArtifactKind>>>,
}

impl MemorySource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            failing: Arc::default(),
        }
    }

    /// Insert or replace by `(kind, id)`.
    pub fn upsert(&self, record: SourceRecord) {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| !(r.kind == record.kind && r.id == record.id));
        records.push(record);
    }

    pub fn remove(&self, kind: ArtifactKind, id: &str) {
        self.records
            .lock()
            .unwrap()
            .retain(|r| !(r.kind == kind && r.id == id));
    }

    /// Make `list_records(kind)` fail from now on.
    pub fn fail_listing(&self, kind: ArtifactKind) {
        self.failing.lock().unwrap().insert(kind);
    }
}

impl ContentSource for MemorySource {
    fn list_records(&self, kind: ArtifactKind) -> Result<Vec<SourceRecord>, SourceError> {
        if self.failing.lock().unwrap().contains(&kind) {
            return Err(SourceError::Io {
                path: PathBuf::from(format!("memory/{kind}")),
                source: std::io::Error::other("content store unavailable"),
            });
        }
        let mut records: Vec<SourceRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

// =========================================================================
// MockRenderer
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Page(String),
    ChartImages(String),
    VariableData(Vec<u64>),
}

/// Renderer producing deterministic bodies derived from the record.
///
/// Pages render as `page:<kind>:<id>`. Records whose id is in the fail set
/// fail for pages and chart images.
#[derive(Default)]
pub struct MockRenderer {
    calls: Mutex<Vec<RenderCall>>,
    fail_ids: Mutex<HashSet<String>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, id: &str) {
        self.fail_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, subcommand: &'static str, record: &SourceRecord) -> Result<(), RenderError> {
        if self.fail_ids.lock().unwrap().contains(&record.id) {
            return Err(RenderError::Failed {
                subcommand,
                code: Some(1),
                stderr: format!("cannot render {}", record.id),
            });
        }
        Ok(())
    }
}

impl Renderer for MockRenderer {
    fn render_page(&self, record: &SourceRecord) -> Result<String, RenderError> {
        self.calls
            .lock()
            .unwrap()
            .push(RenderCall::Page(record.key()));
        self.check("page", record)?;
        Ok(format!("page:{}:{}", record.kind, record.id))
    }

    fn render_chart_images(&self, record: &SourceRecord) -> Result<ChartImages, RenderError> {
        self.calls
            .lock()
            .unwrap()
            .push(RenderCall::ChartImages(record.key()));
        self.check("svg", record)?;
        Ok(ChartImages {
            svg: format!("<svg id=\"{}\"/>", record.id),
            png: format!("png:{}", record.id).into_bytes(),
        })
    }

    fn render_variable_data(&self, variable_ids: &[u64]) -> Result<String, RenderError> {
        self.calls
            .lock()
            .unwrap()
            .push(RenderCall::VariableData(variable_ids.to_vec()));
        Ok(serde_json::json!({ "variables": variable_ids }).to_string())
    }
}

// =========================================================================
// MockPublisher
// =========================================================================

/// What a [`MockPublisher`] saw on one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    pub site_dir: PathBuf,
    pub message: String,
    /// Relative paths present in the site dir at publish time, sorted.
    pub files: Vec<String>,
}

/// Publisher that records calls and fails on demand.
#[derive(Default)]
pub struct MockPublisher {
    calls: Mutex<Vec<PublishCall>>,
    failures_left: Mutex<u32>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes.
    pub fn fail_next(&self, n: u32) {
        *self.failures_left.lock().unwrap() = n;
    }

    /// Successful publishes only.
    pub fn published(&self) -> Vec<PublishCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

impl Publisher for MockPublisher {
    fn publish(&self, site_dir: &Path, request: &PublishRequest) -> Result<(), PublishError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(PublishError::Command {
                command: "git push".into(),
                code: Some(128),
                stderr: "remote hung up".into(),
            });
        }
        self.calls.lock().unwrap().push(PublishCall {
            site_dir: site_dir.to_path_buf(),
            message: request.message.clone(),
            files: list_files(site_dir),
        });
        Ok(())
    }
}
