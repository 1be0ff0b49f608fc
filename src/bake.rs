//! Incremental bake of the whole site.
//!
//! [`Baker::bake_all`] runs in ordered phases, each one safe to repeat:
//!
//! ```text
//! 1. Enumerate    ContentSource::list_records for every kind (fatal on error)
//! 2. Partition    versioned jobs → clean (skip) | dirty (render)
//! 3. Render       dirty + derivative jobs on a bounded rayon pool
//! 4. Derivatives  special pages, redirects, feed, sitemap: always rewritten
//! 5. Reconcile    delete stamped artifacts no current record claims,
//!                 unclaimed chart exports and variable data, and
//!                 derivatives the previous run wrote but this one did not
//! ```
//!
//! Phases 3 and 4 share the pool; reconciliation only starts once every
//! write of the run has returned.
//!
//! Non-HTML derivatives carry no marker, so a full bake records the ones it
//! produced in [`DERIVATIVE_MANIFEST`] at the output root.
//!
//! ## Failure Semantics
//!
//! Only enumeration failure aborts a run. A render or write failure is
//! logged, recorded as a [`JobFailure`], and the job stays dirty: its
//! siblings are written before the marker-bearing primary, so a job that
//! dies half-way never looks current on the next run. A record whose id
//! would resolve outside the output root fails without rendering.
//!
//! ## Writes
//!
//! Every file is written to a temp file in its destination directory and
//! renamed into place, so readers (and the publish step) never observe a
//! torn artifact.

use crate::cache::{ArtifactCache, CacheStats, read_marker_at, stamp};
use crate::job::BakeJob;
use crate::naming;
use crate::render::{RenderError, Renderer};
use crate::source::{ContentSource, SourceError};
use crate::types::{ArtifactKind, SourceRecord};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Instant;
use tempfile::NamedTempFile;
use thiserror::Error;
use walkdir::WalkDir;

/// Worker count used when nothing else is configured.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Derivative paths written by the last full bake, relative to the output root.
pub const DERIVATIVE_MANIFEST: &str = ".bakehouse-derivatives.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DerivativeEntry {
    kind: ArtifactKind,
    id: String,
    path: String,
}

#[derive(Error, Debug)]
pub enum BakeError {
    #[error("Cannot enumerate content: {0}")]
    Enumeration(#[from] SourceError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// What went wrong with a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The renderer failed or produced unusable output.
    Render,
    /// Reading, writing or deleting a file failed.
    Io,
    /// The record's id would place an artifact outside the output root.
    Path,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::Render => "render",
            FailureClass::Io => "io",
            FailureClass::Path => "path",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: ArtifactKind,
    pub id: String,
    pub class: FailureClass,
    pub message: String,
}

impl JobFailure {
    fn render(record: &SourceRecord, err: &RenderError) -> Self {
        Self {
            kind: record.kind,
            id: record.id.clone(),
            class: FailureClass::Render,
            message: err.to_string(),
        }
    }

    fn io(kind: ArtifactKind, id: &str, path: &str, err: &io::Error) -> Self {
        Self {
            kind,
            id: id.to_string(),
            class: FailureClass::Io,
            message: format!("{path}: {err}"),
        }
    }

    fn outside_root(job: &BakeJob) -> Self {
        Self {
            kind: job.record.kind,
            id: job.record.id.clone(),
            class: FailureClass::Path,
            message: format!("{}: outside the output root", job.artifacts.primary),
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

/// Progress events sent while baking, for CLI display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BakeEvent {
    Enumerated { kind: ArtifactKind, count: usize },
    Cached { key: String },
    Rendered { key: String, paths: Vec<String> },
    Failed { key: String, error: String },
    Removed { path: String },
}

/// Outcome of a bake run.
#[derive(Debug, Default, Clone)]
pub struct BakeReport {
    /// `kind:id` of every versioned job that was rendered.
    pub rendered: Vec<String>,
    /// Versioned jobs skipped because their artifacts were current.
    pub clean: usize,
    /// Paths of derivative artifacts rewritten this run.
    pub derivatives: Vec<String>,
    /// Orphaned paths removed during reconciliation.
    pub deleted: Vec<String>,
    pub failures: Vec<JobFailure>,
    pub cache_stats: CacheStats,
}

impl BakeReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives one output tree from one content source.
pub struct Baker<S: ContentSource, R: Renderer> {
    source: S,
    renderer: R,
    out_dir: PathBuf,
    max_workers: usize,
    force: bool,
    events: Option<Sender<BakeEvent>>,
}

impl<S: ContentSource, R: Renderer> Baker<S, R> {
    pub fn new(source: S, renderer: R, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            renderer,
            out_dir: out_dir.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            force: false,
            events: None,
        }
    }

    /// Bound on concurrent render jobs. Zero is treated as one.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Ignore the cache and render every job.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_events(mut self, events: Sender<BakeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Stop reporting progress. Dropping the sender lets a printer thread
    /// draining the channel finish.
    pub fn clear_events(&mut self) {
        self.events = None;
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    fn emit(&self, event: BakeEvent) {
        if let Some(tx) = &self.events {
            // A gone receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    /// Bake every record and reconcile the output tree.
    pub fn bake_all(&self) -> Result<BakeReport, BakeError> {
        let started_at = Instant::now();
        std::fs::create_dir_all(&self.out_dir)?;

        let mut jobs = Vec::new();
        for kind in ArtifactKind::ALL {
            let records = self.source.list_records(kind).inspect_err(|e| {
                tracing::error!(kind = %kind, error = %e, "content enumeration failed");
            })?;
            self.emit(BakeEvent::Enumerated {
                kind,
                count: records.len(),
            });
            jobs.extend(records.into_iter().map(BakeJob::for_record));
        }
        tracing::info!(jobs = jobs.len(), out_dir = %self.out_dir.display(), "bake started");

        let mut report = self.run_jobs(&jobs)?;
        self.reconcile(&jobs, &mut report);

        tracing::info!(
            rendered = report.rendered.len(),
            clean = report.clean,
            derivatives = report.derivatives.len(),
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "bake finished"
        );
        Ok(report)
    }

    /// Bake a single record without touching anything else in the tree.
    pub fn bake_one(&self, kind: ArtifactKind, id: &str) -> Result<BakeReport, BakeError> {
        std::fs::create_dir_all(&self.out_dir)?;
        let record = self.source.get_record(kind, id)?;
        self.run_jobs(&[BakeJob::for_record(record)])
    }

    /// Partition, then render everything dirty on the pool.
    fn run_jobs(&self, jobs: &[BakeJob]) -> Result<BakeReport, BakeError> {
        let cache = ArtifactCache::new(&self.out_dir);
        let mut report = BakeReport::default();

        let mut dirty = Vec::new();
        for job in jobs {
            if !job.artifacts.is_contained() {
                tracing::warn!(job = %job.key(), path = %job.artifacts.primary, "artifact path escapes output root");
                let failure = JobFailure::outside_root(job);
                self.emit(BakeEvent::Failed {
                    key: job.key(),
                    error: failure.message.clone(),
                });
                report.cache_stats.failed();
                report.failures.push(failure);
            } else if !self.force && job.is_clean(&cache) {
                tracing::debug!(job = %job.key(), "artifact current, skipping");
                report.clean += 1;
                report.cache_stats.clean();
                self.emit(BakeEvent::Cached { key: job.key() });
            } else {
                dirty.push(job);
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .build()?;
        let results: Vec<(&BakeJob, Result<Vec<String>, JobFailure>)> = pool.install(|| {
            dirty
                .par_iter()
                .map(|job| (*job, self.run_job(job)))
                .collect()
        });

        for (job, result) in results {
            match result {
                Ok(paths) => {
                    report.cache_stats.rendered();
                    if job.record.kind.is_derivative() {
                        report.derivatives.extend(paths);
                    } else {
                        report.rendered.push(job.key());
                    }
                }
                Err(failure) => {
                    report.cache_stats.failed();
                    report.failures.push(failure);
                }
            }
        }
        Ok(report)
    }

    /// Render and write one job. Returns the paths written.
    fn run_job(&self, job: &BakeJob) -> Result<Vec<String>, JobFailure> {
        let record = &job.record;
        let artifacts = &job.artifacts;
        let render_failed = |e: RenderError| {
            tracing::warn!(job = %job.key(), error = %e, "render failed");
            let failure = JobFailure::render(record, &e);
            self.emit(BakeEvent::Failed {
                key: job.key(),
                error: failure.message.clone(),
            });
            failure
        };

        // Render everything before writing anything.
        let mut writes: Vec<(String, Vec<u8>)> = Vec::new();
        if let Some(path) = &artifacts.variable_data {
            let data = self
                .renderer
                .render_variable_data(&record.variable_ids())
                .map_err(render_failed)?;
            writes.push((path.clone(), data.into_bytes()));
        }
        if let (Some(svg_path), Some(png_path)) = (&artifacts.svg, &artifacts.png) {
            let images = self
                .renderer
                .render_chart_images(record)
                .map_err(render_failed)?;
            writes.push((svg_path.clone(), images.svg.into_bytes()));
            writes.push((png_path.clone(), images.png));
        }
        let body = self.renderer.render_page(record).map_err(render_failed)?;
        let primary = match job.marker() {
            Some(marker) => stamp(&marker, &body),
            None => body,
        };
        writes.push((artifacts.primary.clone(), primary.into_bytes()));

        // Siblings first, marker-bearing primary last.
        for (path, bytes) in &writes {
            write_atomic(&self.out_dir, path, bytes).map_err(|e| {
                tracing::warn!(job = %job.key(), path = %path, error = %e, "write failed");
                let failure = JobFailure::io(record.kind, &record.id, path, &e);
                self.emit(BakeEvent::Failed {
                    key: job.key(),
                    error: failure.message.clone(),
                });
                failure
            })?;
        }

        let paths: Vec<String> = writes.into_iter().map(|(path, _)| path).collect();
        tracing::debug!(job = %job.key(), files = paths.len(), "job rendered");
        self.emit(BakeEvent::Rendered {
            key: job.key(),
            paths: paths.clone(),
        });
        Ok(paths)
    }

    /// Remove baked artifacts that no current job accounts for.
    fn reconcile(&self, jobs: &[BakeJob], report: &mut BakeReport) {
        let cache = ArtifactCache::new(&self.out_dir);
        let primaries: HashSet<&str> = jobs
            .iter()
            .map(|j| j.artifacts.primary.as_str())
            .collect();
        let mut claimed: HashSet<String> = jobs.iter().flat_map(|j| j.artifacts.all()).collect();
        // A primary that failed to re-render still points at its old siblings.
        for job in jobs.iter().filter(|j| j.artifacts.is_contained()) {
            if let Some(marker) = cache.read_marker(&job.artifacts.primary) {
                claimed.extend(marker.siblings);
            }
        }

        self.remove_orphans(&primaries, &claimed, report);
        self.sweep_chart_files(&claimed, report);
        self.remove_stale_derivatives(jobs, &claimed, report);
    }

    /// Stamped `.html` files whose record is gone, with their marker siblings
    /// unless another current job still claims them. Unmarked files and
    /// hidden directories (`.git`) are left alone.
    fn remove_orphans(
        &self,
        primaries: &HashSet<&str>,
        claimed: &HashSet<String>,
        report: &mut BakeReport,
    ) {
        let mut orphans = Vec::new();
        let walker = WalkDir::new(&self.out_dir)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry during reconciliation");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_slash_path(&self.out_dir, entry.path()) else {
                continue;
            };
            if !naming::is_stampable(&rel) || primaries.contains(rel.as_str()) {
                continue;
            }
            if let Some(marker) = read_marker_at(entry.path()) {
                orphans.push((rel, marker));
            }
        }
        orphans.sort_by(|a, b| a.0.cmp(&b.0));

        for (rel, marker) in orphans {
            tracing::info!(path = %rel, orphan = %format!("{}:{}", marker.kind, marker.id), "removing orphan");
            let siblings = marker
                .siblings
                .iter()
                .filter(|s| naming::is_contained(s) && !claimed.contains(s.as_str()));
            for path in std::iter::once(&rel).chain(siblings) {
                self.remove_artifact(path, marker.kind, &marker.id, report);
            }
        }
    }

    /// Chart exports and variable data are written only by the baker, so
    /// anything there that nothing claims is stale, e.g. the data file of a
    /// chart whose dimensions changed.
    fn sweep_chart_files(&self, claimed: &HashSet<String>, report: &mut BakeReport) {
        let mut stale = Vec::new();
        for dir in [naming::EXPORTS_DIR, naming::VARIABLES_DIR] {
            let root = self.out_dir.join(dir);
            if !root.is_dir() {
                continue;
            }
            let walker = WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable entry during reconciliation");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                match relative_slash_path(&self.out_dir, entry.path()) {
                    Some(rel) if !claimed.contains(&rel) => stale.push(rel),
                    _ => {}
                }
            }
        }
        stale.sort();

        for rel in stale {
            tracing::info!(path = %rel, "removing unclaimed chart file");
            self.remove_artifact(&rel, ArtifactKind::Chart, &rel, report);
        }
    }

    /// Delete derivatives listed by the previous full bake that this run no
    /// longer produces, then record what this run produced.
    fn remove_stale_derivatives(
        &self,
        jobs: &[BakeJob],
        claimed: &HashSet<String>,
        report: &mut BakeReport,
    ) {
        let mut produced: Vec<DerivativeEntry> = jobs
            .iter()
            .filter(|j| j.record.kind.is_derivative() && j.artifacts.is_contained())
            .map(|j| DerivativeEntry {
                kind: j.record.kind,
                id: j.record.id.clone(),
                path: j.artifacts.primary.clone(),
            })
            .collect();
        produced.sort_by(|a, b| a.path.cmp(&b.path));

        for entry in self.read_derivative_manifest() {
            if claimed.contains(&entry.path) || !naming::is_contained(&entry.path) {
                continue;
            }
            tracing::info!(path = %entry.path, derivative = %format!("{}:{}", entry.kind, entry.id), "removing derivative no longer produced");
            self.remove_artifact(&entry.path, entry.kind, &entry.id, report);
        }

        let written = serde_json::to_vec_pretty(&produced)
            .map_err(io::Error::other)
            .and_then(|bytes| write_atomic(&self.out_dir, DERIVATIVE_MANIFEST, &bytes));
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write derivative manifest");
        }
    }

    /// Missing or unreadable manifest means nothing to remove.
    fn read_derivative_manifest(&self) -> Vec<DerivativeEntry> {
        let path = self.out_dir.join(DERIVATIVE_MANIFEST);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read derivative manifest");
                return Vec::new();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring malformed derivative manifest");
            Vec::new()
        })
    }

    fn remove_artifact(&self, path: &str, kind: ArtifactKind, id: &str, report: &mut BakeReport) {
        match std::fs::remove_file(self.out_dir.join(path)) {
            Ok(()) => {
                self.emit(BakeEvent::Removed {
                    path: path.to_string(),
                });
                report.deleted.push(path.to_string());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "failed to delete orphan");
                report.failures.push(JobFailure::io(kind, id, path, &e));
            }
        }
    }
}

/// Write `bytes` to `root/rel` via a temp file and rename.
pub fn write_atomic(root: &Path, rel: &str, bytes: &[u8]) -> io::Result<()> {
    let path = root.join(rel);
    let parent = path.parent().unwrap_or(root);
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(())
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArtifactMarker;
    use crate::render::ChartImages;
    use crate::test_helpers::{MemorySource, MockRenderer, RenderCall, chart, post};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn baker(source: MemorySource, tmp: &TempDir) -> Baker<MemorySource, MockRenderer> {
        Baker::new(source, MockRenderer::new(), tmp.path().join("site")).with_max_workers(2)
    }

    fn read(tmp: &TempDir, rel: &str) -> String {
        fs::read_to_string(tmp.path().join("site").join(rel)).unwrap()
    }

    fn exists(tmp: &TempDir, rel: &str) -> bool {
        tmp.path().join("site").join(rel).exists()
    }

    // =========================================================================
    // Rendering and layout
    // =========================================================================

    #[test]
    fn bakes_posts_and_charts_with_siblings() {
        let tmp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![post("hello", 1), chart("gdp", 2, &[5, 1])]);
        let report = baker(source, &tmp).bake_all().unwrap();

        assert!(report.is_success());
        assert_eq!(report.rendered.len(), 2);
        assert!(exists(&tmp, "hello.html"));
        assert!(exists(&tmp, "grapher/gdp.html"));
        assert!(exists(&tmp, "grapher/exports/gdp.svg"));
        assert!(exists(&tmp, "grapher/exports/gdp.png"));
        assert!(exists(&tmp, "grapher/data/variables/1+5.json"));
    }

    #[test]
    fn html_primary_is_stamped() {
        let tmp = TempDir::new().unwrap();
        baker(MemorySource::new(vec![chart("gdp", 7, &[3])]), &tmp)
            .bake_all()
            .unwrap();
        let html = read(&tmp, "grapher/gdp.html");
        let marker = ArtifactMarker::parse_line(html.lines().next().unwrap()).unwrap();
        assert_eq!(marker.version.as_str(), "7");
        assert_eq!(marker.siblings.len(), 3);
    }

    #[test]
    fn non_html_derivative_is_written_verbatim() {
        let tmp = TempDir::new().unwrap();
        let feed = SourceRecord::new(ArtifactKind::Feed, "atom.xml", "x", serde_json::json!({}));
        let report = baker(MemorySource::new(vec![feed]), &tmp).bake_all().unwrap();
        assert_eq!(report.derivatives, vec!["atom.xml".to_string()]);
        assert_eq!(read(&tmp, "atom.xml"), "page:feed:atom.xml");
    }

    // =========================================================================
    // Incremental behavior
    // =========================================================================

    #[test]
    fn second_run_renders_nothing_and_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![post("hello", 1), chart("gdp", 2, &[5])]);
        let baker = baker(source, &tmp);

        baker.bake_all().unwrap();
        let before = read(&tmp, "grapher/gdp.html");
        let calls_after_first = baker.renderer().calls().len();

        let report = baker.bake_all().unwrap();
        assert_eq!(report.clean, 2);
        assert!(report.rendered.is_empty());
        assert_eq!(baker.renderer().calls().len(), calls_after_first);
        assert_eq!(read(&tmp, "grapher/gdp.html"), before);
    }

    #[test]
    fn version_bump_re_renders_only_that_record() {
        let tmp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![chart("a", 3, &[]), chart("b", 3, &[])]);
        let baker = baker(source, &tmp);
        baker.bake_all().unwrap();

        baker.source().upsert(chart("a", 4, &[]));
        let report = baker.bake_all().unwrap();
        assert_eq!(report.rendered, vec!["chart:a".to_string()]);
        assert_eq!(report.clean, 1);
    }

    #[test]
    fn force_ignores_cache() {
        let tmp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![post("hello", 1)]);
        baker(source.clone(), &tmp).bake_all().unwrap();
        let report = baker(source, &tmp).with_force(true).bake_all().unwrap();
        assert_eq!(report.rendered, vec!["post:hello".to_string()]);
        assert_eq!(report.clean, 0);
    }

    #[test]
    fn derivatives_rewritten_every_run() {
        let tmp = TempDir::new().unwrap();
        let page = SourceRecord::new(
            ArtifactKind::SpecialPage,
            "index",
            "same",
            serde_json::json!({}),
        );
        let baker = baker(MemorySource::new(vec![page]), &tmp);
        baker.bake_all().unwrap();
        let report = baker.bake_all().unwrap();
        assert_eq!(report.derivatives, vec!["index.html".to_string()]);
        assert_eq!(report.clean, 0);
    }

    #[test]
    fn missing_sibling_makes_chart_dirty() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(MemorySource::new(vec![chart("gdp", 1, &[2])]), &tmp);
        baker.bake_all().unwrap();
        fs::remove_file(tmp.path().join("site/grapher/exports/gdp.png")).unwrap();

        let report = baker.bake_all().unwrap();
        assert_eq!(report.rendered, vec!["chart:gdp".to_string()]);
        assert!(exists(&tmp, "grapher/exports/gdp.png"));
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    fn render_failure_is_recorded_and_run_continues() {
        let tmp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![post("good", 1), post("bad", 1)]);
        let baker = baker(source, &tmp);
        baker.renderer().fail_on("bad");

        let report = baker.bake_all().unwrap();
        assert_eq!(report.rendered, vec!["post:good".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "bad");
        assert_eq!(report.failures[0].class, FailureClass::Render);
        assert!(!exists(&tmp, "bad.html"));
    }

    #[test]
    fn failed_chart_image_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(MemorySource::new(vec![chart("gdp", 1, &[2])]), &tmp);
        baker.renderer().fail_on("gdp");
        baker.bake_all().unwrap();
        assert!(!exists(&tmp, "grapher/data/variables/2.json"));
        assert!(!exists(&tmp, "grapher/gdp.html"));
    }

    #[test]
    fn escaping_id_fails_without_rendering() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(
            MemorySource::new(vec![post("../escaped", 1), post("fine", 1)]),
            &tmp,
        );
        let report = baker.bake_all().unwrap();

        assert_eq!(report.rendered, vec!["post:fine".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].class, FailureClass::Path);
        assert_eq!(report.failures[0].id, "../escaped");
        assert!(!tmp.path().join("escaped.html").exists());
        assert!(
            !baker
                .renderer()
                .calls()
                .contains(&RenderCall::Page("post:../escaped".into()))
        );
    }

    #[test]
    fn enumeration_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let source = MemorySource::new(vec![post("hello", 1)]);
        source.fail_listing(ArtifactKind::Chart);
        let result = baker(source, &tmp).bake_all();
        assert!(matches!(result, Err(BakeError::Enumeration(_))));
        assert!(!exists(&tmp, "hello.html"));
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[test]
    fn orphan_and_its_siblings_are_removed() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(
            MemorySource::new(vec![chart("a", 1, &[1]), chart("b", 1, &[2])]),
            &tmp,
        );
        baker.bake_all().unwrap();

        baker.source().remove(ArtifactKind::Chart, "b");
        let report = baker.bake_all().unwrap();

        assert!(!exists(&tmp, "grapher/b.html"));
        assert!(!exists(&tmp, "grapher/exports/b.svg"));
        assert!(!exists(&tmp, "grapher/exports/b.png"));
        assert!(!exists(&tmp, "grapher/data/variables/2.json"));
        assert!(exists(&tmp, "grapher/a.html"));
        assert!(exists(&tmp, "grapher/data/variables/1.json"));
        assert_eq!(report.deleted.len(), 4);
        assert_eq!(report.clean, 1);
    }

    #[test]
    fn shared_variable_data_survives_orphan_removal() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(
            MemorySource::new(vec![chart("a", 1, &[9]), chart("b", 1, &[9])]),
            &tmp,
        );
        baker.bake_all().unwrap();
        baker.source().remove(ArtifactKind::Chart, "b");
        baker.bake_all().unwrap();
        assert!(exists(&tmp, "grapher/data/variables/9.json"));
        assert!(!exists(&tmp, "grapher/b.html"));
    }

    #[test]
    fn unmarked_and_hidden_files_are_never_touched() {
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("site");
        fs::create_dir_all(site.join(".git")).unwrap();
        fs::write(site.join("uploaded.html"), "<html>hand made</html>").unwrap();
        let marker = ArtifactMarker {
            kind: ArtifactKind::Post,
            id: "old".into(),
            version: "1".into(),
            siblings: Vec::new(),
        };
        fs::write(site.join(".git/old.html"), stamp(&marker, "x")).unwrap();

        baker(MemorySource::new(vec![]), &tmp).bake_all().unwrap();
        assert!(site.join("uploaded.html").exists());
        assert!(site.join(".git/old.html").exists());
    }

    #[test]
    fn marker_sibling_outside_root_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(tmp.path().join("precious.txt"), "keep").unwrap();
        let marker = ArtifactMarker {
            kind: ArtifactKind::Post,
            id: "old".into(),
            version: "1".into(),
            siblings: vec!["../precious.txt".into()],
        };
        fs::write(site.join("old.html"), stamp(&marker, "x")).unwrap();

        let report = baker(MemorySource::new(vec![]), &tmp).bake_all().unwrap();
        assert_eq!(report.deleted, vec!["old.html".to_string()]);
        assert!(tmp.path().join("precious.txt").exists());
    }

    #[test]
    fn changed_dimensions_remove_old_variable_data() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(MemorySource::new(vec![chart("a", 1, &[1])]), &tmp);
        baker.bake_all().unwrap();

        baker.source().upsert(chart("a", 2, &[2]));
        let report = baker.bake_all().unwrap();
        assert_eq!(report.rendered, vec!["chart:a".to_string()]);
        assert_eq!(
            report.deleted,
            vec!["grapher/data/variables/1.json".to_string()]
        );
        assert!(!exists(&tmp, "grapher/data/variables/1.json"));
        assert!(exists(&tmp, "grapher/data/variables/2.json"));
        assert!(exists(&tmp, "grapher/exports/a.svg"));
    }

    #[test]
    fn failed_rerender_keeps_old_variable_data() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(MemorySource::new(vec![chart("a", 1, &[1])]), &tmp);
        baker.bake_all().unwrap();

        baker.source().upsert(chart("a", 2, &[2]));
        baker.renderer().fail_on("a");
        let report = baker.bake_all().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.deleted.is_empty());
        assert!(exists(&tmp, "grapher/data/variables/1.json"));
        assert!(exists(&tmp, "grapher/a.html"));
    }

    #[test]
    fn unclaimed_chart_export_is_swept() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(MemorySource::new(vec![chart("a", 1, &[])]), &tmp);
        baker.bake_all().unwrap();
        fs::write(tmp.path().join("site/grapher/exports/gone.svg"), "<svg/>").unwrap();

        let report = baker.bake_all().unwrap();
        assert_eq!(report.deleted, vec!["grapher/exports/gone.svg".to_string()]);
        assert!(exists(&tmp, "grapher/exports/a.svg"));
    }

    #[test]
    fn removed_non_html_derivative_is_deleted() {
        let tmp = TempDir::new().unwrap();
        let menu = SourceRecord::new(
            ArtifactKind::SpecialPage,
            "headerMenu.json",
            "x",
            serde_json::json!({}),
        );
        let feed = SourceRecord::new(ArtifactKind::Feed, "atom.xml", "x", serde_json::json!({}));
        let baker = baker(MemorySource::new(vec![menu, feed]), &tmp);
        baker.bake_all().unwrap();
        assert!(exists(&tmp, "headerMenu.json"));

        baker
            .source()
            .remove(ArtifactKind::SpecialPage, "headerMenu.json");
        let report = baker.bake_all().unwrap();
        assert_eq!(report.deleted, vec!["headerMenu.json".to_string()]);
        assert!(!exists(&tmp, "headerMenu.json"));
        assert!(exists(&tmp, "atom.xml"));

        // Recorded once removed; nothing left to delete.
        assert!(baker.bake_all().unwrap().deleted.is_empty());
    }

    #[test]
    fn unlisted_root_files_survive_derivative_cleanup() {
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("robots.txt"), "User-agent: *").unwrap();

        let feed = SourceRecord::new(ArtifactKind::Feed, "atom.xml", "x", serde_json::json!({}));
        let baker = baker(MemorySource::new(vec![feed]), &tmp);
        baker.bake_all().unwrap();
        baker.source().remove(ArtifactKind::Feed, "atom.xml");
        let report = baker.bake_all().unwrap();

        assert_eq!(report.deleted, vec!["atom.xml".to_string()]);
        assert!(site.join("robots.txt").exists());
        assert!(site.join(DERIVATIVE_MANIFEST).exists());
    }

    #[test]
    fn failed_job_artifacts_are_not_orphans() {
        let tmp = TempDir::new().unwrap();
        let baker = baker(MemorySource::new(vec![post("hello", 1)]), &tmp);
        baker.bake_all().unwrap();

        baker.source().upsert(post("hello", 2));
        baker.renderer().fail_on("hello");
        let report = baker.bake_all().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(exists(&tmp, "hello.html"));
        assert!(report.deleted.is_empty());
    }

    // =========================================================================
    // bake_one and events
    // =========================================================================

    #[test]
    fn bake_one_renders_single_record_without_reconciling() {
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("site");
        fs::create_dir_all(&site).unwrap();
        let marker = ArtifactMarker {
            kind: ArtifactKind::Post,
            id: "stale".into(),
            version: "1".into(),
            siblings: Vec::new(),
        };
        fs::write(site.join("stale.html"), stamp(&marker, "x")).unwrap();

        let baker = baker(
            MemorySource::new(vec![chart("gdp", 1, &[]), post("other", 1)]),
            &tmp,
        );
        let report = baker.bake_one(ArtifactKind::Chart, "gdp").unwrap();
        assert_eq!(report.rendered, vec!["chart:gdp".to_string()]);
        assert!(exists(&tmp, "grapher/gdp.html"));
        assert!(!exists(&tmp, "other.html"));
        assert!(site.join("stale.html").exists());
    }

    #[test]
    fn bake_one_unknown_record_is_error() {
        let tmp = TempDir::new().unwrap();
        let result = baker(MemorySource::new(vec![]), &tmp).bake_one(ArtifactKind::Post, "nope");
        assert!(matches!(
            result,
            Err(BakeError::Enumeration(SourceError::NotFound(..)))
        ));
    }

    #[test]
    fn events_report_progress() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let baker = baker(MemorySource::new(vec![post("hello", 1)]), &tmp).with_events(tx);
        baker.bake_all().unwrap();
        baker.bake_all().unwrap();
        drop(baker);

        let events: Vec<BakeEvent> = rx.iter().collect();
        assert!(events.contains(&BakeEvent::Enumerated {
            kind: ArtifactKind::Post,
            count: 1
        }));
        assert!(events.contains(&BakeEvent::Rendered {
            key: "post:hello".into(),
            paths: vec!["hello.html".into()],
        }));
        assert!(events.contains(&BakeEvent::Cached {
            key: "post:hello".into()
        }));
    }

    #[test]
    fn renderer_sees_every_dirty_job_once() {
        let tmp = TempDir::new().unwrap();
        let records: Vec<SourceRecord> = (0..20).map(|i| post(&format!("p{i}"), 1)).collect();
        let baker = baker(MemorySource::new(records), &tmp);
        baker.bake_all().unwrap();
        let pages = baker
            .renderer()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RenderCall::Page(_)))
            .count();
        assert_eq!(pages, 20);
    }

    /// Tracks how many page renders run at once.
    #[derive(Default)]
    struct PeakRenderer {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Renderer for PeakRenderer {
        fn render_page(&self, record: &SourceRecord) -> Result<String, RenderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(15));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(record.id.clone())
        }

        fn render_chart_images(&self, _record: &SourceRecord) -> Result<ChartImages, RenderError> {
            Ok(ChartImages {
                svg: String::new(),
                png: Vec::new(),
            })
        }

        fn render_variable_data(&self, _variable_ids: &[u64]) -> Result<String, RenderError> {
            Ok(String::new())
        }
    }

    #[test]
    fn render_concurrency_never_exceeds_max_workers() {
        let tmp = TempDir::new().unwrap();
        let records: Vec<SourceRecord> = (0..20).map(|i| post(&format!("p{i}"), 1)).collect();
        let baker = Baker::new(
            MemorySource::new(records),
            PeakRenderer::default(),
            tmp.path().join("site"),
        )
        .with_max_workers(2);

        let report = baker.bake_all().unwrap();
        assert_eq!(report.rendered.len(), 20);
        let peak = baker.renderer().peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency {peak}");
    }

    #[test]
    fn write_atomic_replaces_existing_file() {
        let tmp = TempDir::new().unwrap();
        write_atomic(tmp.path(), "a/b.txt", b"one").unwrap();
        write_atomic(tmp.path(), "a/b.txt", b"two").unwrap();
        assert_eq!(fs::read(tmp.path().join("a/b.txt")).unwrap(), b"two");
        assert_eq!(fs::read_dir(tmp.path().join("a")).unwrap().count(), 1);
    }
}
