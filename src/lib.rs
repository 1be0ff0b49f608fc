//! # Bakehouse
//!
//! An incremental static-site baker and a crash-safe deploy queue for sites
//! built from articles and interactive chart configurations. A content source
//! provides versioned records; an external renderer turns them into bytes;
//! Bakehouse decides what to regenerate, writes the tree, removes what no
//! longer has a source, and ships the result.
//!
//! # Architecture: Two Loops
//!
//! ```text
//! bake:    content source → jobs → cache filter → render pool → write → reconcile
//! deploy:  enqueue → queue file → watcher (debounce) → drain → bake + publish
//! ```
//!
//! The bake loop is idempotent: re-running it over unchanged content renders
//! nothing and deletes nothing. The deploy loop coalesces bursts of "please
//! redeploy" requests into one publish and survives crashes at any point,
//! because a batch only leaves disk once its publish succeeded.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | Record model shared by every stage (`SourceRecord`, `ArtifactKind`, `Version`) |
//! | [`naming`] | Where each artifact of a record lives in the output tree |
//! | [`source`] | Content-source trait and the JSON-directory implementation |
//! | [`cache`] | Version markers stamped into HTML and the currency check built on them |
//! | [`job`] | One record's expected artifact set and whether it is clean |
//! | [`render`] | Renderer trait and the external-command renderer |
//! | [`exec`] | Child processes with captured output and a timeout |
//! | [`bake`] | Enumerate, filter, render on a bounded pool, write, reconcile |
//! | [`queue`] | Durable deploy queue, pending marker, commit message coalescing |
//! | [`publish`] | Publisher trait and the git (+ direct upload) publisher |
//! | [`deploy`] | Single-flight gate, bake+publish pipeline, the drain loop |
//! | [`watch`] | Debounced queue watcher that triggers drains |
//! | [`config`] | `bakehouse.toml` loading, merging over stock defaults, validation |
//! | [`telemetry`] | `tracing` subscriber setup |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Versions Live In The Artifact
//!
//! There is no cache database. Every baked HTML page starts with one marker
//! line naming its record, version and sibling files. Deciding whether a page
//! is current reads that one line; reconciliation finds orphans by walking
//! the tree and reading the same line. Deleting the output directory is a
//! valid way to force a full rebuild, and a copied tree carries its own cache.
//!
//! ## Primary File Last
//!
//! A job writes its siblings (chart exports, variable data) before the
//! marker-bearing HTML, each through a temp file and rename. A crash mid-job
//! leaves the old marker or none, so the next run sees the job as dirty.
//!
//! ## The Pending Marker Is The Transaction
//!
//! Pulling from the queue copies the entries to the pending file and only
//! then truncates the queue, under an advisory lock shared with `enqueue`.
//! The pending file is deleted only after a successful publish. Whatever
//! state a crash leaves, every entry is in the queue, the pending file, or
//! both; the worst case is one message appearing twice in a commit.
//!
//! ## Collaborators Are Traits
//!
//! Content, rendering and publishing sit behind `Send + Sync` traits
//! ([`source::ContentSource`], [`render::Renderer`], [`publish::Publisher`]).
//! The production implementations shell out; tests substitute in-memory
//! doubles and exercise the real orchestration.

pub mod bake;
pub mod cache;
pub mod config;
pub mod deploy;
pub mod exec;
pub mod job;
pub mod naming;
pub mod output;
pub mod publish;
pub mod queue;
pub mod render;
pub mod source;
pub mod telemetry;
pub mod types;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_helpers;
