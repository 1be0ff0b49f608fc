//! Deploy orchestration: bake + publish, and the queue drain loop.
//!
//! ## Drain State Machine
//!
//! ```text
//!            trigger (gate free)
//!   Idle ─────────────────────────▶ Draining
//!    ▲                                 │
//!    │   queue and pending empty       │ pull_all → pending marker
//!    └─────────────────────────────────┤ build commit message
//!                                      │ bake + publish
//!                                      ├─ ok:   clear pending, reset counter, loop
//!                                      └─ fail: counter += 1
//!                                               < MAX: retry the same batch
//!                                               = MAX: give up, pending kept
//! ```
//!
//! A trigger that finds the gate taken returns immediately: the running loop
//! re-checks the queue after every successful publish, so anything enqueued
//! meanwhile is picked up without a second drainer.
//!
//! The failure counter lives in one `trigger` call. A later trigger (new
//! enqueue, watcher restart, process restart) starts from zero and retries
//! the recovered pending batch.

use crate::bake::{BakeError, BakeReport, Baker};
use crate::publish::{Author, PublishError, PublishRequest, Publisher};
use crate::queue::{DeployQueue, QueueEntry, QueueError, build_commit_message};
use crate::render::Renderer;
use crate::source::ContentSource;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Consecutive failed attempts after which a drain stops retrying.
pub const MAX_SUCCESSIVE_FAILURES: u32 = 2;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Bake failed: {0}")]
    Bake(#[from] BakeError),
    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),
}

/// Single-slot mutual exclusion over the whole publish pipeline.
#[derive(Debug, Default)]
pub struct DeployGate {
    busy: AtomicBool,
}

impl DeployGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate, or `None` if a deploy is already in flight.
    pub fn try_acquire(&self) -> Option<DeployGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DeployGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the gate on drop, including on panic unwind.
#[derive(Debug)]
pub struct DeployGuard<'a> {
    gate: &'a DeployGate,
}

impl Drop for DeployGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

/// Exclusive advisory lock held by the process that drains the queue.
///
/// [`DeployGate`] serializes drains inside one process; this extends that to
/// a `bakehouse drain` run while `bakehouse watch` is up. Released on drop.
#[derive(Debug)]
pub struct DrainLock {
    file: File,
}

impl DrainLock {
    /// `Ok(None)` when another process holds the lock.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for DrainLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// One full deploy: whatever the drainer runs per attempt.
pub trait DeployStep: Send + Sync {
    fn deploy(&self, request: &PublishRequest) -> Result<(), DeployError>;
}

/// Bake the whole site, then publish it.
pub struct DeployPipeline<S: ContentSource, R: Renderer, P: Publisher> {
    baker: Baker<S, R>,
    publisher: P,
}

impl<S: ContentSource, R: Renderer, P: Publisher> DeployPipeline<S, R, P> {
    pub fn new(baker: Baker<S, R>, publisher: P) -> Self {
        Self { baker, publisher }
    }

    pub fn baker(&self) -> &Baker<S, R> {
        &self.baker
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Job failures inside the bake do not stop the publish; they are in
    /// the returned report. Enumeration failure does.
    pub fn bake_and_publish(&self, request: &PublishRequest) -> Result<BakeReport, DeployError> {
        let report = self.baker.bake_all()?;
        if !report.is_success() {
            tracing::warn!(
                failed = report.failures.len(),
                "publishing with failed bake jobs"
            );
        }
        self.publisher.publish(self.baker.out_dir(), request)?;
        Ok(report)
    }
}

impl<S: ContentSource, R: Renderer, P: Publisher> DeployStep for DeployPipeline<S, R, P> {
    fn deploy(&self, request: &PublishRequest) -> Result<(), DeployError> {
        self.bake_and_publish(request).map(|_| ())
    }
}

/// One try at publishing a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployAttempt {
    pub entries: Vec<QueueEntry>,
    pub commit_message: String,
    /// 1-based, per batch.
    pub attempt: u32,
}

impl DeployAttempt {
    pub fn new(entries: Vec<QueueEntry>, attempt: u32) -> Self {
        let commit_message = build_commit_message(&entries);
        Self {
            entries,
            commit_message,
            attempt,
        }
    }

    pub fn request(&self) -> PublishRequest {
        PublishRequest::new(self.commit_message.clone())
    }
}

/// Request for a deploy that bypasses the queue. The requester becomes the
/// commit author when both name and email are given.
pub fn direct_request(entry: &QueueEntry) -> PublishRequest {
    let author = match (&entry.author_name, &entry.author_email) {
        (Some(name), Some(email)) => Some(Author::new(name.as_str(), email.as_str())),
        _ => None,
    };
    PublishRequest::new(build_commit_message(std::slice::from_ref(entry))).with_author(author)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the gate; nothing was done.
    AlreadyRunning,
    /// Queue and pending marker are empty. `published` batches went out.
    Drained { published: usize },
    /// Hit [`MAX_SUCCESSIVE_FAILURES`]; the pending marker is left in place.
    GaveUp {
        published: usize,
        failures: u32,
        last_error: String,
    },
}

/// Pulls queued requests and runs a [`DeployStep`] until the queue is empty.
pub struct Drainer<D: DeployStep> {
    queue: DeployQueue,
    step: D,
    gate: DeployGate,
    max_failures: u32,
}

impl<D: DeployStep> Drainer<D> {
    pub fn new(queue: DeployQueue, step: D) -> Self {
        Self {
            queue,
            step,
            gate: DeployGate::new(),
            max_failures: MAX_SUCCESSIVE_FAILURES,
        }
    }

    pub fn queue(&self) -> &DeployQueue {
        &self.queue
    }

    pub fn step(&self) -> &D {
        &self.step
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_busy()
    }

    /// Drain the queue unless a drain is already in progress.
    pub fn trigger(&self) -> Result<DrainOutcome, QueueError> {
        let Some(_guard) = self.gate.try_acquire() else {
            tracing::debug!("drain already running, trigger ignored");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let mut published = 0;
        let mut failures = 0;
        let mut retry: Option<DeployAttempt> = None;

        loop {
            let attempt = match retry.take() {
                Some(previous) => DeployAttempt {
                    attempt: previous.attempt + 1,
                    ..previous
                },
                None => {
                    if self.queue.is_empty()? {
                        break;
                    }
                    DeployAttempt::new(self.queue.pull_all()?, 1)
                }
            };

            tracing::info!(
                entries = attempt.entries.len(),
                attempt = attempt.attempt,
                message = %attempt.commit_message,
                "deploying site"
            );

            match self.step.deploy(&attempt.request()) {
                Ok(()) => {
                    self.queue.clear_pending()?;
                    failures = 0;
                    published += 1;
                    tracing::info!(entries = attempt.entries.len(), "deploy succeeded");
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_failures {
                        tracing::error!(
                            failures,
                            error = %e,
                            pending = %self.queue.pending_path().display(),
                            "deploy failed, giving up until next trigger"
                        );
                        return Ok(DrainOutcome::GaveUp {
                            published,
                            failures,
                            last_error: e.to_string(),
                        });
                    }
                    tracing::warn!(failures, error = %e, "deploy failed, retrying");
                    retry = Some(attempt);
                }
            }
        }

        Ok(DrainOutcome::Drained { published })
    }
}
