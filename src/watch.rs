//! Queue watcher: turns queue-file changes into debounced drain triggers.
//!
//! Content edits tend to arrive in bursts (one save fans out into several
//! enqueues), so a change does not trigger a drain directly. It arms a
//! [`Debouncer`]; every further change pushes the deadline out again, and the
//! drain starts once the queue has been quiet for `debounce`. The drain itself
//! batches everything queued by then into one publish.
//!
//! Changes are detected two ways: filesystem notifications on the queue's
//! directory, and a stat poll every `poll_interval` for filesystems where
//! notifications are unreliable (network mounts, some containers). A change
//! only counts when the queue file's size or mtime differs from what was last
//! seen **and** the file is non-empty. The drain truncating the queue is
//! therefore not a change, and a drain that gave up is not retried until
//! somebody enqueues again.
//!
//! On start, a non-empty queue or a leftover pending marker triggers a drain
//! immediately: that is crash recovery.

use crate::deploy::{DeployStep, DrainOutcome, Drainer};
use crate::queue::QueueError;
use notify::{RecursiveMode, Watcher};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("File watcher: {0}")]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trailing-edge debounce timer.
///
/// Pure state: callers pass `now`, which keeps it testable without sleeping.
#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
        }
    }

    /// Record a change. Restarts the quiet period.
    pub fn signal(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// `true` exactly once per quiet period that has fully elapsed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Time left until [`fire`](Self::fire) would succeed, if armed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}

/// What the watcher did, for CLI display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Started { recovering: bool },
    Changed,
    Triggered,
    Finished(DrainOutcome),
    DrainFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Size and mtime of the queue file. `None` when it does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueSignature {
    len: u64,
    modified: Option<SystemTime>,
}

fn queue_signature(path: &Path) -> Option<QueueSignature> {
    fs::metadata(path).ok().map(|m| QueueSignature {
        len: m.len(),
        modified: m.modified().ok(),
    })
}

pub struct QueueWatcher<D: DeployStep + 'static> {
    drainer: Arc<Drainer<D>>,
    options: WatchOptions,
    stop: Arc<AtomicBool>,
    events: Option<Sender<WatchEvent>>,
}

impl<D: DeployStep + 'static> QueueWatcher<D> {
    pub fn new(drainer: Drainer<D>, options: WatchOptions) -> Self {
        Self {
            drainer: Arc::new(drainer),
            options,
            stop: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<WatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn drainer(&self) -> &Drainer<D> {
        &self.drainer
    }

    /// Setting the flag makes [`run`](Self::run) return within one poll
    /// interval, after any in-flight drain finishes.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn emit(&self, event: WatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Watch until stopped.
    pub fn run(&self) -> Result<(), WatchError> {
        let queue_path = self.drainer.queue().queue_path().to_path_buf();
        let watch_dir = match queue_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };
        fs::create_dir_all(&watch_dir)?;
        let queue_name = queue_path.file_name().map(|n| n.to_os_string());

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let mut debouncer = Debouncer::new(self.options.debounce);
        let mut last_seen = queue_signature(&queue_path);
        let mut in_flight: Option<JoinHandle<()>> = None;

        let recovering = !self.drainer.queue().is_empty()?;
        tracing::info!(
            queue = %queue_path.display(),
            debounce_secs = self.options.debounce.as_secs_f64(),
            recovering,
            "watching deploy queue"
        );
        self.emit(WatchEvent::Started { recovering });
        if recovering {
            self.spawn_drain(&mut in_flight);
        }

        while !self.stop.load(Ordering::Acquire) {
            let now = Instant::now();
            let wait = debouncer
                .remaining(now)
                .map_or(self.options.poll_interval, |d| {
                    d.min(self.options.poll_interval)
                });

            let check = match rx.recv_timeout(wait) {
                Ok(Ok(event)) => event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == queue_name),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "file watcher error, relying on polling");
                    true
                }
                Err(RecvTimeoutError::Timeout) => true,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("file watcher channel closed, relying on polling");
                    thread::sleep(wait);
                    true
                }
            };

            if check {
                let current = queue_signature(&queue_path);
                if current != last_seen {
                    last_seen = current;
                    if current.is_some_and(|s| s.len > 0) {
                        tracing::debug!("deploy queue changed");
                        debouncer.signal(Instant::now());
                        self.emit(WatchEvent::Changed);
                    }
                }
            }

            if debouncer.fire(Instant::now()) {
                self.spawn_drain(&mut in_flight);
            }
        }

        if let Some(handle) = in_flight.take() {
            let _ = handle.join();
        }
        tracing::info!("queue watcher stopped");
        Ok(())
    }

    /// Run one drain on its own thread so watching continues meanwhile.
    fn spawn_drain(&self, in_flight: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = in_flight.take_if(|h| h.is_finished()) {
            let _ = handle.join();
        }
        self.emit(WatchEvent::Triggered);
        let drainer = Arc::clone(&self.drainer);
        let events = self.events.clone();
        let handle = thread::spawn(move || {
            let event = match drainer.trigger() {
                Ok(outcome) => WatchEvent::Finished(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "drain aborted");
                    WatchEvent::DrainFailed(e.to_string())
                }
            };
            if let Some(tx) = events {
                let _ = tx.send(event);
            }
        });
        // A still-running previous drain keeps its thread; the new trigger
        // returns AlreadyRunning on its own.
        if in_flight.is_none() {
            *in_flight = Some(handle);
        }
    }
}
