//! Durable deploy queue.
//!
//! Content edits don't deploy directly; they append a [`QueueEntry`] to a
//! line-delimited JSON file. A drain later pulls everything queued so far and
//! publishes it as one commit.
//!
//! ## Files
//!
//! ```text
//! .queue          # appended by enqueue, truncated by pull_all
//! .pending        # the batch currently being deployed
//! .queue.lock     # advisory lock serializing enqueue and pull_all
//! ```
//!
//! Both data files hold one JSON object per line:
//!
//! ```text
//! {"authorName":"Ada","authorEmail":"ada@example.org","message":"Fix typo in GDP chart"}
//! {"message":"Add life expectancy chart"}
//! ```
//!
//! ## Crash Recovery
//!
//! [`DeployQueue::pull_all`] merges any leftover `.pending` content with the
//! queue, persists the merge as the new `.pending` (temp file + rename), and
//! only then truncates the queue. `.pending` is deleted only after a publish
//! is confirmed. A crash at any point therefore leaves every requested
//! message in at least one of the two files; the worst case is an entry
//! present in both, which shows up twice in the next commit message.
//!
//! Every access is an append, a whole-file read, a truncate, a rename or a
//! delete. A torn append can at worst produce one malformed line, which
//! [`parse_queue_content`] skips.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// First line of every coalesced commit message.
pub const COMMIT_SUBJECT: &str = "Automated update";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One "please redeploy" request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QueueEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self.author_email = Some(email.into());
        self
    }
}

/// Counts shown by `bakehouse status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    /// `Some` when a pending marker exists, with its entry count.
    pub pending: Option<usize>,
}

/// The queue file plus its pending marker.
#[derive(Debug, Clone)]
pub struct DeployQueue {
    queue_path: PathBuf,
    pending_path: PathBuf,
    lock_path: PathBuf,
}

/// Held for the duration of a queue mutation. Unlocks on drop.
struct QueueLock(File);

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl DeployQueue {
    pub fn new(queue_path: impl Into<PathBuf>, pending_path: impl Into<PathBuf>) -> Self {
        let queue_path = queue_path.into();
        let mut lock_name = queue_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| ".queue".into());
        lock_name.push(".lock");
        let lock_path = queue_path.with_file_name(lock_name);
        Self {
            queue_path,
            pending_path: pending_path.into(),
            lock_path,
        }
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    pub fn pending_path(&self) -> &Path {
        &self.pending_path
    }

    fn io_err(path: &Path) -> impl Fn(io::Error) -> QueueError + '_ {
        move |source| QueueError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn lock(&self) -> Result<QueueLock, QueueError> {
        ensure_parent(&self.lock_path)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(Self::io_err(&self.lock_path))?;
        file.lock_exclusive()
            .map_err(Self::io_err(&self.lock_path))?;
        Ok(QueueLock(file))
    }

    /// Append one entry, creating the queue file if needed.
    pub fn enqueue(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _lock = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.queue_path)
            .map_err(Self::io_err(&self.queue_path))?;
        file.write_all(line.as_bytes())
            .map_err(Self::io_err(&self.queue_path))?;
        tracing::info!(
            queue = %self.queue_path.display(),
            message = entry.message.as_deref().unwrap_or(""),
            "deploy enqueued"
        );
        Ok(())
    }

    /// Raw queue content. A missing file is empty.
    pub fn read_queue(&self) -> Result<String, QueueError> {
        read_optional(&self.queue_path).map(Option::unwrap_or_default)
    }

    /// Raw pending marker content, if a marker exists.
    pub fn read_pending(&self) -> Result<Option<String>, QueueError> {
        read_optional(&self.pending_path)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_path.is_file()
    }

    /// Entries of the current pending marker.
    pub fn pending_entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self
            .read_pending()?
            .map(|c| parse_queue_content(&c))
            .unwrap_or_default())
    }

    /// True iff there is nothing queued and nothing pending.
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        let pending_empty = self
            .read_pending()?
            .is_none_or(|c| c.trim().is_empty());
        Ok(pending_empty && self.read_queue()?.trim().is_empty())
    }

    /// Take everything queued, merged behind any leftover pending batch.
    ///
    /// The merged content becomes the new pending marker before the queue is
    /// truncated.
    pub fn pull_all(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let _lock = self.lock()?;
        let queued = self.read_queue()?;
        let merged = match self.read_pending()? {
            Some(pending) if !pending.trim().is_empty() => {
                tracing::warn!(
                    pending = %self.pending_path.display(),
                    "recovering unfinished deploy batch"
                );
                format!("{}\n{}", pending.trim_end(), queued)
            }
            _ => queued,
        };

        self.write_pending(&merged)?;
        if self.queue_path.exists() {
            File::create(&self.queue_path).map_err(Self::io_err(&self.queue_path))?;
        }

        let entries = parse_queue_content(&merged);
        tracing::debug!(entries = entries.len(), "queue pulled");
        Ok(entries)
    }

    fn write_pending(&self, content: &str) -> Result<(), QueueError> {
        let err = Self::io_err(&self.pending_path);
        ensure_parent(&self.pending_path)?;
        let dir = match self.pending_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(&err)?;
        tmp.write_all(content.as_bytes()).map_err(&err)?;
        tmp.as_file().sync_all().map_err(&err)?;
        tmp.persist(&self.pending_path).map_err(|e| err(e.error))?;
        Ok(())
    }

    /// Delete the pending marker after a confirmed publish.
    pub fn clear_pending(&self) -> Result<(), QueueError> {
        match fs::remove_file(&self.pending_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&self.pending_path)(e)),
        }
    }

    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            queued: parse_queue_content(&self.read_queue()?).len(),
            pending: self
                .read_pending()?
                .map(|c| parse_queue_content(&c).len()),
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, QueueError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(QueueError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn ensure_parent(path: &Path) -> Result<(), QueueError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|source| QueueError::Io {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Parse line-delimited JSON, skipping blank and malformed lines.
pub fn parse_queue_content(content: &str) -> Vec<QueueEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(line, error = %e, "skipping malformed queue line");
                None
            }
        })
        .collect()
}

/// Coalesce a batch into one commit message.
///
/// ```text
/// Automated update
///
/// Fix typo in GDP chart
/// Add life expectancy chart
///
/// Co-authored-by: Ada <ada@example.org>
/// ```
///
/// Messages and trailers keep batch order; duplicate authors are kept.
/// An author without an email gets a bare-name trailer.
pub fn build_commit_message(entries: &[QueueEntry]) -> String {
    let messages: Vec<&str> = entries
        .iter()
        .filter_map(|e| e.message.as_deref())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .collect();

    let trailers: Vec<String> = entries
        .iter()
        .filter_map(|e| {
            let name = e.author_name.as_deref()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(match e.author_email.as_deref().map(str::trim) {
                Some(email) if !email.is_empty() => format!("Co-authored-by: {name} <{email}>"),
                _ => format!("Co-authored-by: {name}"),
            })
        })
        .collect();

    let mut msg = String::from(COMMIT_SUBJECT);
    if !messages.is_empty() {
        msg.push_str("\n\n");
        msg.push_str(&messages.join("\n"));
    }
    if !trailers.is_empty() {
        msg.push_str("\n\n");
        msg.push_str(&trailers.join("\n"));
    }
    msg
}
