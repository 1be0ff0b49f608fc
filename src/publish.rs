//! Publishing the baked tree.
//!
//! [`GitPublisher`] turns the output directory into a git working tree and
//! pushes it, optionally uploading it directly to the host first:
//!
//! ```text
//! [netlify deploy -d . --prod]   only if .netlify/state.json exists
//! git init                       idempotent
//! git add -A .
//! git commit -F -                skipped when nothing is staged
//! git push <remote> HEAD:<branch>
//! ```
//!
//! Every command runs through [`crate::exec`] with the same timeout. Any
//! failure, including a timeout, is a [`PublishError`]; the drainer decides
//! whether to retry.

use crate::exec::{self, CommandOutput, CommandSpec, ExecError};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("`{command}` failed (exit {code:?}): {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("cannot run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PublishError {
    fn from_exec(spec: &CommandSpec, err: ExecError) -> Self {
        let command = spec.display();
        match err {
            ExecError::Timeout { timeout, .. } => PublishError::Timeout {
                command,
                secs: timeout.as_secs(),
            },
            ExecError::Spawn { source, .. } => PublishError::Spawn { command, source },
            ExecError::Io { source, .. } => PublishError::Io(source),
        }
    }
}

/// Commit author, as in `git commit --author`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// `Name <email>`
    pub fn signature(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub message: String,
    pub author: Option<Author>,
}

impl PublishRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            author: None,
        }
    }

    pub fn with_author(mut self, author: Option<Author>) -> Self {
        self.author = author;
        self
    }
}

/// Ships a baked tree somewhere.
pub trait Publisher: Send + Sync {
    fn publish(&self, site_dir: &Path, request: &PublishRequest) -> Result<(), PublishError>;
}

/// Git commit + push, with optional direct upload.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    pub remote: String,
    pub branch: String,
    pub timeout: Duration,
    /// Direct upload command, run in the site dir when `.netlify/state.json`
    /// exists there. Empty disables it.
    pub upload_command: Vec<String>,
    /// Committer identity exported to git, for hosts without a global config.
    pub committer: Option<Author>,
}

impl GitPublisher {
    pub fn new(remote: impl Into<String>, branch: impl Into<String>, timeout: Duration) -> Self {
        Self {
            remote: remote.into(),
            branch: branch.into(),
            timeout,
            upload_command: Vec::new(),
            committer: None,
        }
    }

    pub fn with_upload_command(mut self, command: Vec<String>) -> Self {
        self.upload_command = command;
        self
    }

    pub fn with_committer(mut self, committer: Option<Author>) -> Self {
        self.committer = committer;
        self
    }

    fn spec(&self, site_dir: &Path, program: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(program).current_dir(site_dir);
        if let Some(c) = &self.committer {
            spec = spec
                .env("GIT_COMMITTER_NAME", c.name.as_str())
                .env("GIT_COMMITTER_EMAIL", c.email.as_str())
                .env("GIT_AUTHOR_NAME", c.name.as_str())
                .env("GIT_AUTHOR_EMAIL", c.email.as_str());
        }
        spec
    }

    fn git(&self, site_dir: &Path, args: &[&str]) -> CommandSpec {
        self.spec(site_dir, "git").args(args.iter().copied())
    }

    /// Run and return the raw output, failing only on spawn/timeout/IO.
    fn run_raw(&self, spec: &CommandSpec) -> Result<CommandOutput, PublishError> {
        tracing::debug!(command = %spec.display(), "publish step");
        exec::run(spec, self.timeout).map_err(|e| PublishError::from_exec(spec, e))
    }

    /// Run and require a zero exit.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PublishError> {
        let output = self.run_raw(spec)?;
        if !output.success() {
            return Err(PublishError::Command {
                command: spec.display(),
                code: output.code,
                stderr: output.stderr_lossy(),
            });
        }
        Ok(output)
    }

    fn upload(&self, site_dir: &Path) -> Result<(), PublishError> {
        let Some((program, args)) = self.upload_command.split_first() else {
            return Ok(());
        };
        if !site_dir.join(".netlify/state.json").is_file() {
            return Ok(());
        }
        tracing::info!(site = %site_dir.display(), "uploading directly to host");
        self.run(&self.spec(site_dir, program).args(args.iter().cloned()))?;
        Ok(())
    }

    /// `true` when the index differs from HEAD.
    fn has_staged_changes(&self, site_dir: &Path) -> Result<bool, PublishError> {
        let spec = self.git(site_dir, &["diff", "--cached", "--quiet"]);
        let output = self.run_raw(&spec)?;
        match output.code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            code => Err(PublishError::Command {
                command: spec.display(),
                code,
                stderr: output.stderr_lossy(),
            }),
        }
    }
}

impl Publisher for GitPublisher {
    fn publish(&self, site_dir: &Path, request: &PublishRequest) -> Result<(), PublishError> {
        std::fs::create_dir_all(site_dir)?;
        self.upload(site_dir)?;

        self.run(&self.git(site_dir, &["init", "--quiet"]))?;
        self.run(&self.git(site_dir, &["add", "-A", "."]))?;

        if self.has_staged_changes(site_dir)? {
            let mut commit = self.git(site_dir, &["commit", "--quiet", "-F", "-"]);
            if let Some(author) = &request.author {
                commit = commit.arg(format!("--author={}", author.signature()));
            }
            self.run(&commit.stdin(request.message.as_bytes()))?;
            tracing::info!(site = %site_dir.display(), "committed baked site");
        } else {
            tracing::info!(site = %site_dir.display(), "nothing to commit");
        }

        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        let push = self.git(
            site_dir,
            &["push", "--quiet", self.remote.as_str(), refspec.as_str()],
        );
        self.run(&push)?;
        tracing::info!(remote = %self.remote, branch = %self.branch, "pushed");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use tempfile::TempDir;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn bare_remote(tmp: &TempDir) -> String {
        let remote = tmp.path().join("remote.git");
        let status = Command::new("git")
            .args(["init", "--bare", "--quiet"])
            .arg(&remote)
            .status()
            .unwrap();
        assert!(status.success());
        remote.to_string_lossy().into_owned()
    }

    fn publisher(remote: String) -> GitPublisher {
        GitPublisher::new(remote, "master", Duration::from_secs(30))
            .with_committer(Some(Author::new("Baker", "baker@example.org")))
    }

    fn remote_log(remote: &str) -> String {
        let out = Command::new("git")
            .args(["--git-dir", remote, "log", "--format=%B%n--%an", "master"])
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    #[test]
    fn commits_and_pushes_site() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(&tmp);
        let site = tmp.path().join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("index.html"), "<html>").unwrap();

        let request = PublishRequest::new("Automated update\n\nfix typo")
            .with_author(Some(Author::new("Ada", "ada@example.org")));
        publisher(remote.clone()).publish(&site, &request).unwrap();

        let log = remote_log(&remote);
        assert!(log.contains("fix typo"));
        assert!(log.contains("--Ada"));
    }

    #[test]
    fn unchanged_site_still_pushes_without_new_commit() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(&tmp);
        let site = tmp.path().join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("index.html"), "<html>").unwrap();

        let p = publisher(remote.clone());
        p.publish(&site, &PublishRequest::new("first")).unwrap();
        p.publish(&site, &PublishRequest::new("second")).unwrap();

        let log = remote_log(&remote);
        assert!(log.contains("first"));
        assert!(!log.contains("second"));
    }

    #[test]
    fn push_to_missing_remote_is_command_error() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("index.html"), "<html>").unwrap();

        let missing = tmp.path().join("nope.git").to_string_lossy().into_owned();
        let err = publisher(missing)
            .publish(&site, &PublishRequest::new("x"))
            .unwrap_err();
        assert!(matches!(err, PublishError::Command { .. }));
    }

    #[test]
    fn upload_runs_only_with_netlify_state() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let remote = bare_remote(&tmp);
        let site = tmp.path().join("site");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("index.html"), "<html>").unwrap();
        let p = publisher(remote).with_upload_command(vec![
            "sh".into(),
            "-c".into(),
            "touch uploaded.flag".into(),
        ]);

        p.publish(&site, &PublishRequest::new("one")).unwrap();
        assert!(!site.join("uploaded.flag").exists());

        fs::create_dir_all(site.join(".netlify")).unwrap();
        fs::write(site.join(".netlify/state.json"), "{}").unwrap();
        p.publish(&site, &PublishRequest::new("two")).unwrap();
        assert!(site.join("uploaded.flag").exists());
    }

    #[test]
    fn hung_upload_is_timeout() {
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("site");
        fs::create_dir_all(site.join(".netlify")).unwrap();
        fs::write(site.join(".netlify/state.json"), "{}").unwrap();

        let p = GitPublisher::new("origin", "master", Duration::from_millis(200))
            .with_upload_command(vec!["sleep".into(), "5".into()]);
        let err = p.publish(&site, &PublishRequest::new("x")).unwrap_err();
        assert!(matches!(err, PublishError::Timeout { .. }));
    }

    #[test]
    fn author_signature_format() {
        assert_eq!(Author::new("A", "a@x.com").signature(), "A <a@x.com>");
    }
}
