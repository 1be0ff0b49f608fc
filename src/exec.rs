//! External process interface.
//!
//! Every shell-out in the crate (renderer commands, git, the direct-upload
//! command) goes through [`run`]: the child's exit code, stdout and stderr are
//! captured in full, and a wall-clock timeout kills the child if it hangs.
//! Callers classify failures from the returned [`CommandOutput`] or
//! [`ExecError`] rather than from ad hoc string matching.

use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long pipe threads get to finish after a timed-out child is killed.
const PIPE_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("`{program}` not runnable: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` timed out after {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
    #[error("IO error talking to `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// One command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment variables, on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// `program arg1 arg2`, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the child was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run a command to completion or until `timeout` elapses.
///
/// A non-zero exit is **not** an error here; inspect
/// [`CommandOutput::success`]. Only failure to start, I/O on the pipes, and
/// the timeout are errors. On timeout the child is killed and reaped, and its
/// pipe threads get `PIPE_GRACE` to finish. A descendant that inherited the
/// pipes can keep them open longer; those threads are detached and end when
/// the descendant closes its copies.
pub fn run(spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, ExecError> {
    let started_at = Instant::now();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut child = command.spawn().map_err(|source| {
        tracing::warn!(
            op = "exec::run",
            command = %spec.display(),
            error = %source,
            "failed to spawn command"
        );
        ExecError::Spawn {
            program: spec.program.clone(),
            source,
        }
    })?;

    let io_err = |source| ExecError::Io {
        program: spec.program.clone(),
        source,
    };

    // stdin is fed from its own thread so a child that fills its stdout pipe
    // before reading all input cannot deadlock us.
    let writer = match (spec.stdin.clone(), child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => Some(thread::spawn(move || -> io::Result<()> {
            match pipe.write_all(&bytes) {
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        })),
        _ => None,
    };
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let code = match wait_with_timeout(&mut child, timeout).map_err(io_err)? {
        Some(code) => code,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let deadline = Instant::now() + PIPE_GRACE;
            let detached = [
                settle(writer, deadline),
                settle(stdout_reader, deadline),
                settle(stderr_reader, deadline),
            ]
            .into_iter()
            .filter(|settled| !settled)
            .count();
            tracing::warn!(
                op = "exec::run",
                command = %spec.display(),
                timeout_secs = timeout.as_secs(),
                detached_pipe_threads = detached,
                "command timed out and was killed"
            );
            return Err(ExecError::Timeout {
                program: spec.program.clone(),
                timeout,
            });
        }
    };

    if let Some(writer) = writer {
        join_io(writer).map_err(io_err)?;
    }
    let stdout = stdout_reader.map(join_io).transpose().map_err(io_err)?;
    let stderr = stderr_reader.map(join_io).transpose().map_err(io_err)?;

    tracing::debug!(
        op = "exec::run",
        command = %spec.display(),
        exit_code = code.unwrap_or(-1),
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "command finished"
    );

    Ok(CommandOutput {
        code,
        stdout: stdout.unwrap_or_default(),
        stderr: stderr.unwrap_or_default(),
    })
}

/// `Ok(Some(code))` on exit, `Ok(None)` on timeout.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<Option<i32>>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code()));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

/// Join `handle` if it finishes before `deadline`. `false` means it is still
/// blocked on a pipe and was left detached.
fn settle<T>(handle: Option<thread::JoinHandle<T>>, deadline: Instant) -> bool {
    let Some(handle) = handle else {
        return true;
    };
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
    let _ = handle.join();
    true
}

fn join_io<T>(handle: thread::JoinHandle<io::Result<T>>) -> io::Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("pipe thread panicked")))
}
