//! Renderer collaborator.
//!
//! Markup generation and chart drawing are not this crate's business. The
//! baker hands a [`SourceRecord`] to a [`Renderer`] and gets bytes back; it
//! never looks inside them beyond stamping the marker line on HTML.
//!
//! [`CommandRenderer`] is the production implementation: it shells out to a
//! configured command, one invocation per artifact:
//!
//! ```text
//! <command...> page       < record.json   → HTML/XML/text on stdout
//! <command...> svg        < record.json   → SVG on stdout
//! <command...> png        < record.json   → PNG bytes on stdout
//! <command...> variables  < {"variableIds":[1,2]} → JSON on stdout
//! ```
//!
//! The renderer must be `Sync`: the baker calls it from rayon workers. It must
//! also be `Send` so a deploy pipeline can move to the watcher's drain thread.

use crate::exec::{self, CommandSpec, ExecError};
use crate::types::SourceRecord;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("renderer `{subcommand}` failed (exit {code:?}): {stderr}")]
    Failed {
        subcommand: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("renderer `{0}` produced invalid UTF-8")]
    Utf8(&'static str),
    #[error("renderer `{0}` produced no output")]
    Empty(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rendered chart exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartImages {
    pub svg: String,
    pub png: Vec<u8>,
}

pub trait Renderer: Send + Sync {
    /// Full document for a record's primary artifact (HTML for posts, charts
    /// and pages; the raw file for redirects, feeds and sitemaps).
    fn render_page(&self, record: &SourceRecord) -> Result<String, RenderError>;

    /// Static SVG and PNG exports of a chart.
    fn render_chart_images(&self, record: &SourceRecord) -> Result<ChartImages, RenderError>;

    /// Variable data JSON for a sorted set of variable ids.
    fn render_variable_data(&self, variable_ids: &[u64]) -> Result<String, RenderError>;
}

/// Renders by invoking an external command.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandRenderer {
    /// `command` is the program followed by any fixed leading arguments.
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    fn invoke(&self, subcommand: &'static str, input: Vec<u8>) -> Result<Vec<u8>, RenderError> {
        let (program, leading) = match self.command.split_first() {
            Some(parts) => parts,
            None => {
                return Err(RenderError::Failed {
                    subcommand,
                    code: None,
                    stderr: "no renderer command configured".into(),
                });
            }
        };
        let spec = CommandSpec::new(program.as_str())
            .args(leading.iter().cloned())
            .arg(subcommand)
            .stdin(input);
        let output = exec::run(&spec, self.timeout)?;
        if !output.success() {
            return Err(RenderError::Failed {
                subcommand,
                code: output.code,
                stderr: output.stderr_lossy(),
            });
        }
        if output.stdout.is_empty() {
            return Err(RenderError::Empty(subcommand));
        }
        Ok(output.stdout)
    }

    fn invoke_text(&self, subcommand: &'static str, input: Vec<u8>) -> Result<String, RenderError> {
        let bytes = self.invoke(subcommand, input)?;
        String::from_utf8(bytes).map_err(|_| RenderError::Utf8(subcommand))
    }
}

impl Renderer for CommandRenderer {
    fn render_page(&self, record: &SourceRecord) -> Result<String, RenderError> {
        self.invoke_text("page", serde_json::to_vec(record)?)
    }

    fn render_chart_images(&self, record: &SourceRecord) -> Result<ChartImages, RenderError> {
        let input = serde_json::to_vec(record)?;
        let svg = self.invoke_text("svg", input.clone())?;
        let png = self.invoke("png", input)?;
        Ok(ChartImages { svg, png })
    }

    fn render_variable_data(&self, variable_ids: &[u64]) -> Result<String, RenderError> {
        let input = serde_json::to_vec(&serde_json::json!({ "variableIds": variable_ids }))?;
        self.invoke_text("variables", input)
    }
}
