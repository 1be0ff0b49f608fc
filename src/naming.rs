//! Centralized output-path naming for every artifact kind.
//!
//! All paths are relative to the baked site root and use `/` separators so
//! they match public URL paths and can be compared as plain strings.
//!
//! ## Layout
//!
//! ```text
//! bakedSite/
//! ├── _redirects                               # redirectSet
//! ├── atom.xml                                 # feed
//! ├── sitemap.xml                              # sitemap
//! ├── index.html                               # specialPage "index"
//! ├── headerMenu.json                          # specialPage "headerMenu.json"
//! ├── co2-emissions.html                       # post "co2-emissions"
//! └── grapher/
//!     ├── life-expectancy.html                 # chart "life-expectancy"
//!     ├── exports/life-expectancy.svg
//!     ├── exports/life-expectancy.png
//!     └── data/variables/123+456.json          # keyed by sorted variable ids
//! ```

use crate::types::{ArtifactKind, SourceRecord};
use std::path::{Component, Path};

pub const CHART_DIR: &str = "grapher";
pub const EXPORTS_DIR: &str = "grapher/exports";
pub const VARIABLES_DIR: &str = "grapher/data/variables";

/// Does the last path segment carry a file extension?
fn has_extension(id: &str) -> bool {
    id.rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .is_some_and(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
}

/// Primary output path for a record: the file that carries the version
/// marker for versioned kinds.
pub fn primary_path(record: &SourceRecord) -> String {
    let id = record.id.trim_matches('/');
    match record.kind {
        ArtifactKind::Post => format!("{id}.html"),
        ArtifactKind::Chart => format!("{CHART_DIR}/{id}.html"),
        ArtifactKind::SpecialPage if has_extension(id) => id.to_string(),
        ArtifactKind::SpecialPage => format!("{id}.html"),
        ArtifactKind::RedirectSet | ArtifactKind::Feed | ArtifactKind::Sitemap => id.to_string(),
    }
}

pub fn chart_svg_path(id: &str) -> String {
    format!("{EXPORTS_DIR}/{id}.svg")
}

pub fn chart_png_path(id: &str) -> String {
    format!("{EXPORTS_DIR}/{id}.png")
}

/// Variable data file for a dimension set. `None` when the chart has no
/// variables, in which case no data file is written.
pub fn variable_data_path(variable_ids: &[u64]) -> Option<String> {
    if variable_ids.is_empty() {
        return None;
    }
    let joined: Vec<String> = variable_ids.iter().map(|id| id.to_string()).collect();
    Some(format!("{VARIABLES_DIR}/{}.json", joined.join("+")))
}

/// Only HTML artifacts carry a marker line.
pub fn is_stampable(path: &str) -> bool {
    path.ends_with(".html")
}

/// Does `path` stay inside the site root? Rejects `..`, `.`, absolute and
/// prefixed paths, and the empty path.
pub fn is_contained(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
