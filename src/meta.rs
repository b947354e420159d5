//! Issue-description metadata.
//!
//! Two things live in issue/project descriptions:
//! - project metadata telling the pipeline which repository to work in,
//!   written by humans as YAML frontmatter or a JSON object
//! - the branch-binding block aiflow appends to an issue once it has
//!   published a branch and pull request

use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Marker delimiting the machine-written branch block in a description.
pub const BRANCH_METADATA_MARKER: &str = "<!-- aiflow-branch-metadata -->";

static BRANCH_METADATA_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?s)\n*{}.*$", regex::escape(BRANCH_METADATA_MARKER)))
        .expect("static pattern")
});

/// Repository metadata parsed from a project description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectMeta {
    /// Repository in `owner/name` form.
    pub github_repo: String,
    /// Base branch for clones and pull requests.
    #[serde(default)]
    pub default_branch: String,
}

/// Extract repository metadata from a project description.
///
/// YAML frontmatter between `---` lines is tried first, then a JSON object
/// anywhere in the text. `github_repo` is required; `default_branch`
/// defaults to `main`.
pub fn parse_project_meta(description: &str) -> Result<ProjectMeta> {
    let description = description.trim();
    if let Ok(meta) = parse_yaml_frontmatter(description) {
        return Ok(meta);
    }
    parse_json_object(description)
}

fn finish(mut meta: ProjectMeta) -> Result<ProjectMeta> {
    if meta.github_repo.is_empty() {
        bail!("github_repo is required in project metadata");
    }
    if meta.default_branch.is_empty() {
        meta.default_branch = "main".to_string();
    }
    Ok(meta)
}

fn parse_yaml_frontmatter(description: &str) -> Result<ProjectMeta> {
    const DELIMITER: &str = "---";

    let lines: Vec<&str> = description.lines().collect();
    let start = lines
        .iter()
        .position(|line| line.trim() == DELIMITER)
        .context("no YAML frontmatter in description")?;
    let end = lines[start + 1..]
        .iter()
        .position(|line| line.trim() == DELIMITER)
        .map(|offset| start + 1 + offset)
        .context("no closing --- delimiter in description frontmatter")?;

    let frontmatter = lines[start + 1..end].join("\n");
    let meta: ProjectMeta =
        serde_yaml::from_str(&frontmatter).context("parsing description frontmatter")?;
    finish(meta)
}

fn parse_json_object(description: &str) -> Result<ProjectMeta> {
    let json = extract_json_object(description)
        .context("no metadata found in description (expected YAML frontmatter or JSON)")?;
    let meta: ProjectMeta = serde_json::from_str(&json).context("parsing description JSON")?;
    finish(meta)
}

/// Extract the first JSON object from text that may contain other content.
/// Uses brace counting so nested objects survive.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Append (or replace) the branch-binding block at the end of an issue
/// description. Idempotent: calling again with different values replaces
/// the previous block.
pub fn append_branch_metadata(description: &str, branch_name: &str, pr_url: &str) -> String {
    let base = BRANCH_METADATA_BLOCK.replace(description, "").into_owned();

    let mut block = String::from("\n\n");
    block.push_str(BRANCH_METADATA_MARKER);
    block.push('\n');
    block.push_str(&format!("**Branch:** `{}`", branch_name));
    if !pr_url.is_empty() {
        block.push_str(&format!("\n**PR:** {}", pr_url));
    }

    base + &block
}
