//! `pluffy tree`: render a JSON file collection as an indented tree.

use std::path::Path;

use anyhow::{Context, Result};
use pluffy::explorer::tree::{build_tree, collapse_single_dirs, render_text};
use pluffy::studio::models::FileCollection;

pub fn cmd_tree(path: &Path, collapse: bool) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let files: FileCollection = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON object of path → content", path.display()))?;

    let tree = build_tree(&files);
    let tree = if collapse {
        collapse_single_dirs(&tree)
    } else {
        tree
    };
    print!("{}", render_text(&tree));
    Ok(())
}
