//! Flat path → content mapping to an ordered directory tree.
//!
//! Built in two phases: paths are accumulated into a nested map, then the
//! map is converted into an immutable ordered `Vec<TreeItem>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::studio::models::FileCollection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeItem {
    File {
        name: String,
        /// Full key in the file collection.
        path: String,
    },
    Directory {
        name: String,
        children: Vec<TreeItem>,
    },
}

impl TreeItem {
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Directory { name, .. } => name,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }
}

#[derive(Default)]
struct DirNode {
    dirs: BTreeMap<String, DirNode>,
    files: BTreeMap<String, String>,
}

impl DirNode {
    fn insert(&mut self, segments: &[&str], full_path: &str) {
        match segments {
            [] => {}
            [file] => {
                // Same full path twice: last write wins.
                self.files.insert(file.to_string(), full_path.to_string());
            }
            [dir, rest @ ..] => self
                .dirs
                .entry(dir.to_string())
                .or_default()
                .insert(rest, full_path),
        }
    }

    fn into_items(self) -> Vec<TreeItem> {
        let mut items: Vec<TreeItem> = self
            .dirs
            .into_iter()
            .map(|(name, node)| TreeItem::Directory {
                name,
                children: node.into_items(),
            })
            .chain(
                self.files
                    .into_iter()
                    .map(|(name, path)| TreeItem::File { name, path }),
            )
            .collect();
        // Files and directories share one ordering by name.
        items.sort_by(|a, b| a.name().cmp(b.name()).then(b.is_dir().cmp(&a.is_dir())));
        items
    }
}

/// Build the ordered tree for a file collection.
///
/// Siblings are sorted lexicographically by segment name, with no
/// directories-first rule. The result depends only on the set of paths,
/// never on their insertion order.
pub fn build_tree(files: &FileCollection) -> Vec<TreeItem> {
    let mut root = DirNode::default();
    for path in files.keys() {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        root.insert(&segments, path);
    }
    root.into_items()
}

/// Full paths of every file in the tree, in tree order.
pub fn leaf_paths(items: &[TreeItem]) -> Vec<&str> {
    let mut out = Vec::new();
    collect_leaves(items, &mut out);
    out
}

fn collect_leaves<'a>(items: &'a [TreeItem], out: &mut Vec<&'a str>) {
    for item in items {
        match item {
            TreeItem::File { path, .. } => out.push(path),
            TreeItem::Directory { children, .. } => collect_leaves(children, out),
        }
    }
}

/// Merge chains of single-child directories into one `a/b` segment.
///
/// A presentation option; the tree returned by [`build_tree`] is never
/// collapsed.
pub fn collapse_single_dirs(items: &[TreeItem]) -> Vec<TreeItem> {
    items
        .iter()
        .map(|item| match item {
            TreeItem::File { .. } => item.clone(),
            TreeItem::Directory { name, children } => {
                let mut name = name.clone();
                let mut children = children.as_slice();
                while let [TreeItem::Directory {
                    name: child_name,
                    children: grandchildren,
                }] = children
                {
                    name = format!("{}/{}", name, child_name);
                    children = grandchildren.as_slice();
                }
                TreeItem::Directory {
                    name,
                    children: collapse_single_dirs(children),
                }
            }
        })
        .collect()
}

/// Plain-text rendering, one entry per line, directories suffixed with `/`.
pub fn render_text(items: &[TreeItem]) -> String {
    let mut out = String::new();
    render_into(items, 0, &mut out);
    out
}

fn render_into(items: &[TreeItem], depth: usize, out: &mut String) {
    for item in items {
        out.push_str(&"  ".repeat(depth));
        match item {
            TreeItem::File { name, .. } => {
                out.push_str(name);
                out.push('\n');
            }
            TreeItem::Directory { name, children } => {
                out.push_str(name);
                out.push_str("/\n");
                render_into(children, depth + 1, out);
            }
        }
    }
}

/// Memoizes [`build_tree`] against the identity of the collection.
///
/// Passing the same `Arc` again returns the cached tree; any other `Arc`
/// (even one with equal contents) triggers a rebuild.
#[derive(Debug, Default)]
pub struct TreeCache {
    source: Option<Arc<FileCollection>>,
    tree: Arc<Vec<TreeItem>>,
    builds: usize,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, files: &Arc<FileCollection>) -> Arc<Vec<TreeItem>> {
        let hit = self
            .source
            .as_ref()
            .is_some_and(|cached| Arc::ptr_eq(cached, files));
        if !hit {
            self.tree = Arc::new(build_tree(files));
            self.source = Some(Arc::clone(files));
            self.builds += 1;
        }
        Arc::clone(&self.tree)
    }

    /// Number of times the tree was actually rebuilt.
    pub fn builds(&self) -> usize {
        self.builds
    }
}
