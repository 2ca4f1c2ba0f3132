//! Selection and view state over one fragment's files.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::breadcrumb::{Crumb, breadcrumb};
use super::tree::{TreeCache, TreeItem};
use crate::studio::models::FileCollection;

/// How long the "copied" indicator stays on after a copy.
pub const COPY_FEEDBACK: Duration = Duration::from_secs(2);

pub const EMPTY_SELECTION_TEXT: &str = "select a file to view it's content";

/// Destination for copy actions. Failures are reported, never retried.
pub trait Clipboard: Send + Sync {
    fn write_text(&self, text: &str) -> anyhow::Result<()>;
}

/// Keeps the last copied text in memory.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    last: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<String> {
        self.last.lock().ok().and_then(|g| g.clone())
    }
}

impl Clipboard for MemoryClipboard {
    fn write_text(&self, text: &str) -> anyhow::Result<()> {
        let mut guard = self
            .last
            .lock()
            .map_err(|e| anyhow::anyhow!("clipboard lock poisoned: {}", e))?;
        *guard = Some(text.to_string());
        Ok(())
    }
}

/// Transient flag that reads `true` for [`COPY_FEEDBACK`] after `set`.
#[derive(Debug, Clone, Default)]
pub struct CopyFlag {
    until: Option<Instant>,
}

impl CopyFlag {
    pub fn set(&mut self) {
        self.until = Some(Instant::now() + COPY_FEEDBACK);
    }

    pub fn is_set(&self) -> bool {
        self.until.is_some_and(|until| Instant::now() < until)
    }
}

/// Copy best-effort: a clipboard error is logged and otherwise ignored.
pub(crate) fn copy_best_effort(clipboard: &dyn Clipboard, text: &str, flag: &mut CopyFlag) {
    if let Err(e) = clipboard.write_text(text) {
        tracing::warn!(error = %e, "clipboard write failed");
    }
    flag.set();
}

/// Lowercase file extension, or `text` when there is none.
pub fn language_for(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
        _ => "text".to_string(),
    }
}

#[derive(Debug)]
pub struct FileExplorer {
    files: Arc<FileCollection>,
    tree: Arc<Vec<TreeItem>>,
    cache: TreeCache,
    selected: Option<String>,
    copied: CopyFlag,
}

impl FileExplorer {
    /// Starts with the first file (insertion order) selected.
    pub fn new(files: Arc<FileCollection>) -> Self {
        let mut cache = TreeCache::new();
        let tree = cache.get(&files);
        let selected = files.first_key().map(str::to_string);
        Self {
            files,
            tree,
            cache,
            selected,
            copied: CopyFlag::default(),
        }
    }

    pub fn files(&self) -> &FileCollection {
        &self.files
    }

    pub fn tree(&self) -> &[TreeItem] {
        &self.tree
    }

    /// Select `path` if it is a file of the current collection.
    ///
    /// Unknown paths (e.g. from a tree built for an older collection) are
    /// ignored. Returns whether the selection changed.
    pub fn select(&mut self, path: &str) -> bool {
        if !self.files.contains_key(path) {
            tracing::debug!(path, "ignoring selection of unknown path");
            return false;
        }
        self.selected = Some(path.to_string());
        true
    }

    pub fn selected_path(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected_content(&self) -> Option<&str> {
        self.selected.as_deref().and_then(|p| self.files.get(p))
    }

    /// Replace the collection, keeping the selection when it still exists.
    pub fn set_files(&mut self, files: Arc<FileCollection>) {
        self.tree = self.cache.get(&files);
        let keep = self
            .selected
            .as_deref()
            .is_some_and(|p| files.contains_key(p));
        if !keep {
            self.selected = files.first_key().map(str::to_string);
        }
        self.files = files;
    }

    /// Copy the selected file's content. Returns `false` when nothing is selected.
    pub fn copy_selected(&mut self, clipboard: &dyn Clipboard) -> bool {
        let Some(content) = self.selected_content().map(str::to_string) else {
            return false;
        };
        copy_best_effort(clipboard, &content, &mut self.copied);
        true
    }

    pub fn is_copied(&self) -> bool {
        self.copied.is_set()
    }

    pub fn language(&self) -> Option<String> {
        self.selected.as_deref().map(language_for)
    }

    pub fn breadcrumb(&self) -> Vec<Crumb> {
        self.selected.as_deref().map(breadcrumb).unwrap_or_default()
    }

    pub fn view(&self) -> ExplorerView {
        ExplorerView {
            tree: self.tree.as_ref().clone(),
            selected: self.selected.clone(),
            breadcrumb: self.breadcrumb(),
            language: self.language(),
            content: self
                .selected_content()
                .unwrap_or(EMPTY_SELECTION_TEXT)
                .to_string(),
            copied: self.is_copied(),
        }
    }
}

/// Serializable snapshot of the explorer pane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplorerView {
    pub tree: Vec<TreeItem>,
    pub selected: Option<String>,
    pub breadcrumb: Vec<Crumb>,
    pub language: Option<String>,
    pub content: String,
    pub copied: bool,
}
