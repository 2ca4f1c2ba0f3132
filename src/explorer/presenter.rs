//! ResultPresenter: turns a project's message log into what the result
//! pane shows (loading indicator, preview + explorer, or failure).

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::breadcrumb::Crumb;
use super::file_explorer::{Clipboard, CopyFlag, ExplorerView, FileExplorer, copy_best_effort};
use super::tree::TreeItem;
use crate::studio::models::{Message, MessageRole, MessageType};

pub const LOADING_MESSAGES: [&str; 9] = [
    "Thinking...",
    "Loading...",
    "Generating...",
    "Analyzing the request...",
    "Building your website...",
    "Crafting components...",
    "Optimizing layout...",
    "Adding final touches...",
    "Almost ready...",
];

pub const LOADING_ROTATE_EVERY: Duration = Duration::from_secs(3);

/// Rotating status text shown while no agent message exists.
#[derive(Debug, Clone)]
pub struct LoadingIndicator {
    started: Instant,
}

impl Default for LoadingIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingIndicator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn text(&self) -> &'static str {
        let ticks = self.started.elapsed().as_millis() / LOADING_ROTATE_EVERY.as_millis();
        LOADING_MESSAGES[(ticks % LOADING_MESSAGES.len() as u128) as usize]
    }
}

/// Live preview of a sandbox URL.
#[derive(Debug, Clone, Default)]
pub struct FragmentWeb {
    url: Option<String>,
    fragment_key: u64,
    copied: CopyFlag,
}

impl FragmentWeb {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url: url.filter(|u| !u.trim().is_empty()),
            ..Self::default()
        }
    }

    pub fn src(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Identity of the preview frame. Changes on every refresh, which
    /// remounts the frame without refetching the fragment.
    pub fn fragment_key(&self) -> u64 {
        self.fragment_key
    }

    pub fn refresh(&mut self) {
        self.fragment_key += 1;
    }

    pub fn can_copy(&self) -> bool {
        self.url.is_some() && !self.copied.is_set()
    }

    pub fn is_copied(&self) -> bool {
        self.copied.is_set()
    }

    /// Copy the sandbox URL. Returns `false` when copying is disabled.
    pub fn copy_url(&mut self, clipboard: &dyn Clipboard) -> bool {
        if !self.can_copy() {
            return false;
        }
        if let Some(url) = self.url.clone() {
            copy_best_effort(clipboard, &url, &mut self.copied);
        }
        true
    }

    /// URL to open in a new tab, if there is one.
    pub fn open_external(&self) -> Option<&str> {
        self.src()
    }
}

#[derive(Debug)]
pub struct FragmentView {
    pub message_id: String,
    pub title: String,
    pub summary: String,
    pub web: FragmentWeb,
    pub explorer: FileExplorer,
}

#[derive(Debug)]
pub enum PresenterState {
    Loading(LoadingIndicator),
    Ready(Box<FragmentView>),
    /// The agent answered without producing files.
    Answered { content: String },
    Failed { message: String },
}

/// Latest AGENT message by timestamp, ties broken by id. Progress
/// messages do not end the loading state.
pub fn latest_agent_message(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Agent && m.message_type != MessageType::Progress)
        .max_by(|a, b| match a.created_at.cmp(&b.created_at) {
            Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        })
}

#[derive(Debug)]
pub struct ResultPresenter {
    state: PresenterState,
    shown: Option<String>,
}

impl Default for ResultPresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultPresenter {
    pub fn new() -> Self {
        Self {
            state: PresenterState::Loading(LoadingIndicator::new()),
            shown: None,
        }
    }

    pub fn state(&self) -> &PresenterState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PresenterState {
        &mut self.state
    }

    /// Feed the current message log (from polling or a subscription).
    ///
    /// The view is rebuilt only when a newer agent message appears, so
    /// selection and preview state survive repeated polls.
    pub fn update(&mut self, messages: &[Message]) {
        let Some(latest) = latest_agent_message(messages) else {
            if self.shown.take().is_some() || !matches!(self.state, PresenterState::Loading(_)) {
                self.state = PresenterState::Loading(LoadingIndicator::new());
            }
            return;
        };
        if self.shown.as_deref() == Some(latest.id.as_str()) {
            return;
        }
        self.shown = Some(latest.id.clone());

        self.state = match (&latest.message_type, &latest.fragment) {
            (MessageType::Error, _) => PresenterState::Failed {
                message: latest.content.clone(),
            },
            (_, Some(fragment)) => {
                let files = Arc::new(fragment.files.clone());
                let explorer = match std::mem::replace(
                    &mut self.state,
                    PresenterState::Loading(LoadingIndicator::new()),
                ) {
                    PresenterState::Ready(mut view) => {
                        view.explorer.set_files(files);
                        view.explorer
                    }
                    _ => FileExplorer::new(files),
                };
                PresenterState::Ready(Box::new(FragmentView {
                    message_id: latest.id.clone(),
                    title: fragment.title.clone(),
                    summary: latest.content.clone(),
                    web: FragmentWeb::new(fragment.sandbox_url.clone()),
                    explorer,
                }))
            }
            (_, None) => PresenterState::Answered {
                content: latest.content.clone(),
            },
        };
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        match &self.state {
            PresenterState::Loading(indicator) => ViewSnapshot::Loading {
                text: indicator.text().to_string(),
            },
            PresenterState::Ready(view) => ViewSnapshot::Ready {
                message_id: view.message_id.clone(),
                title: view.title.clone(),
                summary: view.summary.clone(),
                sandbox_url: view.web.src().map(str::to_string),
                fragment_key: view.web.fragment_key(),
                explorer: view.explorer.view(),
            },
            PresenterState::Answered { content } => ViewSnapshot::Answered {
                content: content.clone(),
            },
            PresenterState::Failed { message } => ViewSnapshot::Failed {
                message: message.clone(),
            },
        }
    }
}

/// Serializable rendering of the presenter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ViewSnapshot {
    Loading {
        text: String,
    },
    Ready {
        message_id: String,
        title: String,
        summary: String,
        sandbox_url: Option<String>,
        fragment_key: u64,
        explorer: ExplorerView,
    },
    Answered {
        content: String,
    },
    Failed {
        message: String,
    },
}

impl ViewSnapshot {
    pub fn tree(&self) -> &[TreeItem] {
        match self {
            Self::Ready { explorer, .. } => &explorer.tree,
            _ => &[],
        }
    }

    pub fn breadcrumb(&self) -> &[Crumb] {
        match self {
            Self::Ready { explorer, .. } => &explorer.breadcrumb,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::file_explorer::MemoryClipboard;
    use crate::studio::models::{FileCollection, Fragment};

    fn message(
        id: &str,
        role: MessageRole,
        ty: MessageType,
        at: &str,
        files: Option<&[&str]>,
    ) -> Message {
        Message {
            id: id.into(),
            project_id: "p1".into(),
            content: format!("content {}", id),
            role,
            message_type: ty,
            job_id: None,
            created_at: at.into(),
            fragment: files.map(|paths| Fragment {
                id: format!("f-{}", id),
                message_id: id.into(),
                sandbox_url: Some(format!("https://sandbox.example/{}", id)),
                title: "Fragment".into(),
                files: paths.iter().map(|p| (*p, "x")).collect::<FileCollection>(),
                created_at: at.into(),
            }),
        }
    }

    const T1: &str = "2025-01-01T00:00:01.000000Z";
    const T2: &str = "2025-01-01T00:00:02.000000Z";

    #[tokio::test(start_paused = true)]
    async fn test_loading_text_rotates_every_three_seconds() {
        let indicator = LoadingIndicator::new();
        assert_eq!(indicator.text(), "Thinking...");
        tokio::time::advance(Duration::from_millis(2_999)).await;
        assert_eq!(indicator.text(), "Thinking...");
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(indicator.text(), "Loading...");
        tokio::time::advance(LOADING_ROTATE_EVERY * 8).await;
        assert_eq!(indicator.text(), "Thinking...");
    }

    #[test]
    fn test_user_message_only_is_loading() {
        let mut presenter = ResultPresenter::new();
        presenter.update(&[message("u", MessageRole::User, MessageType::Result, T1, None)]);
        assert!(matches!(presenter.state(), PresenterState::Loading(_)));
        assert!(matches!(presenter.snapshot(), ViewSnapshot::Loading { .. }));
    }

    #[test]
    fn test_latest_agent_message_wins() {
        let messages = vec![
            message("u", MessageRole::User, MessageType::Result, T1, None),
            message("b", MessageRole::Agent, MessageType::Result, T2, Some(&["b.ts"])),
            message("a", MessageRole::Agent, MessageType::Result, T1, Some(&["a.ts"])),
            message("c", MessageRole::Agent, MessageType::Result, T2, Some(&["c.ts"])),
        ];
        assert_eq!(latest_agent_message(&messages).unwrap().id, "c");
    }

    #[test]
    fn test_progress_messages_keep_loading() {
        let mut presenter = ResultPresenter::new();
        presenter.update(&[message("p", MessageRole::Agent, MessageType::Progress, T1, None)]);
        assert!(matches!(presenter.state(), PresenterState::Loading(_)));
    }

    #[test]
    fn test_ready_state_renders_preview_and_tree() {
        let mut presenter = ResultPresenter::new();
        presenter.update(&[message(
            "m",
            MessageRole::Agent,
            MessageType::Result,
            T1,
            Some(&["lib/util.ts", "index.ts"]),
        )]);
        let snapshot = presenter.snapshot();
        let ViewSnapshot::Ready {
            sandbox_url,
            explorer,
            ..
        } = &snapshot
        else {
            panic!("expected ready snapshot, got {:?}", snapshot);
        };
        assert_eq!(sandbox_url.as_deref(), Some("https://sandbox.example/m"));
        assert_eq!(explorer.selected.as_deref(), Some("lib/util.ts"));
        let top: Vec<&str> = snapshot.tree().iter().map(TreeItem::name).collect();
        assert_eq!(top, vec!["index.ts", "lib"]);
        assert_eq!(snapshot.breadcrumb().len(), 2);
    }

    #[test]
    fn test_error_message_renders_failed() {
        let mut presenter = ResultPresenter::new();
        presenter.update(&[message("e", MessageRole::Agent, MessageType::Error, T1, None)]);
        match presenter.state() {
            PresenterState::Failed { message } => assert_eq!(message, "content e"),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_text_only_answer() {
        let mut presenter = ResultPresenter::new();
        presenter.update(&[message("t", MessageRole::Agent, MessageType::Result, T1, None)]);
        assert!(matches!(presenter.state(), PresenterState::Answered { .. }));
    }

    #[test]
    fn test_repeated_poll_keeps_view_state() {
        let messages = vec![message(
            "m",
            MessageRole::Agent,
            MessageType::Result,
            T1,
            Some(&["a.ts", "b.ts"]),
        )];
        let mut presenter = ResultPresenter::new();
        presenter.update(&messages);
        if let PresenterState::Ready(view) = presenter.state_mut() {
            view.explorer.select("b.ts");
            view.web.refresh();
        }
        presenter.update(&messages);
        let PresenterState::Ready(view) = presenter.state() else {
            panic!("expected Ready");
        };
        assert_eq!(view.explorer.selected_path(), Some("b.ts"));
        assert_eq!(view.web.fragment_key(), 1);
    }

    #[test]
    fn test_newer_fragment_revalidates_selection() {
        let mut presenter = ResultPresenter::new();
        let first = message("m1", MessageRole::Agent, MessageType::Result, T1, Some(&["a.ts", "b.ts"]));
        presenter.update(std::slice::from_ref(&first));
        if let PresenterState::Ready(view) = presenter.state_mut() {
            view.explorer.select("b.ts");
        }
        let second = message("m2", MessageRole::Agent, MessageType::Result, T2, Some(&["c.ts", "b.ts"]));
        presenter.update(&[first.clone(), second.clone()]);
        let PresenterState::Ready(view) = presenter.state() else {
            panic!("expected Ready");
        };
        assert_eq!(view.message_id, "m2");
        assert_eq!(view.explorer.selected_path(), Some("b.ts"));

        let third = message("m3", MessageRole::Agent, MessageType::Result, "2025-01-01T00:00:03.000000Z", Some(&["z.ts"]));
        presenter.update(&[first, second, third]);
        let PresenterState::Ready(view) = presenter.state() else {
            panic!("expected Ready");
        };
        assert_eq!(view.explorer.selected_path(), Some("z.ts"));
    }

    #[test]
    fn test_refresh_changes_frame_identity() {
        let mut web = FragmentWeb::new(Some("https://x".into()));
        assert_eq!(web.fragment_key(), 0);
        web.refresh();
        web.refresh();
        assert_eq!(web.fragment_key(), 2);
        assert_eq!(web.src(), Some("https://x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_url_disabled_while_copied() {
        let clipboard = MemoryClipboard::new();
        let mut web = FragmentWeb::new(Some("https://x".into()));
        assert!(web.copy_url(&clipboard));
        assert_eq!(clipboard.last().as_deref(), Some("https://x"));
        assert!(!web.can_copy());
        assert!(!web.copy_url(&clipboard));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(web.can_copy());
    }

    #[test]
    fn test_missing_url_disables_actions() {
        let clipboard = MemoryClipboard::new();
        let mut web = FragmentWeb::new(None);
        assert!(!web.can_copy());
        assert!(!web.copy_url(&clipboard));
        assert_eq!(web.open_external(), None);
        assert!(FragmentWeb::new(Some("  ".into())).src().is_none());
    }
}
