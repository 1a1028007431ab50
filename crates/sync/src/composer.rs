use std::sync::Arc;

use chorus_store::BoxFuture;
use tokio::sync::watch;

use crate::error::SyncResult;

/// Whatever the composer hands a finished draft to.
pub trait SendTarget: Send + Sync {
    fn send<'a>(&'a self, content: &'a str) -> BoxFuture<'a, SyncResult<()>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposerState {
    pub draft: String,
    pub submitting: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Backspace,
    Char(char),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub shift: bool,
    pub control: bool,
    pub alt: bool,
}

impl Modifiers {
    pub const NONE: Self = Self {
        shift: false,
        control: false,
        alt: false,
    };

    pub const SHIFT: Self = Self {
        shift: true,
        control: false,
        alt: false,
    };

    fn is_empty(self) -> bool {
        self == Self::NONE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub key: Key,
    pub modifiers: Modifiers,
}

impl KeyPress {
    pub const fn new(key: Key, modifiers: Modifiers) -> Self {
        Self { key, modifiers }
    }

    pub const fn plain(key: Key) -> Self {
        Self::new(key, Modifiers::NONE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent,
    /// Blank draft or a submit already in flight.
    Skipped,
    Failed(String),
}

/// Draft text plus the `idle -> submitting -> idle` guard around sending it.
pub struct Composer {
    target: Arc<dyn SendTarget>,
    state: watch::Sender<ComposerState>,
}

impl Composer {
    pub fn new(target: Arc<dyn SendTarget>) -> Self {
        let (state, _) = watch::channel(ComposerState::default());
        Self { target, state }
    }

    pub fn watch(&self) -> watch::Receiver<ComposerState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ComposerState {
        self.state.borrow().clone()
    }

    pub fn set_draft(&self, draft: impl Into<String>) {
        let draft = draft.into();
        self.state.send_modify(|state| state.draft = draft);
    }

    /// Enter submits, Shift+Enter inserts a newline. Returns the submit outcome when the key
    /// triggered one.
    pub async fn handle_key(&self, press: KeyPress) -> Option<SubmitOutcome> {
        match press.key {
            Key::Enter if press.modifiers.is_empty() => Some(self.submit().await),
            Key::Enter if press.modifiers.shift => {
                self.state.send_modify(|state| state.draft.push('\n'));
                None
            }
            Key::Enter => None,
            Key::Backspace => {
                self.state.send_if_modified(|state| state.draft.pop().is_some());
                None
            }
            Key::Char(character) => {
                self.state.send_modify(|state| state.draft.push(character));
                None
            }
        }
    }

    pub async fn submit(&self) -> SubmitOutcome {
        let mut content = None;
        self.state.send_if_modified(|state| {
            if state.submitting || state.draft.trim().is_empty() {
                return false;
            }
            state.submitting = true;
            content = Some(state.draft.clone());
            true
        });
        let Some(content) = content else {
            return SubmitOutcome::Skipped;
        };

        match self.target.send(&content).await {
            Ok(()) => {
                self.state.send_modify(|state| {
                    state.submitting = false;
                    // Text typed while the send was in flight stays.
                    if state.draft == content {
                        state.draft.clear();
                    }
                    state.error = None;
                });
                SubmitOutcome::Sent
            }
            Err(error) => {
                let message = error.to_string();
                tracing::warn!("send failed: {message}");
                self.state.send_modify(|state| {
                    state.submitting = false;
                    state.error = Some(message.clone());
                });
                SubmitOutcome::Failed(message)
            }
        }
    }
}
