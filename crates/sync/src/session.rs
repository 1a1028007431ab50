use std::sync::Arc;

use chorus_store::{AuthBackend, BoxFuture, ConversationId, RemoteStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::composer::{Composer, ComposerState, SendTarget};
use crate::directory::{ConversationDirectory, DirectoryState};
use crate::error::SyncResult;
use crate::gate::{GateHandle, GateStatus, Identity, SessionGate};
use crate::stream::{MessageStream, StreamState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub default_channel_name: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            default_channel_name: chorus_store::DEFAULT_CHANNEL_NAME.to_string(),
        }
    }
}

/// Everything a renderer needs at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub gate: GateStatus,
    pub directory: DirectoryState,
    pub stream: StreamState,
    pub composer: ComposerState,
}

/// Sends the composer's draft into the selected conversation as the current identity.
struct SessionSender {
    gate: Arc<SessionGate>,
    directory: Arc<ConversationDirectory>,
    stream: Arc<MessageStream>,
}

impl SendTarget for SessionSender {
    fn send<'a>(&'a self, content: &'a str) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            let identity = self.gate.writer_identity("session-send").await?;
            let selected = self.directory.selected();
            self.stream
                .send(Some(&identity), selected, content)
                .await?;
            Ok(())
        })
    }
}

/// Gate, directory, stream and composer wired together.
///
/// A background task follows gate and selection changes: a new identity refreshes the
/// directory, sign-out clears it, and every selection change refocuses the stream.
pub struct ChatSession {
    gate: Arc<SessionGate>,
    directory: Arc<ConversationDirectory>,
    stream: Arc<MessageStream>,
    composer: Composer,
    _gate_handle: GateHandle,
    coordinator: JoinHandle<()>,
}

impl ChatSession {
    pub fn start(
        store: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthBackend>,
        options: SessionOptions,
    ) -> Self {
        let gate = Arc::new(SessionGate::new(auth, Arc::clone(&store)));
        let directory = Arc::new(ConversationDirectory::new(Arc::clone(&store)));
        let stream = Arc::new(
            MessageStream::new(store, Arc::clone(&directory))
                .with_channel_name(options.default_channel_name),
        );
        let composer = Composer::new(Arc::new(SessionSender {
            gate: Arc::clone(&gate),
            directory: Arc::clone(&directory),
            stream: Arc::clone(&stream),
        }));

        let coordinator = tokio::spawn(coordinate(
            gate.watch(),
            directory.watch(),
            Arc::clone(&directory),
            Arc::clone(&stream),
        ));
        let gate_handle = gate.start();

        Self {
            gate,
            directory,
            stream,
            composer,
            _gate_handle: gate_handle,
            coordinator,
        }
    }

    pub fn gate(&self) -> &Arc<SessionGate> {
        &self.gate
    }

    pub fn directory(&self) -> &Arc<ConversationDirectory> {
        &self.directory
    }

    pub fn stream(&self) -> &Arc<MessageStream> {
        &self.stream
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn select(&self, conversation_id: ConversationId) {
        self.directory.select(Some(conversation_id));
    }

    /// Creates a named conversation for the signed-in user and selects it.
    pub async fn new_channel(&self, name: &str) -> SyncResult<ConversationId> {
        let identity = self.gate.writer_identity("session-new-channel").await?;
        let created = self.directory.create_channel(&identity, name).await?;
        Ok(created.id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            gate: self.gate.status(),
            directory: self.directory.snapshot(),
            stream: self.stream.snapshot(),
            composer: self.composer.snapshot(),
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.coordinator.abort();
        self.stream.teardown();
    }
}

async fn coordinate(
    mut gate: watch::Receiver<GateStatus>,
    mut selection: watch::Receiver<DirectoryState>,
    directory: Arc<ConversationDirectory>,
    stream: Arc<MessageStream>,
) {
    let mut current_identity: Option<Identity> = None;
    let mut focused: Option<ConversationId> = None;

    loop {
        tokio::select! {
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = gate.borrow_and_update().clone();
                let identity = status.identity().cloned();
                if identity.as_ref().map(|identity| identity.id)
                    != current_identity.as_ref().map(|identity| identity.id)
                {
                    directory.reset();
                }
                current_identity = identity;
                if let Some(identity) = &current_identity
                    && let Err(error) = directory.refresh(identity).await
                {
                    tracing::warn!("conversation refresh failed: {error}");
                }
            }
            changed = selection.changed() => {
                if changed.is_err() {
                    break;
                }
                let selected = selection.borrow_and_update().selected;
                if selected == focused {
                    continue;
                }
                focused = selected;
                if let Err(error) = stream.focus(selected).await {
                    tracing::warn!("could not focus conversation: {error}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_store::{LocalAuth, MemoryStore, MessageRole, StoreOp, Table};
    use crate::composer::SubmitOutcome;
    use serde_json::json;
    use std::time::Duration;

    async fn eventually<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(value) = probe() {
                    return value;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition in time")
    }

    #[tokio::test]
    async fn first_message_creates_channel_and_clears_draft() {
        let store = MemoryStore::new();
        let auth = Arc::new(LocalAuth::signed_in("u1@example.com"));
        let session = ChatSession::start(
            Arc::new(store.clone()),
            auth,
            SessionOptions::default(),
        );

        eventually(|| {
            let snapshot = session.snapshot();
            (snapshot.gate.identity().is_some() && !snapshot.directory.loading).then_some(())
        })
        .await;
        assert!(session.snapshot().directory.conversations.is_empty());

        session.composer().set_draft("hi");
        assert_eq!(session.composer().submit().await, SubmitOutcome::Sent);

        let conversations = store.rows(Table::Conversations);
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].get("name"), Some(&json!("New Channel")));
        let messages = store.rows(Table::Messages);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].get("content"), Some(&json!("hi")));
        assert_eq!(messages[0].get("role"), Some(&json!(MessageRole::User.as_str())));

        let snapshot = session.snapshot();
        let selected = snapshot.directory.selected.expect("selected");
        assert_eq!(conversations[0].get("id"), Some(&json!(selected.to_string())));
        assert_eq!(snapshot.composer, ComposerState::default());

        let stream = eventually(|| {
            let stream = session.stream().snapshot();
            (stream.conversation_id == Some(selected) && stream.messages.len() == 1)
                .then_some(stream)
        })
        .await;
        assert_eq!(stream.messages[0].content, "hi");
    }

    #[tokio::test]
    async fn sign_out_clears_directory_and_stream() {
        let store = MemoryStore::new();
        let auth = Arc::new(LocalAuth::signed_in("u1@example.com"));
        let session = ChatSession::start(
            Arc::new(store.clone()),
            Arc::clone(&auth) as Arc<dyn AuthBackend>,
            SessionOptions::default(),
        );
        eventually(|| session.gate().identity()).await;
        let created = session.new_channel("planning").await.unwrap();
        eventually(|| (session.stream().subscribed_conversation() == Some(created)).then_some(()))
            .await;

        session.gate().sign_out().await.unwrap();
        eventually(|| {
            let snapshot = session.snapshot();
            (snapshot.gate == GateStatus::Unauthenticated
                && snapshot.directory == DirectoryState::default()
                && snapshot.stream == StreamState::default())
            .then_some(())
        })
        .await;
        assert_eq!(session.stream().subscribed_conversation(), None);

        session.composer().set_draft("anyone there?");
        assert!(matches!(
            session.composer().submit().await,
            SubmitOutcome::Failed(_)
        ));
        assert_eq!(session.composer().snapshot().draft, "anyone there?");
        assert_eq!(store.count_calls(StoreOp::Insert, Table::Messages), 0);
    }

    #[tokio::test]
    async fn failed_identity_upsert_is_retried_before_writing() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::Upsert, Some(Table::Users), "write refused");
        let session = ChatSession::start(
            Arc::new(store.clone()),
            Arc::new(LocalAuth::signed_in("u1@example.com")),
            SessionOptions::default(),
        );
        eventually(|| {
            let snapshot = session.snapshot();
            (snapshot.gate.identity().is_some() && !snapshot.directory.loading).then_some(())
        })
        .await;
        assert!(store.rows(Table::Users).is_empty());

        let created = session.new_channel("planning").await.unwrap();
        assert_eq!(store.rows(Table::Users).len(), 1);
        assert_eq!(session.directory().selected(), Some(created));

        session.composer().set_draft("hello");
        assert_eq!(session.composer().submit().await, SubmitOutcome::Sent);
        assert_eq!(store.rows(Table::Messages).len(), 1);
    }

    #[tokio::test]
    async fn token_refresh_keeps_selection() {
        let store = MemoryStore::new();
        let auth = Arc::new(LocalAuth::signed_in("u1@example.com"));
        let session = ChatSession::start(
            Arc::new(store.clone()),
            Arc::clone(&auth) as Arc<dyn AuthBackend>,
            SessionOptions::default(),
        );
        eventually(|| session.gate().identity()).await;
        let first = session.new_channel("first").await.unwrap();
        session.new_channel("second").await.unwrap();
        session.select(first);

        let refreshes_before = store.count_calls(StoreOp::Select, Table::Conversations);
        auth.refresh_token();
        eventually(|| {
            (store.count_calls(StoreOp::Select, Table::Conversations) > refreshes_before)
                .then_some(())
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.directory().selected(), Some(first));
        assert_eq!(store.rows(Table::Users).len(), 1);
    }
}
