use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chorus_store::{
    ConversationId, DEFAULT_CHANNEL_NAME, Filter, MessageRecord, MessageRole, NewMessage, Order,
    RemoteStore, Subscription, Table, decode_row, decode_rows,
};
use futures::StreamExt;
use snafu::{OptionExt, ResultExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::directory::ConversationDirectory;
use crate::error::{DecodeSnafu, NotAuthenticatedSnafu, RemoteCallSnafu, SyncResult};
use crate::gate::Identity;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub conversation_id: Option<ConversationId>,
    /// Oldest first, in backlog order.
    pub messages: Vec<MessageRecord>,
    pub loading: bool,
    pub last_error: Option<String>,
}

/// Where a send ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message: MessageRecord,
    pub created_conversation: bool,
}

#[derive(Debug)]
struct Listener {
    conversation_id: ConversationId,
    task: JoinHandle<()>,
}

/// Messages of the focused conversation, kept current by reloading on every insert push.
pub struct MessageStream {
    store: Arc<dyn RemoteStore>,
    directory: Arc<ConversationDirectory>,
    channel_name: String,
    state: watch::Sender<StreamState>,
    load_generation: AtomicU64,
    epoch: AtomicU64,
    listener: Mutex<Option<Listener>>,
    send_gate: tokio::sync::Mutex<()>,
}

impl MessageStream {
    pub fn new(store: Arc<dyn RemoteStore>, directory: Arc<ConversationDirectory>) -> Self {
        let (state, _) = watch::channel(StreamState::default());
        Self {
            store,
            directory,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            state,
            load_generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            listener: Mutex::new(None),
            send_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Name given to conversations created implicitly by a send.
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn watch(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> StreamState {
        self.state.borrow().clone()
    }

    pub fn subscribed_conversation(&self) -> Option<ConversationId> {
        self.listener().as_ref().map(|listener| listener.conversation_id)
    }

    /// Replaces the state with the conversation's full backlog. Only the most recently started
    /// load may write; anything older is dropped when it completes.
    pub async fn load_backlog(&self, conversation_id: Option<ConversationId>) -> SyncResult<()> {
        let generation = self.load_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let Some(conversation_id) = conversation_id else {
            self.state.send_replace(StreamState::default());
            return Ok(());
        };

        self.state.send_if_modified(|state| {
            let changed = !state.loading || state.conversation_id != Some(conversation_id);
            if state.conversation_id != Some(conversation_id) {
                state.messages.clear();
            }
            state.conversation_id = Some(conversation_id);
            state.loading = true;
            changed
        });

        let fetched = self.fetch(conversation_id).await;
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) {
                tracing::debug!("discarding stale backlog for {conversation_id}");
                return false;
            }
            state.conversation_id = Some(conversation_id);
            state.loading = false;
            match fetched {
                Ok(messages) => {
                    state.messages = messages;
                    state.last_error = None;
                }
                Err(error) => {
                    state.last_error = Some(error.to_string());
                    outcome = Err(error);
                }
            }
            true
        });
        outcome
    }

    /// Follows inserts for one conversation, tearing down the previous subscription first.
    ///
    /// Returns false when a later subscribe or teardown superseded this one while the
    /// subscription was opening; nothing is left listening in that case.
    pub async fn subscribe(
        self: &Arc<Self>,
        conversation_id: Option<ConversationId>,
    ) -> SyncResult<bool> {
        self.teardown();
        let Some(conversation_id) = conversation_id else {
            return Ok(true);
        };

        let epoch = self.epoch.load(Ordering::SeqCst);
        let subscription = self
            .store
            .subscribe_to_inserts(
                Table::Messages,
                vec![Filter::eq("conversation_id", conversation_id)],
            )
            .await
            .context(RemoteCallSnafu {
                stage: "stream-subscribe",
            })?;

        let mut listener = self.listener();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            subscription.unsubscribe();
            tracing::debug!("dropping superseded subscription for {conversation_id}");
            return Ok(false);
        }
        let task = tokio::spawn(follow_inserts(
            Arc::downgrade(self),
            subscription,
            conversation_id,
            epoch,
        ));
        *listener = Some(Listener {
            conversation_id,
            task,
        });
        tracing::debug!("subscribed to inserts for {conversation_id}");
        Ok(true)
    }

    /// Subscribes before loading so nothing inserted in between is missed. A focus overtaken
    /// by a newer one skips its load.
    pub async fn focus(self: &Arc<Self>, conversation_id: Option<ConversationId>) -> SyncResult<()> {
        if !self.subscribe(conversation_id).await? {
            return Ok(());
        }
        self.load_backlog(conversation_id).await
    }

    pub fn teardown(&self) {
        let mut listener = self.listener();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = listener.take() {
            previous.task.abort();
            tracing::debug!("unsubscribed from {}", previous.conversation_id);
        }
    }

    /// Posts a user message, creating a conversation first when none is selected.
    ///
    /// Blank content is ignored. The message is not appended locally; the insert push reloads
    /// the backlog.
    pub async fn send(
        &self,
        identity: Option<&Identity>,
        conversation_id: Option<ConversationId>,
        content: &str,
    ) -> SyncResult<Option<SentMessage>> {
        if content.trim().is_empty() {
            return Ok(None);
        }
        let identity = identity.context(NotAuthenticatedSnafu {
            stage: "stream-send",
        })?;

        let _serialized = self.send_gate.lock().await;
        let (conversation_id, created_conversation) =
            self.resolve_conversation(identity, conversation_id).await?;
        let message = self
            .append_message(identity, conversation_id, content)
            .await?;

        Ok(Some(SentMessage {
            message,
            created_conversation,
        }))
    }

    /// Returns the target conversation and whether it had to be created. A created conversation
    /// is already listed and selected in the directory.
    pub async fn resolve_conversation(
        &self,
        identity: &Identity,
        conversation_id: Option<ConversationId>,
    ) -> SyncResult<(ConversationId, bool)> {
        match conversation_id {
            Some(conversation_id) => Ok((conversation_id, false)),
            None => {
                let created = self
                    .directory
                    .create_channel(identity, &self.channel_name)
                    .await?;
                Ok((created.id, true))
            }
        }
    }

    pub async fn append_message(
        &self,
        identity: &Identity,
        conversation_id: ConversationId,
        content: &str,
    ) -> SyncResult<MessageRecord> {
        let row = self
            .store
            .insert(
                Table::Messages,
                NewMessage {
                    conversation_id,
                    author_user_id: Some(identity.id),
                    role: MessageRole::User,
                    content: content.to_string(),
                }
                .into_row(),
            )
            .await
            .context(RemoteCallSnafu {
                stage: "stream-append-message",
            })?;
        decode_row(Table::Messages, row).context(DecodeSnafu {
            stage: "stream-append-message-decode",
        })
    }

    fn is_current(&self, generation: u64) -> bool {
        self.load_generation.load(Ordering::SeqCst) == generation
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, conversation_id: ConversationId) -> SyncResult<Vec<MessageRecord>> {
        let rows = self
            .store
            .select(
                Table::Messages,
                vec![Filter::eq("conversation_id", conversation_id)],
                Some(Order::ascending("created_at")),
            )
            .await
            .context(RemoteCallSnafu {
                stage: "stream-load-backlog",
            })?;
        decode_rows(Table::Messages, rows).context(DecodeSnafu {
            stage: "stream-load-backlog-decode",
        })
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(listener) = self.listener().take() {
            listener.task.abort();
        }
    }
}

async fn follow_inserts(
    stream: Weak<MessageStream>,
    mut subscription: Subscription,
    conversation_id: ConversationId,
    epoch: u64,
) {
    while subscription.next().await.is_some() {
        let Some(stream) = stream.upgrade() else {
            break;
        };
        if !stream.is_live(epoch) {
            tracing::debug!("ignoring insert for {conversation_id} after teardown");
            break;
        }
        if let Err(error) = stream.load_backlog(Some(conversation_id)).await {
            tracing::warn!("reload after insert failed for {conversation_id}: {error}");
        }
    }
}
