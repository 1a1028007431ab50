use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chorus_store::{
    ConversationId, ConversationRecord, Filter, NewConversation, Order, RemoteStore, Table,
    decode_row, decode_rows,
};
use snafu::ResultExt;
use tokio::sync::watch;

use crate::error::{DecodeSnafu, RemoteCallSnafu, SyncResult};
use crate::gate::Identity;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryState {
    /// Newest first.
    pub conversations: Vec<ConversationRecord>,
    pub selected: Option<ConversationId>,
    pub loading: bool,
    pub last_error: Option<String>,
}

impl DirectoryState {
    pub fn selected_conversation(&self) -> Option<&ConversationRecord> {
        let selected = self.selected?;
        self.conversations
            .iter()
            .find(|conversation| conversation.id == selected)
    }

    fn apply_list(&mut self, conversations: Vec<ConversationRecord>) {
        self.conversations = conversations;
        self.loading = false;
        self.last_error = None;
        // A selection that is no longer listed is left alone.
        if self.selected.is_none() {
            self.selected = self.conversations.first().map(|conversation| conversation.id);
        }
    }

    fn ensure_listed(&mut self, created: &ConversationRecord) {
        if self
            .conversations
            .iter()
            .any(|conversation| conversation.id == created.id)
        {
            return;
        }
        let position = self
            .conversations
            .partition_point(|conversation| conversation.created_at >= created.created_at);
        self.conversations.insert(position, created.clone());
    }
}

/// The signed-in user's conversations and the current selection.
pub struct ConversationDirectory {
    store: Arc<dyn RemoteStore>,
    state: watch::Sender<DirectoryState>,
    generation: AtomicU64,
}

impl ConversationDirectory {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        let (state, _) = watch::channel(DirectoryState::default());
        Self {
            store,
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn watch(&self) -> watch::Receiver<DirectoryState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> DirectoryState {
        self.state.borrow().clone()
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.state.borrow().selected
    }

    pub fn select(&self, conversation_id: Option<ConversationId>) {
        self.state.send_if_modified(|state| {
            let changed = state.selected != conversation_id;
            state.selected = conversation_id;
            changed
        });
    }

    /// Drops the list and the selection, e.g. after sign-out.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(DirectoryState::default());
    }

    /// Reloads the identity's conversations. Results of a refresh that was overtaken by a later
    /// one are dropped.
    pub async fn refresh(&self, identity: &Identity) -> SyncResult<()> {
        let generation = self.begin_refresh();
        let fetched = self.fetch(identity).await;

        match fetched {
            Ok(conversations) => {
                self.state.send_if_modified(|state| {
                    if !self.is_current(generation) {
                        tracing::debug!("discarding superseded conversation list");
                        return false;
                    }
                    state.apply_list(conversations);
                    true
                });
                Ok(())
            }
            Err(error) => {
                self.record_failure(generation, &error.to_string());
                Err(error)
            }
        }
    }

    /// Creates a conversation and selects it. The new row is listed in the same update that
    /// selects it.
    pub async fn create_channel(
        &self,
        identity: &Identity,
        name: &str,
    ) -> SyncResult<ConversationRecord> {
        let row = self
            .store
            .insert(
                Table::Conversations,
                NewConversation {
                    owner_user_id: identity.id,
                    name: name.to_string(),
                }
                .into_row(),
            )
            .await
            .context(RemoteCallSnafu {
                stage: "directory-create-channel",
            })?;
        let created: ConversationRecord =
            decode_row(Table::Conversations, row).context(DecodeSnafu {
                stage: "directory-create-channel-decode",
            })?;
        tracing::info!("created conversation {} ({})", created.id, created.name);

        let generation = self.begin_refresh();
        let fetched = self.fetch(identity).await;
        if let Err(error) = &fetched {
            // The conversation exists; only the list reload failed.
            tracing::warn!("conversation list reload after create failed: {error}");
        }

        self.state.send_modify(|state| {
            match fetched {
                Ok(conversations) if self.is_current(generation) => state.apply_list(conversations),
                Ok(_) => {}
                Err(error) => {
                    state.loading = false;
                    state.last_error = Some(error.to_string());
                }
            }
            state.ensure_listed(&created);
            state.selected = Some(created.id);
        });

        Ok(created)
    }

    fn begin_refresh(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_if_modified(|state| {
            let changed = !state.loading;
            state.loading = true;
            changed
        });
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn record_failure(&self, generation: u64, message: &str) {
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) {
                return false;
            }
            state.loading = false;
            state.last_error = Some(message.to_string());
            true
        });
    }

    async fn fetch(&self, identity: &Identity) -> SyncResult<Vec<ConversationRecord>> {
        let rows = self
            .store
            .select(
                Table::Conversations,
                vec![Filter::eq("owner_user_id", identity.id)],
                Some(Order::descending("created_at")),
            )
            .await
            .context(RemoteCallSnafu {
                stage: "directory-refresh",
            })?;
        decode_rows(Table::Conversations, rows).context(DecodeSnafu {
            stage: "directory-refresh-decode",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_store::{MemoryStore, StoreOp, UserId, UserRecord};
    use serde_json::json;

    async fn signed_in(store: &MemoryStore, email: &str) -> Identity {
        let identity = Identity {
            id: UserId::from_email(email),
            email: email.to_string(),
        };
        store
            .upsert(
                Table::Users,
                UserRecord {
                    id: identity.id,
                    email: identity.email.clone(),
                }
                .into_row(),
                "id",
            )
            .await
            .unwrap();
        identity
    }

    async fn seed_conversation(
        store: &MemoryStore,
        owner: &Identity,
        name: &str,
        created_at: &str,
    ) -> ConversationId {
        let mut row = NewConversation {
            owner_user_id: owner.id,
            name: name.to_string(),
        }
        .into_row();
        row.insert("created_at".to_string(), json!(created_at));
        let row = store.insert(Table::Conversations, row).await.unwrap();
        decode_row::<ConversationRecord>(Table::Conversations, row)
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn refresh_selects_most_recent_when_nothing_selected() {
        let store = MemoryStore::new();
        let ada = signed_in(&store, "ada@example.com").await;
        let bob = signed_in(&store, "bob@example.com").await;
        seed_conversation(&store, &ada, "older", "2024-01-01T00:00:00Z").await;
        let newest = seed_conversation(&store, &ada, "newer", "2024-02-01T00:00:00Z").await;
        seed_conversation(&store, &bob, "not mine", "2024-03-01T00:00:00Z").await;

        let directory = ConversationDirectory::new(Arc::new(store));
        directory.refresh(&ada).await.unwrap();

        let state = directory.snapshot();
        let names = state
            .conversations
            .iter()
            .map(|conversation| conversation.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["newer", "older"]);
        assert_eq!(state.selected, Some(newest));
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn refresh_keeps_existing_and_dangling_selection() {
        let store = MemoryStore::new();
        let ada = signed_in(&store, "ada@example.com").await;
        let older = seed_conversation(&store, &ada, "older", "2024-01-01T00:00:00Z").await;
        seed_conversation(&store, &ada, "newer", "2024-02-01T00:00:00Z").await;
        let directory = ConversationDirectory::new(Arc::new(store));

        directory.select(Some(older));
        directory.refresh(&ada).await.unwrap();
        assert_eq!(directory.selected(), Some(older));

        let dangling = ConversationId::new_v7();
        directory.select(Some(dangling));
        directory.refresh(&ada).await.unwrap();
        assert_eq!(directory.selected(), Some(dangling));
        assert!(directory.snapshot().selected_conversation().is_none());
    }

    #[tokio::test]
    async fn empty_list_leaves_selection_empty() {
        let store = MemoryStore::new();
        let ada = signed_in(&store, "ada@example.com").await;
        let directory = ConversationDirectory::new(Arc::new(store));

        directory.refresh(&ada).await.unwrap();
        directory.refresh(&ada).await.unwrap();
        let state = directory.snapshot();
        assert!(state.conversations.is_empty());
        assert_eq!(state.selected, None);
    }

    #[tokio::test]
    async fn superseded_refresh_is_discarded() {
        let store = MemoryStore::new();
        let ada = signed_in(&store, "ada@example.com").await;
        seed_conversation(&store, &ada, "first", "2024-01-01T00:00:00Z").await;
        let directory = Arc::new(ConversationDirectory::new(Arc::new(store.clone())));

        let mut hold = store.hold_select(
            Table::Conversations,
            vec![Filter::eq("owner_user_id", ada.id)],
        );
        let slow = tokio::spawn({
            let directory = Arc::clone(&directory);
            let ada = ada.clone();
            async move { directory.refresh(&ada).await }
        });
        hold.reached().await;

        directory.reset();
        hold.release();
        slow.await.unwrap().unwrap();

        let state = directory.snapshot();
        assert!(state.conversations.is_empty());
        assert_eq!(state.selected, None);
        assert_eq!(store.count_calls(StoreOp::Select, Table::Conversations), 1);
    }

    #[tokio::test]
    async fn create_channel_lists_and_selects_new_conversation() {
        let store = MemoryStore::new();
        let ada = signed_in(&store, "ada@example.com").await;
        let existing = seed_conversation(&store, &ada, "old", "2024-01-01T00:00:00Z").await;
        let directory = ConversationDirectory::new(Arc::new(store.clone()));
        directory.refresh(&ada).await.unwrap();
        assert_eq!(directory.selected(), Some(existing));

        let created = directory.create_channel(&ada, "New Channel").await.unwrap();
        let state = directory.snapshot();
        assert_eq!(state.selected, Some(created.id));
        assert_eq!(state.conversations.first().map(|c| c.id), Some(created.id));
        assert_eq!(state.conversations.len(), 2);
    }

    #[tokio::test]
    async fn create_channel_survives_failed_reload() {
        let store = MemoryStore::new();
        let ada = signed_in(&store, "ada@example.com").await;
        let directory = ConversationDirectory::new(Arc::new(store.clone()));
        store.fail_next(StoreOp::Select, Some(Table::Conversations), "timeout");

        let created = directory.create_channel(&ada, "New Channel").await.unwrap();
        let state = directory.snapshot();
        assert_eq!(state.selected, Some(created.id));
        assert_eq!(state.conversations.len(), 1);
        assert_eq!(state.last_error.as_deref(), Some("remote call failed on `memory-select`: timeout"));
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let store = MemoryStore::new();
        let ada = signed_in(&store, "ada@example.com").await;
        seed_conversation(&store, &ada, "one", "2024-01-01T00:00:00Z").await;
        let directory = ConversationDirectory::new(Arc::new(store));
        directory.refresh(&ada).await.unwrap();

        directory.reset();
        assert_eq!(directory.snapshot(), DirectoryState::default());
    }
}
