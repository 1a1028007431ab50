pub mod auth;
pub mod error;
pub mod ids;
pub mod memory;
pub mod realtime;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

pub use auth::{AuthChange, AuthEvent, AuthSubscription, AuthUser, LocalAuth, Session};
pub use error::{StoreError, StoreResult};
pub use ids::{ConversationId, MessageId, UserId};
pub use memory::{CallHold, MemoryStore, StoreCall, StoreOp};
pub use realtime::{InsertNotification, Subscription};
pub use sqlite::SqliteStore;
pub use types::{
    ACCEPT_INVITE_RPC, AllowedDomainRecord, Column, ColumnDefault, ColumnKind,
    ConversationRecord, DEFAULT_CHANNEL_NAME, Direction, Filter, InviteAcceptance, MessageRecord,
    MessageRole, NewConversation, NewMessage, Order, Row, Table, UserRecord, decode_row,
    decode_rows, format_timestamp, now_timestamp,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request/response and push surface of the hosted data store.
pub trait RemoteStore: Send + Sync {
    fn select<'a>(
        &'a self,
        table: Table,
        filters: Vec<Filter>,
        order: Option<Order>,
    ) -> BoxFuture<'a, StoreResult<Vec<Row>>>;

    fn insert<'a>(&'a self, table: Table, row: Row) -> BoxFuture<'a, StoreResult<Row>>;

    fn upsert<'a>(
        &'a self,
        table: Table,
        row: Row,
        conflict_key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Row>>;

    fn rpc<'a>(&'a self, name: &'a str, args: Value) -> BoxFuture<'a, StoreResult<Value>>;

    fn subscribe_to_inserts<'a>(
        &'a self,
        table: Table,
        filters: Vec<Filter>,
    ) -> BoxFuture<'a, StoreResult<Subscription>>;
}

/// Session issuer consumed by the session gate.
pub trait AuthBackend: Send + Sync {
    fn get_session<'a>(&'a self) -> BoxFuture<'a, StoreResult<Option<Session>>>;
    fn on_auth_state_change(&self) -> AuthSubscription;
    fn sign_in_with_email<'a>(&'a self, email: &'a str) -> BoxFuture<'a, StoreResult<()>>;
    fn sign_out<'a>(&'a self) -> BoxFuture<'a, StoreResult<()>>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
