use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row as _, Sqlite, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DuplicateKeySnafu, MissingColumnSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StoreError,
    StoreResult, UnknownColumnSnafu, UnknownRpcSnafu,
};
use super::realtime::{InsertFanout, Subscription};
use super::types::{
    ACCEPT_INVITE_RPC, Column, ColumnKind, Direction, Filter, InviteAcceptance, Order, Row, Table,
    check_order, conflict_column, now_timestamp, prepare_filters, prepare_insert, prepare_patch,
};
use super::{BoxFuture, RemoteStore};

type BoundQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Persistent store backed by one sqlite database. Insert notifications are fanned out to
/// subscribers of this process only.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
    fanout: Arc<InsertFanout>,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StoreResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single connection keeps `:memory:` databases alive and serialises writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!("opened sqlite store at {database_url}");
        Ok(Self {
            pool,
            database_url,
            fanout: Arc::new(InsertFanout::default()),
        })
    }

    /// Round-trips a trivial query so startup can report an unusable database early.
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-health-check",
            })?;
        Ok(())
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn subscriber_count(&self, table: Table) -> usize {
        self.fanout.active_subscribers(table)
    }

    async fn select_rows(
        &self,
        table: Table,
        filters: Vec<Filter>,
        order: Option<Order>,
    ) -> StoreResult<Vec<Row>> {
        let filters = prepare_filters(table, filters, "sqlite-select-filters")?;
        if let Some(order) = &order {
            check_order(table, order, "sqlite-select-order")?;
        }

        let sql = select_sql(table, &filters, order.as_ref());
        let mut query = sqlx::query(&sql);
        for filter in filters.iter().filter(|filter| !filter.value.is_null()) {
            let column = catalogued(table, &filter.column)?;
            query = bind_value(query, column, &filter.value);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-select-query",
            })?;

        rows.iter()
            .map(|row| sqlite_row_to_json(table, row, "sqlite-select-decode"))
            .collect()
    }

    async fn insert_row(&self, table: Table, row: Row) -> StoreResult<Row> {
        let row = prepare_insert(table, row, "sqlite-insert-prepare")?;
        let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
            stage: "sqlite-insert-acquire",
        })?;
        insert_prepared(&mut connection, table, &row, "sqlite-insert-execute").await?;

        self.fanout.publish(table, &row);
        Ok(row)
    }

    async fn upsert_row(&self, table: Table, row: Row, conflict_key: &str) -> StoreResult<Row> {
        let key = conflict_column(table, conflict_key, "sqlite-upsert-conflict-key")?;
        let patch = prepare_patch(table, row, "sqlite-upsert-prepare")?;
        let key_value = patch.get(key.name).cloned().context(MissingColumnSnafu {
            stage: "sqlite-upsert-key",
            table,
            column: key.name,
        })?;

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "sqlite-upsert-begin",
        })?;

        let existing = fetch_by_key(&mut tx, table, key, &key_value).await?;
        let (row, inserted) = match existing {
            Some(mut existing) => {
                let updates = patch
                    .into_iter()
                    .filter(|(name, _)| name != key.name)
                    .map(|(name, value)| catalogued(table, &name).map(|column| (column, value)))
                    .collect::<StoreResult<Vec<_>>>()?;

                if !updates.is_empty() {
                    let assignments = updates
                        .iter()
                        .map(|(column, _)| format!("{} = ?", column.name))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "UPDATE {} SET {} WHERE {} = ?",
                        table.name(),
                        assignments,
                        key.name
                    );
                    let mut query = sqlx::query(&sql);
                    for (column, value) in &updates {
                        query = bind_value(query, column, value);
                    }
                    query = bind_value(query, key, &key_value);
                    query.execute(&mut *tx).await.context(SqliteQuerySnafu {
                        stage: "sqlite-upsert-update",
                    })?;

                    for (column, value) in updates {
                        existing.insert(column.name.to_string(), value);
                    }
                }
                (existing, false)
            }
            None => {
                let row = prepare_insert(table, patch, "sqlite-upsert-insert-prepare")?;
                insert_prepared(&mut tx, table, &row, "sqlite-upsert-insert").await?;
                (row, true)
            }
        };

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "sqlite-upsert-commit",
        })?;

        if inserted {
            self.fanout.publish(table, &row);
        }
        Ok(row)
    }

    async fn accept_invite(&self, args: Value) -> StoreResult<Value> {
        let acceptance = InviteAcceptance::from_args(args, "sqlite-rpc-accept-invite-args")?;
        let result = sqlx::query(
            "UPDATE chat_invites SET accepted_by = ?, accepted_at = ? WHERE token = ? AND accepted_by IS NULL",
        )
        .bind(acceptance.p_user_id.to_string())
        .bind(now_timestamp())
        .bind(acceptance.p_token)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-rpc-accept-invite",
        })?;

        Ok(Value::Bool(result.rows_affected() > 0))
    }
}

impl RemoteStore for SqliteStore {
    fn select<'a>(
        &'a self,
        table: Table,
        filters: Vec<Filter>,
        order: Option<Order>,
    ) -> BoxFuture<'a, StoreResult<Vec<Row>>> {
        Box::pin(self.select_rows(table, filters, order))
    }

    fn insert<'a>(&'a self, table: Table, row: Row) -> BoxFuture<'a, StoreResult<Row>> {
        Box::pin(self.insert_row(table, row))
    }

    fn upsert<'a>(
        &'a self,
        table: Table,
        row: Row,
        conflict_key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Row>> {
        Box::pin(self.upsert_row(table, row, conflict_key))
    }

    fn rpc<'a>(&'a self, name: &'a str, args: Value) -> BoxFuture<'a, StoreResult<Value>> {
        Box::pin(async move {
            match name {
                ACCEPT_INVITE_RPC => self.accept_invite(args).await,
                _ => UnknownRpcSnafu {
                    stage: "sqlite-rpc-lookup",
                    name,
                }
                .fail(),
            }
        })
    }

    fn subscribe_to_inserts<'a>(
        &'a self,
        table: Table,
        filters: Vec<Filter>,
    ) -> BoxFuture<'a, StoreResult<Subscription>> {
        Box::pin(async move {
            let filters = prepare_filters(table, filters, "sqlite-subscribe-filters")?;
            Ok(self.fanout.subscribe(table, filters))
        })
    }
}

async fn insert_prepared(
    connection: &mut SqliteConnection,
    table: Table,
    row: &Row,
    stage: &'static str,
) -> StoreResult<()> {
    let columns = table.columns();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        column_list(table),
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for column in columns {
        query = bind_value(query, column, row.get(column.name).unwrap_or(&Value::Null));
    }

    match query.execute(connection).await {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(error)) if error.is_unique_violation() => DuplicateKeySnafu {
            stage,
            table,
            column: table.primary_key().name,
        }
        .fail(),
        Err(source) => Err(StoreError::SqliteQuery { stage, source }),
    }
}

async fn fetch_by_key(
    connection: &mut SqliteConnection,
    table: Table,
    key: &Column,
    key_value: &Value,
) -> StoreResult<Option<Row>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        column_list(table),
        table.name(),
        key.name
    );
    let row = bind_value(sqlx::query(&sql), key, key_value)
        .fetch_optional(connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "sqlite-fetch-by-key",
        })?;

    row.map(|row| sqlite_row_to_json(table, &row, "sqlite-fetch-by-key-decode"))
        .transpose()
}

fn catalogued(table: Table, name: &str) -> StoreResult<&'static Column> {
    table
        .column(name)
        .context(UnknownColumnSnafu {
            stage: "sqlite-catalogue",
            table,
            column: name.to_string(),
        })
}

fn column_list(table: Table) -> String {
    table
        .columns()
        .iter()
        .map(|column| column.name)
        .collect::<Vec<_>>()
        .join(", ")
}

// Identifiers come from the static catalogue only; every value is bound.
fn select_sql(table: Table, filters: &[Filter], order: Option<&Order>) -> String {
    let mut sql = format!("SELECT {} FROM {}", column_list(table), table.name());

    if !filters.is_empty() {
        let clauses = filters
            .iter()
            .map(|filter| {
                if filter.value.is_null() {
                    format!("{} IS NULL", filter.column)
                } else {
                    format!("{} = ?", filter.column)
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        sql.push_str(" WHERE ");
        sql.push_str(&clauses);
    }

    match order {
        Some(order) => {
            let direction = match order.direction {
                Direction::Ascending => "ASC",
                Direction::Descending => "DESC",
            };
            // rowid keeps ties in arrival order.
            sql.push_str(&format!(
                " ORDER BY {} {direction}, rowid ASC",
                order.column
            ));
        }
        None => sql.push_str(" ORDER BY rowid ASC"),
    }

    sql
}

fn bind_value<'q>(query: BoundQuery<'q>, column: &Column, value: &Value) -> BoundQuery<'q> {
    match (column.kind, value) {
        (_, Value::Null) => query.bind(None::<String>),
        (ColumnKind::Bool, Value::Bool(flag)) => query.bind(*flag),
        (_, Value::String(text)) => query.bind(text.clone()),
        (_, other) => query.bind(other.to_string()),
    }
}

fn sqlite_row_to_json(table: Table, row: &SqliteRow, stage: &'static str) -> StoreResult<Row> {
    let mut decoded = Row::new();
    for column in table.columns() {
        let value = match column.kind {
            ColumnKind::Bool => row
                .try_get::<Option<bool>, _>(column.name)
                .context(SqliteQuerySnafu { stage })?
                .map(Value::Bool),
            ColumnKind::Uuid | ColumnKind::Text | ColumnKind::Timestamp => row
                .try_get::<Option<String>, _>(column.name)
                .context(SqliteQuerySnafu { stage })?
                .map(Value::String),
        };
        decoded.insert(column.name.to_string(), value.unwrap_or(Value::Null));
    }
    Ok(decoded)
}

fn ensure_database_directory(database_location: &str) -> StoreResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ConversationId, UserId};
    use crate::types::{
        ConversationRecord, MessageRecord, MessageRole, NewConversation, NewMessage, UserRecord,
        decode_row, decode_rows,
    };
    use futures::StreamExt;
    use serde_json::json;

    async fn open_temp_store() -> (tempfile::TempDir, SqliteStore) {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("chat.sqlite3");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        (directory, store)
    }

    async fn seed_user(store: &SqliteStore, email: &str) -> UserId {
        let id = UserId::from_email(email);
        store
            .upsert(
                Table::Users,
                UserRecord {
                    id,
                    email: email.to_string(),
                }
                .into_row(),
                "id",
            )
            .await
            .unwrap();
        id
    }

    async fn seed_conversation(store: &SqliteStore, owner: UserId) -> ConversationId {
        let row = store
            .insert(
                Table::Conversations,
                NewConversation {
                    owner_user_id: owner,
                    name: "general".to_string(),
                }
                .into_row(),
            )
            .await
            .unwrap();
        decode_row::<ConversationRecord>(Table::Conversations, row)
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn health_check_passes_on_a_fresh_database() {
        let (_directory, store) = open_temp_store().await;
        store.health_check().await.unwrap();
        assert!(store.database_url().starts_with("sqlite://"));
    }

    #[tokio::test]
    async fn messages_come_back_in_timestamp_order() {
        let (_directory, store) = open_temp_store().await;
        let owner = seed_user(&store, "ada@example.com").await;
        let conversation = seed_conversation(&store, owner).await;

        for (content, created_at) in [
            ("third", "2024-01-01T00:00:03Z"),
            ("first", "2024-01-01T00:00:01Z"),
            ("second", "2024-01-01T00:00:02Z"),
        ] {
            let mut row = NewMessage {
                conversation_id: conversation,
                author_user_id: Some(owner),
                role: MessageRole::User,
                content: content.to_string(),
            }
            .into_row();
            row.insert("created_at".to_string(), json!(created_at));
            store.insert(Table::Messages, row).await.unwrap();
        }

        let rows = store
            .select(
                Table::Messages,
                vec![Filter::eq("conversation_id", conversation)],
                Some(Order::ascending("created_at")),
            )
            .await
            .unwrap();
        let messages: Vec<MessageRecord> = decode_rows(Table::Messages, rows).unwrap();
        let contents = messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn upsert_keeps_one_user_row() {
        let (_directory, store) = open_temp_store().await;
        seed_user(&store, "ada@example.com").await;
        let id = seed_user(&store, "ada@example.com").await;

        let rows = store
            .select(Table::Users, vec![Filter::eq("id", id)], None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("email"), Some(&json!("ada@example.com")));
    }

    #[tokio::test]
    async fn constraint_violations_surface_as_errors() {
        let (_directory, store) = open_temp_store().await;
        let orphan = store
            .insert(
                Table::Conversations,
                NewConversation {
                    owner_user_id: UserId::new_v7(),
                    name: "orphan".to_string(),
                }
                .into_row(),
            )
            .await;
        assert!(orphan.is_err());

        let owner = seed_user(&store, "ada@example.com").await;
        let mut duplicate = UserRecord {
            id: owner,
            email: "ada@example.com".to_string(),
        }
        .into_row();
        duplicate.insert("created_at".to_string(), json!("2024-01-01T00:00:00Z"));
        let result = store.insert(Table::Users, duplicate).await;
        assert!(matches!(result, Err(StoreError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn inserts_notify_matching_subscribers() {
        let (_directory, store) = open_temp_store().await;
        let owner = seed_user(&store, "ada@example.com").await;
        let conversation = seed_conversation(&store, owner).await;
        let mut subscription = store
            .subscribe_to_inserts(
                Table::Messages,
                vec![Filter::eq("conversation_id", conversation)],
            )
            .await
            .unwrap();

        store
            .insert(
                Table::Messages,
                NewMessage {
                    conversation_id: conversation,
                    author_user_id: None,
                    role: MessageRole::Assistant,
                    content: "hello".to_string(),
                }
                .into_row(),
            )
            .await
            .unwrap();

        let notification = subscription.next().await.expect("notification");
        assert_eq!(notification.row.get("role"), Some(&json!("assistant")));
        assert_eq!(notification.row.get("author_user_id"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn allowed_domains_and_invites_round_through_sqlite() {
        let (_directory, store) = open_temp_store().await;
        let user = seed_user(&store, "ada@example.com").await;

        let mut domain = Row::new();
        domain.insert("domain".to_string(), json!("example.com"));
        domain.insert("allowed".to_string(), json!(true));
        store
            .insert(Table::AllowedEmailDomains, domain)
            .await
            .unwrap();
        let allowed = store
            .select(
                Table::AllowedEmailDomains,
                vec![Filter::eq("allowed", true)],
                None,
            )
            .await
            .unwrap();
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].get("allowed"), Some(&json!(true)));

        let mut invite = Row::new();
        invite.insert("token".to_string(), json!("tok-1"));
        store.insert(Table::Invites, invite).await.unwrap();
        let args = InviteAcceptance {
            p_token: "tok-1".to_string(),
            p_user_id: user,
        }
        .into_args();
        assert_eq!(store.rpc(ACCEPT_INVITE_RPC, args.clone()).await.unwrap(), json!(true));
        assert_eq!(store.rpc(ACCEPT_INVITE_RPC, args).await.unwrap(), json!(false));
    }
}
