use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt};
use uuid::Uuid;

use super::error::{
    DecodeRowSnafu, InvalidValueSnafu, MissingColumnSnafu, RpcArgumentsSnafu, StoreResult,
    UnknownColumnSnafu, UnsupportedConflictKeySnafu,
};
use super::ids::{ConversationId, MessageId, UserId};

/// One row as exchanged with the remote store: a JSON object keyed by column name.
pub type Row = Map<String, Value>;

/// Name given to conversations created without an explicit name.
pub const DEFAULT_CHANNEL_NAME: &str = "New Channel";

/// Remote procedure that redeems an invitation token for a user.
pub const ACCEPT_INVITE_RPC: &str = "accept_invite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Users,
    Conversations,
    Messages,
    AllowedEmailDomains,
    Invites,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Users,
        Table::Conversations,
        Table::Messages,
        Table::AllowedEmailDomains,
        Table::Invites,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Users => "chat_users",
            Self::Conversations => "chat_conversations",
            Self::Messages => "chat_messages",
            Self::AllowedEmailDomains => "allowed_email_domains",
            Self::Invites => "chat_invites",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.name() == name)
    }

    pub fn columns(self) -> &'static [Column] {
        match self {
            Self::Users => &USER_COLUMNS,
            Self::Conversations => &CONVERSATION_COLUMNS,
            Self::Messages => &MESSAGE_COLUMNS,
            Self::AllowedEmailDomains => &ALLOWED_DOMAIN_COLUMNS,
            Self::Invites => &INVITE_COLUMNS,
        }
    }

    pub fn column(self, name: &str) -> Option<&'static Column> {
        self.columns().iter().find(|column| column.name == name)
    }

    pub fn primary_key(self) -> &'static Column {
        // Every catalogued table declares its key first.
        &self.columns()[0]
    }
}

impl fmt::Display for Table {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uuid,
    Text,
    Bool,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    NewUuid,
    Now,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub default: Option<ColumnDefault>,
    pub references: Option<Table>,
}

impl Column {
    const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
            default: None,
            references: None,
        }
    }

    const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    const fn default_to(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    const fn references(mut self, table: Table) -> Self {
        self.references = Some(table);
        self
    }
}

static USER_COLUMNS: [Column; 3] = [
    Column::new("id", ColumnKind::Uuid),
    Column::new("email", ColumnKind::Text),
    Column::new("created_at", ColumnKind::Timestamp).default_to(ColumnDefault::Now),
];

static CONVERSATION_COLUMNS: [Column; 4] = [
    Column::new("id", ColumnKind::Uuid).default_to(ColumnDefault::NewUuid),
    Column::new("owner_user_id", ColumnKind::Uuid).references(Table::Users),
    Column::new("name", ColumnKind::Text),
    Column::new("created_at", ColumnKind::Timestamp).default_to(ColumnDefault::Now),
];

static MESSAGE_COLUMNS: [Column; 6] = [
    Column::new("id", ColumnKind::Uuid).default_to(ColumnDefault::NewUuid),
    Column::new("conversation_id", ColumnKind::Uuid).references(Table::Conversations),
    Column::new("author_user_id", ColumnKind::Uuid)
        .nullable()
        .references(Table::Users),
    Column::new("role", ColumnKind::Text),
    Column::new("content", ColumnKind::Text),
    Column::new("created_at", ColumnKind::Timestamp).default_to(ColumnDefault::Now),
];

static ALLOWED_DOMAIN_COLUMNS: [Column; 2] = [
    Column::new("domain", ColumnKind::Text),
    Column::new("allowed", ColumnKind::Bool),
];

static INVITE_COLUMNS: [Column; 4] = [
    Column::new("token", ColumnKind::Text),
    Column::new("accepted_by", ColumnKind::Uuid)
        .nullable()
        .references(Table::Users),
    Column::new("accepted_at", ColumnKind::Timestamp).nullable(),
    Column::new("created_at", ColumnKind::Timestamp).default_to(ColumnDefault::Now),
];

/// Column equality predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column).unwrap_or(&Value::Null) == &self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

impl Order {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Descending,
        }
    }

    /// Compares two rows on the order column. Callers use a stable sort, so equal keys keep
    /// insertion order.
    pub fn compare(&self, left: &Row, right: &Row) -> Ordering {
        let ordering = compare_values(left.get(&self.column), right.get(&self.column));
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::String(left)), Some(Value::String(right))) => left.cmp(right),
        (Some(Value::Number(left)), Some(Value::Number(right))) => {
            let left = left.as_f64().unwrap_or_default();
            let right = right.as_f64().unwrap_or_default();
            left.partial_cmp(&right).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Bool(left)), Some(Value::Bool(right))) => left.cmp(right),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Canonical wire form: RFC 3339 in UTC with microseconds, so text order is time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

fn normalize_value(
    table: Table,
    column: &'static Column,
    value: Value,
    stage: &'static str,
) -> StoreResult<Value> {
    if value.is_null() {
        if column.nullable {
            return Ok(Value::Null);
        }
        return MissingColumnSnafu {
            stage,
            table,
            column: column.name,
        }
        .fail();
    }

    match (column.kind, value) {
        (ColumnKind::Text, Value::String(text)) => Ok(Value::String(text)),
        (ColumnKind::Bool, Value::Bool(flag)) => Ok(Value::Bool(flag)),
        (ColumnKind::Uuid, Value::String(raw)) => match Uuid::parse_str(&raw) {
            Ok(parsed) => Ok(Value::String(parsed.to_string())),
            Err(error) => InvalidValueSnafu {
                stage,
                table,
                column: column.name,
                details: format!("'{raw}' is not a uuid: {error}"),
            }
            .fail(),
        },
        (ColumnKind::Timestamp, Value::String(raw)) => match DateTime::parse_from_rfc3339(&raw) {
            Ok(parsed) => Ok(Value::String(format_timestamp(parsed.with_timezone(&Utc)))),
            Err(error) => InvalidValueSnafu {
                stage,
                table,
                column: column.name,
                details: format!("'{raw}' is not an RFC 3339 timestamp: {error}"),
            }
            .fail(),
        },
        (kind, other) => InvalidValueSnafu {
            stage,
            table,
            column: column.name,
            details: format!("expected {kind:?}, got {other}"),
        }
        .fail(),
    }
}

fn catalogued_column(
    table: Table,
    name: &str,
    stage: &'static str,
) -> StoreResult<&'static Column> {
    table.column(name).context(UnknownColumnSnafu {
        stage,
        table,
        column: name.to_string(),
    })
}

/// Validates and normalises the provided columns only.
pub(crate) fn prepare_patch(table: Table, row: Row, stage: &'static str) -> StoreResult<Row> {
    let mut prepared = Row::new();
    for (name, value) in row {
        let column = catalogued_column(table, &name, stage)?;
        prepared.insert(name, normalize_value(table, column, value, stage)?);
    }
    Ok(prepared)
}

/// Produces a complete row: every catalogued column is present, defaults are filled and
/// required columns are enforced.
pub(crate) fn prepare_insert(table: Table, row: Row, stage: &'static str) -> StoreResult<Row> {
    let mut provided = prepare_patch(table, row, stage)?;
    let mut prepared = Row::new();
    for column in table.columns() {
        let value = match provided.remove(column.name) {
            Some(value) => value,
            None => match column.default {
                Some(ColumnDefault::NewUuid) => Value::String(Uuid::now_v7().to_string()),
                Some(ColumnDefault::Now) => Value::String(now_timestamp()),
                None => normalize_value(table, column, Value::Null, stage)?,
            },
        };
        prepared.insert(column.name.to_string(), value);
    }
    Ok(prepared)
}

pub(crate) fn prepare_filters(
    table: Table,
    filters: Vec<Filter>,
    stage: &'static str,
) -> StoreResult<Vec<Filter>> {
    filters
        .into_iter()
        .map(|filter| {
            let column = catalogued_column(table, &filter.column, stage)?;
            let value = match filter.value {
                Value::Null => Value::Null,
                value => normalize_value(table, column, value, stage)?,
            };
            Ok(Filter {
                column: filter.column,
                value,
            })
        })
        .collect()
}

pub(crate) fn check_order(table: Table, order: &Order, stage: &'static str) -> StoreResult<()> {
    catalogued_column(table, &order.column, stage).map(|_| ())
}

pub(crate) fn conflict_column(
    table: Table,
    conflict_key: &str,
    stage: &'static str,
) -> StoreResult<&'static Column> {
    let key = table.primary_key();
    if key.name != conflict_key {
        return UnsupportedConflictKeySnafu {
            stage,
            table,
            column: conflict_key.to_string(),
        }
        .fail();
    }
    Ok(key)
}

pub fn decode_row<T: DeserializeOwned>(table: Table, row: Row) -> StoreResult<T> {
    serde_json::from_value(Value::Object(row)).context(DecodeRowSnafu {
        stage: "decode-row",
        table,
    })
}

pub fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Row>) -> StoreResult<Vec<T>> {
    rows.into_iter().map(|row| decode_row(table, row)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
}

impl UserRecord {
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), self.id.into());
        row.insert("email".to_string(), Value::String(self.email));
        row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub owner_user_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub owner_user_id: UserId,
    pub name: String,
}

impl NewConversation {
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("owner_user_id".to_string(), self.owner_user_id.into());
        row.insert("name".to_string(), Value::String(self.name));
        row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author_user_id: Option<UserId>,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub author_user_id: Option<UserId>,
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("conversation_id".to_string(), self.conversation_id.into());
        row.insert(
            "author_user_id".to_string(),
            self.author_user_id.map(Value::from).unwrap_or(Value::Null),
        );
        row.insert(
            "role".to_string(),
            Value::String(self.role.as_str().to_string()),
        );
        row.insert("content".to_string(), Value::String(self.content));
        row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedDomainRecord {
    pub domain: String,
    pub allowed: bool,
}

/// Arguments of the invite redemption procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteAcceptance {
    pub p_token: String,
    pub p_user_id: UserId,
}

impl InviteAcceptance {
    pub fn into_args(self) -> Value {
        serde_json::json!({
            "p_token": self.p_token,
            "p_user_id": self.p_user_id,
        })
    }

    pub(crate) fn from_args(args: Value, stage: &'static str) -> StoreResult<Self> {
        serde_json::from_value(args).map_err(|error| {
            RpcArgumentsSnafu {
                stage,
                name: ACCEPT_INVITE_RPC,
                details: error.to_string(),
            }
            .build()
        })
    }
}
