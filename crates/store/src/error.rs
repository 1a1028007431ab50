use snafu::Snafu;

use super::types::Table;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("row id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("column '{column}' does not exist on '{table}'"))]
    UnknownColumn {
        stage: &'static str,
        table: Table,
        column: String,
    },
    #[snafu(display("null value in column '{column}' of '{table}' violates not-null constraint"))]
    MissingColumn {
        stage: &'static str,
        table: Table,
        column: &'static str,
    },
    #[snafu(display("invalid value for '{table}.{column}': {details}"))]
    InvalidValue {
        stage: &'static str,
        table: Table,
        column: &'static str,
        details: String,
    },
    #[snafu(display("'{column}' is not a unique key of '{table}'"))]
    UnsupportedConflictKey {
        stage: &'static str,
        table: Table,
        column: String,
    },
    #[snafu(display("duplicate key value violates unique constraint on '{table}.{column}'"))]
    DuplicateKey {
        stage: &'static str,
        table: Table,
        column: &'static str,
    },
    #[snafu(display("'{table}.{column}' references a missing row in '{referenced}'"))]
    ForeignKey {
        stage: &'static str,
        table: Table,
        column: &'static str,
        referenced: Table,
    },
    #[snafu(display("function '{name}' does not exist"))]
    UnknownRpc { stage: &'static str, name: String },
    #[snafu(display("invalid arguments for function '{name}': {details}"))]
    RpcArguments {
        stage: &'static str,
        name: String,
        details: String,
    },
    #[snafu(display("row from '{table}' does not match the expected shape: {source}"))]
    DecodeRow {
        stage: &'static str,
        table: Table,
        source: serde_json::Error,
    },
    #[snafu(display("remote call failed on `{stage}`: {details}"))]
    Transport {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("auth backend failed on `{stage}`: {details}"))]
    AuthBackend {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
