mod config;
mod terminal;

use std::sync::Arc;

use chorus_store::{
    ConversationId, LocalAuth, RemoteStore, Row, SqliteStore, StoreError, Table,
};
use chorus_sync::{ChatSession, Key, KeyPress, SessionOptions, StreamState, SubmitOutcome};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::{AppSettings, SettingsStore};
use crate::terminal::{Command, conversation_at, render_channels, render_messages, render_status};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to open the message store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("failed to seed allowed domains on `{stage}`: {source}"))]
    SeedDomains {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main]
async fn main() {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    init_tracing(&settings);
    tracing::debug!("settings loaded from {:?}", settings_store.config_path());

    if let Err(error) = run(&settings_store, &settings).await {
        tracing::error!("{error}");
        eprintln!("chorus: {error}");
        std::process::exit(1);
    }
}

fn init_tracing(settings: &AppSettings) {
    let filter = settings
        .log_filter
        .as_deref()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(settings_store: &SettingsStore, settings: &AppSettings) -> AppResult<()> {
    let store = SqliteStore::open(&settings.database_url)
        .await
        .context(OpenStoreSnafu {
            stage: "open-sqlite-store",
        })?;
    match store.health_check().await {
        Ok(()) => tracing::info!("store reachable at {}", store.database_url()),
        Err(error) => tracing::error!("store health check failed: {error}"),
    }
    seed_allowed_domains(&store, &settings.allowed_domains).await?;

    let auth = Arc::new(LocalAuth::new());
    let session = ChatSession::start(
        Arc::new(store),
        auth,
        SessionOptions {
            default_channel_name: settings.default_channel_name.clone(),
        },
    );
    let renderer = spawn_renderer(&session);

    if let Some(email) = &settings.email
        && let Err(error) = session.gate().sign_in_with_email(email).await
    {
        println!("sign-in failed: {error}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-stdin-line",
    })? {
        if !handle_line(&session, settings_store, &line).await {
            break;
        }
    }

    renderer.abort();
    tracing::info!("terminal session closed");
    Ok(())
}

async fn seed_allowed_domains(store: &SqliteStore, domains: &[String]) -> AppResult<()> {
    for domain in domains {
        let mut row = Row::new();
        row.insert("domain".to_string(), Value::String(domain.clone()));
        row.insert("allowed".to_string(), Value::Bool(true));
        store
            .upsert(Table::AllowedEmailDomains, row, "domain")
            .await
            .context(SeedDomainsSnafu {
                stage: "upsert-allowed-domain",
            })?;
    }
    if !domains.is_empty() {
        tracing::info!("allow list seeded with {} domain(s)", domains.len());
    }
    Ok(())
}

/// Returns false once the user asked to quit.
async fn handle_line(session: &ChatSession, settings_store: &SettingsStore, line: &str) -> bool {
    match Command::parse(line) {
        Command::Empty => {}
        Command::Quit => return false,
        Command::Invalid(message) => println!("{message}"),
        Command::Login(email) => match session.gate().sign_in_with_email(&email).await {
            Ok(()) => {
                println!("signing in {email}...");
                remember_email(settings_store, Some(email));
            }
            Err(error) => println!("sign-in failed: {error}"),
        },
        Command::Logout => match session.gate().sign_out().await {
            Ok(()) => remember_email(settings_store, None),
            Err(error) => println!("sign-out failed: {error}"),
        },
        Command::New(name) => {
            let name =
                name.unwrap_or_else(|| settings_store.settings().default_channel_name.clone());
            match session.new_channel(&name).await {
                Ok(_) => println!("created {name}"),
                Err(error) => println!("could not create channel: {error}"),
            }
        }
        Command::Channels => println!("{}", render_channels(&session.directory().snapshot())),
        Command::Switch(index) => {
            match conversation_at(&session.directory().snapshot(), index) {
                Some(conversation_id) => session.select(conversation_id),
                None => println!("no channel {index}; see /channels"),
            }
        }
        Command::Invite(token) => match session.gate().accept_invite(&token).await {
            Ok(true) => println!("invite accepted"),
            Ok(false) => println!("invite is unknown or already used"),
            Err(error) => println!("could not accept invite: {error}"),
        },
        Command::Message(text) => {
            session.composer().set_draft(text);
            match session.composer().handle_key(KeyPress::plain(Key::Enter)).await {
                Some(SubmitOutcome::Failed(message)) => println!("not sent: {message}"),
                Some(SubmitOutcome::Sent | SubmitOutcome::Skipped) | None => {}
            }
        }
    }
    true
}

fn remember_email(settings_store: &SettingsStore, email: Option<String>) {
    if let Err(error) = settings_store.remember_email(email) {
        tracing::warn!("could not save the signed-in address: {error}");
    }
}

/// Prints gate transitions and newly arrived messages as they are published.
fn spawn_renderer(session: &ChatSession) -> JoinHandle<()> {
    let mut gate = session.gate().watch();
    let mut stream = session.stream().watch();

    tokio::spawn(async move {
        let mut shown: (Option<ConversationId>, usize) = (None, 0);
        println!("{}", render_status(&gate.borrow_and_update()));

        loop {
            tokio::select! {
                changed = gate.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    println!("{}", render_status(&gate.borrow_and_update()));
                }
                changed = stream.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = stream.borrow_and_update().clone();
                    shown = render_stream_update(&state, shown);
                }
            }
        }
    })
}

fn render_stream_update(
    state: &StreamState,
    (conversation_id, printed): (Option<ConversationId>, usize),
) -> (Option<ConversationId>, usize) {
    if state.loading {
        return (conversation_id, printed);
    }
    if let Some(error) = &state.last_error {
        println!("! {error}");
    }

    let skip = if state.conversation_id == conversation_id {
        printed.min(state.messages.len())
    } else {
        if let Some(id) = state.conversation_id {
            println!("-- conversation {id} --");
        }
        0
    };
    let rendered = render_messages(state, skip);
    if !rendered.is_empty() {
        println!("{rendered}");
    }
    (state.conversation_id, state.messages.len())
}
