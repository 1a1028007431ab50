use std::fmt::Write as _;

use chorus_store::{ConversationId, MessageRole};
use chorus_sync::{DirectoryState, GateStatus, StreamState};

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(String),
    Logout,
    New(Option<String>),
    Channels,
    Switch(usize),
    Invite(String),
    Quit,
    Message(String),
    Empty,
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        if !trimmed.starts_with('/') {
            return Self::Message(line.to_string());
        }

        let (name, rest) = trimmed
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((trimmed, ""));

        match name {
            "/login" if !rest.is_empty() => Self::Login(rest.to_string()),
            "/login" => Self::Invalid("usage: /login <email>".to_string()),
            "/logout" => Self::Logout,
            "/new" if rest.is_empty() => Self::New(None),
            "/new" => Self::New(Some(rest.to_string())),
            "/channels" => Self::Channels,
            "/switch" => match rest.parse::<usize>() {
                Ok(index) if index > 0 => Self::Switch(index),
                _ => Self::Invalid("usage: /switch <number from /channels>".to_string()),
            },
            "/invite" if !rest.is_empty() => Self::Invite(rest.to_string()),
            "/invite" => Self::Invalid("usage: /invite <token>".to_string()),
            "/quit" | "/exit" => Self::Quit,
            other => Self::Invalid(format!("unknown command {other}")),
        }
    }
}

/// Maps a 1-based `/switch` index onto the listed conversations.
pub fn conversation_at(directory: &DirectoryState, index: usize) -> Option<ConversationId> {
    let position = index.checked_sub(1)?;
    directory
        .conversations
        .get(position)
        .map(|conversation| conversation.id)
}

pub fn render_status(status: &GateStatus) -> String {
    match status {
        GateStatus::Loading => "checking session...".to_string(),
        GateStatus::Unauthenticated => "signed out. use /login <email>".to_string(),
        GateStatus::Authenticated(identity) => format!("signed in as {}", identity.email),
        GateStatus::InitializationFailed(message) => {
            format!("could not check session: {message}")
        }
    }
}

pub fn render_channels(directory: &DirectoryState) -> String {
    if directory.conversations.is_empty() {
        return "no channels yet. send a message or use /new".to_string();
    }

    let mut output = String::new();
    for (index, conversation) in directory.conversations.iter().enumerate() {
        let marker = if directory.selected == Some(conversation.id) {
            '*'
        } else {
            ' '
        };
        let _ = writeln!(
            output,
            "{marker} {}. {} ({})",
            index + 1,
            conversation.name,
            conversation.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    output.truncate(output.trim_end().len());
    output
}

/// Renders messages from `skip` onwards.
pub fn render_messages(stream: &StreamState, skip: usize) -> String {
    stream
        .messages
        .iter()
        .skip(skip)
        .map(|message| {
            let speaker = match message.role {
                MessageRole::User => "you",
                MessageRole::Assistant => "assistant",
            };
            let body = message.content.replace('\n', "\n    ");
            format!("[{}] {speaker}: {body}", message.created_at.format("%H:%M:%S"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
