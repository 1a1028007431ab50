use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::{AuthBackendSnafu, StoreResult};
use super::ids::UserId;
use super::{AuthBackend, BoxFuture, lock};

const LOCAL_SESSION_LIFETIME_MINUTES: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: AuthUser,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthChange {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub change: AuthChange,
    pub session: Option<Session>,
}

/// Receiver side of an auth-state listener; dropping it unsubscribes.
#[derive(Debug)]
pub struct AuthSubscription {
    events: mpsc::UnboundedReceiver<AuthEvent>,
}

impl AuthSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<AuthEvent>) -> Self {
        Self { events }
    }

    pub async fn next(&mut self) -> Option<AuthEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.events.close();
    }
}

/// In-process auth backend: email sign-in establishes a session immediately.
#[derive(Debug, Default)]
pub struct LocalAuth {
    session: Mutex<Option<Session>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<AuthEvent>>>,
    probe_failure: Mutex<Option<String>>,
    sign_in_failure: Mutex<Option<String>>,
}

impl LocalAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with an already established session, like a persisted browser session.
    pub fn signed_in(email: &str) -> Self {
        let auth = Self::default();
        *lock(&auth.session) = Some(local_session(email));
        auth
    }

    pub fn current_session(&self) -> Option<Session> {
        lock(&self.session).clone()
    }

    /// Makes the next `get_session` call fail.
    pub fn fail_next_probe(&self, details: impl Into<String>) {
        *lock(&self.probe_failure) = Some(details.into());
    }

    /// Makes the next `sign_in_with_email` call fail.
    pub fn fail_next_sign_in(&self, details: impl Into<String>) {
        *lock(&self.sign_in_failure) = Some(details.into());
    }

    /// Re-issues the access token for the current session and notifies listeners.
    pub fn refresh_token(&self) -> Option<Session> {
        let refreshed = {
            let mut session = lock(&self.session);
            let refreshed = session.as_ref().map(|current| Session {
                user: current.user.clone(),
                access_token: Uuid::new_v4().to_string(),
                expires_at: Utc::now() + Duration::minutes(LOCAL_SESSION_LIFETIME_MINUTES),
            });
            if let Some(refreshed) = &refreshed {
                *session = Some(refreshed.clone());
            }
            refreshed
        };

        if refreshed.is_some() {
            self.publish(AuthChange::TokenRefreshed, refreshed.clone());
        }
        refreshed
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners)
            .iter()
            .filter(|listener| !listener.is_closed())
            .count()
    }

    fn publish(&self, change: AuthChange, session: Option<Session>) {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|listener| !listener.is_closed());
        for listener in listeners.iter() {
            let _ = listener.send(AuthEvent {
                change,
                session: session.clone(),
            });
        }
        tracing::debug!("published {change:?} to {} auth listener(s)", listeners.len());
    }
}

impl AuthBackend for LocalAuth {
    fn get_session<'a>(&'a self) -> BoxFuture<'a, StoreResult<Option<Session>>> {
        Box::pin(async move {
            if let Some(details) = lock(&self.probe_failure).take() {
                return AuthBackendSnafu {
                    stage: "local-auth-get-session",
                    details,
                }
                .fail();
            }
            Ok(self.current_session())
        })
    }

    fn on_auth_state_change(&self) -> AuthSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.listeners).push(sender);
        AuthSubscription::new(receiver)
    }

    fn sign_in_with_email<'a>(&'a self, email: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            if let Some(details) = lock(&self.sign_in_failure).take() {
                return AuthBackendSnafu {
                    stage: "local-auth-sign-in",
                    details,
                }
                .fail();
            }

            let session = local_session(email);
            *lock(&self.session) = Some(session.clone());
            tracing::info!("local session established for {}", session.user.id);
            self.publish(AuthChange::SignedIn, Some(session));
            Ok(())
        })
    }

    fn sign_out<'a>(&'a self) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let previous = lock(&self.session).take();
            if previous.is_some() {
                self.publish(AuthChange::SignedOut, None);
            }
            Ok(())
        })
    }
}

fn local_session(email: &str) -> Session {
    let email = email.trim().to_lowercase();
    Session {
        user: AuthUser {
            id: UserId::from_email(&email),
            email: Some(email),
        },
        access_token: Uuid::new_v4().to_string(),
        expires_at: Utc::now() + Duration::minutes(LOCAL_SESSION_LIFETIME_MINUTES),
    }
}
