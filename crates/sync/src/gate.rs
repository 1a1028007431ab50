use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chorus_store::{
    ACCEPT_INVITE_RPC, AllowedDomainRecord, AuthBackend, AuthChange, AuthEvent, Filter,
    InviteAcceptance, RemoteStore, Session, Table, UserId, UserRecord, decode_rows,
};
use snafu::{OptionExt, ResultExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{
    AuthSnafu, DecodeSnafu, InitializationSnafu, NotAuthenticatedSnafu, RemoteCallSnafu,
    SyncResult,
};

/// The authenticated user as seen by the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
}

impl Identity {
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: session.user.id,
            email: session.user.email.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Loading,
    Unauthenticated,
    Authenticated(Identity),
    InitializationFailed(String),
}

impl GateStatus {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Keeps the task following auth events alive; dropping it stops the gate.
#[derive(Debug)]
pub struct GateHandle {
    task: JoinHandle<()>,
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct SessionGate {
    auth: Arc<dyn AuthBackend>,
    store: Arc<dyn RemoteStore>,
    status: watch::Sender<GateStatus>,
    /// User whose record is known to exist in the store.
    recorded_user: Mutex<Option<UserId>>,
}

impl SessionGate {
    pub fn new(auth: Arc<dyn AuthBackend>, store: Arc<dyn RemoteStore>) -> Self {
        let (status, _) = watch::channel(GateStatus::Loading);
        Self {
            auth,
            store,
            status,
            recorded_user: Mutex::new(None),
        }
    }

    /// Probes the auth backend once. A failed probe is an error, not "signed out".
    pub async fn current_identity(&self) -> SyncResult<Option<Identity>> {
        let session = self
            .auth
            .get_session()
            .await
            .context(InitializationSnafu {
                stage: "gate-probe-session",
            })?;
        Ok(session.as_ref().map(Identity::from_session))
    }

    pub fn watch(&self) -> watch::Receiver<GateStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> GateStatus {
        self.status.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.status.borrow().identity().cloned()
    }

    /// The current identity, once its user record is in the store. A record that failed to
    /// upsert when the identity was published is retried here, so writes never reference a
    /// missing user.
    pub async fn writer_identity(&self, stage: &'static str) -> SyncResult<Identity> {
        let identity = self.identity().context(NotAuthenticatedSnafu { stage })?;
        let recorded = *self.recorded_user() == Some(identity.id);
        if !recorded {
            self.ensure_user_record(&identity).await?;
        }
        Ok(identity)
    }

    /// Runs the initial probe and then follows auth events until the handle is dropped.
    pub fn start(self: &Arc<Self>) -> GateHandle {
        // Listen before probing so a sign-in racing the probe is not lost.
        let mut events = self.auth.on_auth_state_change();
        let gate = Arc::clone(self);
        let task = tokio::spawn(async move {
            gate.initialize().await;
            while let Some(event) = events.next().await {
                gate.apply_event(event).await;
            }
            tracing::debug!("auth event stream closed");
        });
        GateHandle { task }
    }

    pub async fn initialize(&self) {
        self.status.send_replace(GateStatus::Loading);
        match self.current_identity().await {
            Ok(Some(identity)) => self.publish_identity(identity).await,
            Ok(None) => {
                self.status.send_replace(GateStatus::Unauthenticated);
            }
            Err(error) => {
                tracing::error!("session probe failed: {error}");
                self.status
                    .send_replace(GateStatus::InitializationFailed(error.to_string()));
            }
        }
    }

    pub async fn apply_event(&self, event: AuthEvent) {
        tracing::debug!("auth event {:?}", event.change);
        match (event.change, event.session) {
            (AuthChange::SignedOut, _) | (_, None) => {
                self.status.send_replace(GateStatus::Unauthenticated);
            }
            (AuthChange::SignedIn | AuthChange::TokenRefreshed, Some(session)) => {
                self.publish_identity(Identity::from_session(&session)).await;
            }
        }
    }

    async fn publish_identity(&self, identity: Identity) {
        if let Err(error) = self.ensure_user_record(&identity).await {
            // Reads may go ahead; writes retry the upsert through `writer_identity`.
            tracing::warn!("could not upsert user record for {}: {error}", identity.id);
        }
        self.status
            .send_replace(GateStatus::Authenticated(identity));
    }

    pub async fn ensure_user_record(&self, identity: &Identity) -> SyncResult<()> {
        let record = UserRecord {
            id: identity.id,
            email: identity.email.clone(),
        };
        let upserted = self
            .store
            .upsert(Table::Users, record.into_row(), "id")
            .await
            .context(RemoteCallSnafu {
                stage: "gate-upsert-user",
            });

        let mut recorded = self.recorded_user();
        match upserted {
            Ok(_) => {
                *recorded = Some(identity.id);
                Ok(())
            }
            Err(error) => {
                if *recorded == Some(identity.id) {
                    *recorded = None;
                }
                Err(error)
            }
        }
    }

    fn recorded_user(&self) -> MutexGuard<'_, Option<UserId>> {
        self.recorded_user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks the allow-listed domains, then asks the backend to start an email sign-in.
    pub async fn sign_in_with_email(&self, email: &str) -> SyncResult<()> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return AuthSnafu {
                stage: "gate-sign-in-email",
                details: "Enter an email address.",
            }
            .fail();
        }

        let rows = self
            .store
            .select(
                Table::AllowedEmailDomains,
                vec![Filter::eq("allowed", true)],
                None,
            )
            .await
            .context(RemoteCallSnafu {
                stage: "gate-sign-in-domains",
            })?;
        let domains: Vec<AllowedDomainRecord> =
            decode_rows(Table::AllowedEmailDomains, rows).context(DecodeSnafu {
                stage: "gate-sign-in-domains-decode",
            })?;

        let allowed = domains
            .iter()
            .any(|record| email.ends_with(&record.domain.to_lowercase()));
        if !allowed {
            tracing::info!("rejected sign-in for a domain outside the allow list");
            return AuthSnafu {
                stage: "gate-sign-in-domain-check",
                details: "Email domain is not allowed. Contact your administrator.",
            }
            .fail();
        }

        self.auth
            .sign_in_with_email(&email)
            .await
            .map_err(|error| {
                AuthSnafu {
                    stage: "gate-sign-in-backend",
                    details: error.to_string(),
                }
                .build()
            })
    }

    /// Redeems an invitation for the signed-in user. Returns whether the token was accepted.
    pub async fn accept_invite(&self, token: &str) -> SyncResult<bool> {
        let identity = self.writer_identity("gate-accept-invite").await?;

        let args = InviteAcceptance {
            p_token: token.trim().to_string(),
            p_user_id: identity.id,
        }
        .into_args();
        let accepted = self
            .store
            .rpc(ACCEPT_INVITE_RPC, args)
            .await
            .context(RemoteCallSnafu {
                stage: "gate-accept-invite-rpc",
            })?;
        Ok(accepted.as_bool().unwrap_or(false))
    }

    pub async fn sign_out(&self) -> SyncResult<()> {
        self.auth.sign_out().await.map_err(|error| {
            AuthSnafu {
                stage: "gate-sign-out",
                details: error.to_string(),
            }
            .build()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_store::{LocalAuth, MemoryStore, StoreOp};
    use serde_json::json;
    use std::time::Duration;

    fn gate_with(auth: Arc<LocalAuth>, store: MemoryStore) -> Arc<SessionGate> {
        Arc::new(SessionGate::new(auth, Arc::new(store)))
    }

    async fn wait_for_status(
        receiver: &mut watch::Receiver<GateStatus>,
        predicate: impl FnMut(&GateStatus) -> bool,
    ) -> GateStatus {
        tokio::time::timeout(Duration::from_secs(2), receiver.wait_for(predicate))
            .await
            .expect("status in time")
            .expect("gate alive")
            .clone()
    }

    async fn seed(store: &MemoryStore, table: Table, value: serde_json::Value) {
        let serde_json::Value::Object(row) = value else {
            panic!("expected an object row");
        };
        store.insert(table, row).await.unwrap();
    }

    #[tokio::test]
    async fn probe_failure_is_not_unauthenticated() {
        let auth = Arc::new(LocalAuth::signed_in("ada@example.com"));
        auth.fail_next_probe("network unreachable");
        let gate = gate_with(Arc::clone(&auth), MemoryStore::new());

        assert!(gate.current_identity().await.is_err());
        assert!(gate.current_identity().await.unwrap().is_some());

        auth.fail_next_probe("network unreachable");
        gate.initialize().await;
        assert!(matches!(
            gate.status(),
            GateStatus::InitializationFailed(_)
        ));
    }

    #[tokio::test]
    async fn identity_upsert_is_idempotent() {
        let auth = Arc::new(LocalAuth::signed_in("ada@example.com"));
        let store = MemoryStore::new();
        let gate = gate_with(Arc::clone(&auth), store.clone());
        let mut status = gate.watch();
        let _handle = gate.start();

        wait_for_status(&mut status, |status| status.identity().is_some()).await;
        auth.refresh_token();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.count_calls(StoreOp::Upsert, Table::Users) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("second upsert");

        let users = store.rows(Table::Users);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].get("email"), Some(&json!("ada@example.com")));
        assert_eq!(
            gate.identity().map(|identity| identity.id),
            Some(UserId::from_email("ada@example.com"))
        );
    }

    #[tokio::test]
    async fn writes_wait_for_the_user_record() {
        let auth = Arc::new(LocalAuth::signed_in("ada@example.com"));
        let store = MemoryStore::new();
        store.fail_next(StoreOp::Upsert, Some(Table::Users), "write refused");
        let gate = gate_with(auth, store.clone());

        gate.initialize().await;
        assert!(gate.identity().is_some());
        assert!(store.rows(Table::Users).is_empty());

        store.fail_next(StoreOp::Upsert, Some(Table::Users), "still refused");
        assert!(matches!(
            gate.writer_identity("test-write").await,
            Err(crate::SyncError::RemoteCall { .. })
        ));
        assert!(store.rows(Table::Users).is_empty());

        let writer = gate.writer_identity("test-write").await.unwrap();
        assert_eq!(writer.id, UserId::from_email("ada@example.com"));
        assert_eq!(store.rows(Table::Users).len(), 1);

        let upserts = store.count_calls(StoreOp::Upsert, Table::Users);
        gate.writer_identity("test-write").await.unwrap();
        assert_eq!(store.count_calls(StoreOp::Upsert, Table::Users), upserts);
    }

    #[tokio::test]
    async fn sign_in_follows_domain_allow_list() {
        let auth = Arc::new(LocalAuth::new());
        let store = MemoryStore::new();
        seed(
            &store,
            Table::AllowedEmailDomains,
            json!({"domain": "example.com", "allowed": true}),
        )
        .await;
        let gate = gate_with(Arc::clone(&auth), store.clone());
        let mut status = gate.watch();
        let _handle = gate.start();
        wait_for_status(&mut status, |status| *status == GateStatus::Unauthenticated).await;

        let rejected = gate.sign_in_with_email("eve@elsewhere.org").await;
        assert!(matches!(rejected, Err(crate::SyncError::Auth { .. })));
        assert!(auth.current_session().is_none());

        gate.sign_in_with_email(" Ada@Example.com").await.unwrap();
        let signed_in = wait_for_status(&mut status, |status| status.identity().is_some()).await;
        assert_eq!(
            signed_in.identity().map(|identity| identity.email.as_str()),
            Some("ada@example.com")
        );

        gate.sign_out().await.unwrap();
        wait_for_status(&mut status, |status| *status == GateStatus::Unauthenticated).await;
    }

    #[tokio::test]
    async fn accept_invite_requires_identity() {
        let store = MemoryStore::new();
        seed(&store, Table::Invites, json!({"token": "tok-1"})).await;
        let gate = gate_with(Arc::new(LocalAuth::new()), store.clone());
        gate.initialize().await;
        assert!(matches!(
            gate.accept_invite("tok-1").await,
            Err(crate::SyncError::NotAuthenticated { .. })
        ));

        let gate = gate_with(Arc::new(LocalAuth::signed_in("ada@example.com")), store.clone());
        gate.initialize().await;
        assert!(gate.accept_invite("tok-1").await.unwrap());
        assert!(!gate.accept_invite("tok-1").await.unwrap());
        assert_eq!(store.rows(Table::Users).len(), 1);
    }
}
