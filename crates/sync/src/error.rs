use chorus_store::StoreError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("could not determine the current session: {source}"))]
    Initialization {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("{details}"))]
    Auth {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("sign in before sending messages"))]
    NotAuthenticated { stage: &'static str },
    #[snafu(display("{source}"))]
    RemoteCall {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("{source}"))]
    Decode {
        stage: &'static str,
        source: StoreError,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;
