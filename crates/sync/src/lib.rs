//! Keeps a chat front-end's local view (identity, conversation list, selected conversation,
//! messages, draft) consistent with a shared remote store under push notifications.

pub mod composer;
pub mod directory;
pub mod error;
pub mod gate;
pub mod session;
pub mod stream;

pub use composer::{
    Composer, ComposerState, Key, KeyPress, Modifiers, SendTarget, SubmitOutcome,
};
pub use directory::{ConversationDirectory, DirectoryState};
pub use error::{SyncError, SyncResult};
pub use gate::{GateHandle, GateStatus, Identity, SessionGate};
pub use session::{ChatSession, SessionOptions, SessionSnapshot};
pub use stream::{MessageStream, SentMessage, StreamState};
