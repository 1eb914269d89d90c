//! securechat - peer-to-peer encrypted chat over TLS
//!
//! The core is [`TlsEngine`], a blocking connection engine that drives one
//! [`ConnectionContext`] through client connect or server listen, accept,
//! handshake, message exchange and teardown. Every operation reports failures
//! both as an [`Error`] and as human-readable text in the context's
//! diagnostics.
//!
//! [`ChatSession`] adds a lock-guarded shared context with a background worker
//! that delivers incoming messages as [`SessionEvent`]s.
//!
//! Certificate material is read from `$HOME/.securechat/` unless configured
//! otherwise. See [`EngineSettings`] for configuration keys.

pub(crate) mod config;
pub(crate) mod context;
pub(crate) mod credentials;
pub(crate) mod error;
pub(crate) mod session;
pub(crate) mod transport;

// These are the intended public API
pub use context::{
    ConnectionContext, Role, Secret, Status, StatusCell, CERT_DIR_NAME, INCOMING_CAPACITY,
    SECRET_CAPACITY,
};
pub use credentials::{CredentialProvider, StaticPassphrase, PLACEHOLDER_PASSPHRASE};
pub use error::Error;
pub use session::{ChatSession, SessionEvent};
pub use transport::{
    CertMaterial, CipherPolicy, EngineSettings, HandshakeSummary, ListenOutcome, ReadOutcome,
    TlsEngine, CIPHER_BLACKLIST_ENV, DEFAULT_CIPHER_BLACKLIST, SERVER_CERT_FILE, SERVER_KEY_FILE,
    TRUST_STORE_FILE,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::context::{ConnectionContext, Role, Status};
    pub use crate::error::Error;
    pub use crate::session::{ChatSession, SessionEvent};
    pub use crate::transport::{EngineSettings, ListenOutcome, ReadOutcome, TlsEngine};
}
