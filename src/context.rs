//! Connection context: configuration, lifecycle status, diagnostics and the
//! resource handles of one chat session.
//!
//! A [`ConnectionContext`] is plain data plus small mutators. All behavior
//! lives in [`TlsEngine`](crate::TlsEngine), which operates on the context by
//! mutable reference. The context exclusively owns the four resource handles;
//! dropping them (via [`TlsEngine::clean_context`](crate::TlsEngine::clean_context)
//! or by dropping the context) releases the underlying sockets and TLS state.

use crate::credentials::CredentialProvider;
use crate::error::Error;
use crate::transport::{HandshakeSummary, SessionConfig, TlsConnection};
use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

/// Capacity of the passphrase buffer in bytes.
pub const SECRET_CAPACITY: usize = 256;

/// Capacity of the incoming buffer. One slot is reserved, so a single read
/// delivers at most `INCOMING_CAPACITY - 1` bytes.
pub const INCOMING_CAPACITY: usize = 256;

/// Name of the certificate-material directory under the home directory.
pub const CERT_DIR_NAME: &str = ".securechat";

pub(crate) const ERROR_PROMPT: &str = "Error:---> ";

/// Operating role of the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the connection.
    Client,
    /// Listens for one incoming peer.
    Server,
    /// Not yet chosen. `configure()` fails in this role.
    Undefined,
}

/// Lifecycle state of a connection context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// No live resources.
    Inactive = 0,
    /// Handshake done, messages can flow.
    Connected = 1,
    /// Server bound and waiting for a peer.
    Listening = 2,
    /// The last setup attempt failed. Resources are released.
    Error = 3,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Status::Connected,
            2 => Status::Listening,
            3 => Status::Error,
            _ => Status::Inactive,
        }
    }
}

/// Lock-free, cloneable view of a context's lifecycle status.
///
/// Worker loops and the presentation layer poll this on every tick without
/// taking the lock that guards the context itself.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Status::Inactive as u8)))
    }

    /// Returns the current status.
    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Fixed-capacity passphrase buffer, scrubbed before every overwrite and on
/// drop.
#[derive(Clone)]
pub struct Secret {
    bytes: [u8; SECRET_CAPACITY],
    len: usize,
}

impl Secret {
    fn new() -> Self {
        Self {
            bytes: [0; SECRET_CAPACITY],
            len: 0,
        }
    }

    fn set(&mut self, value: &[u8]) {
        self.bytes.zeroize();
        let len = value.len().min(SECRET_CAPACITY);
        if len < value.len() {
            warn!(capacity = SECRET_CAPACITY, "Passphrase truncated to buffer capacity");
        }
        self.bytes[..len].copy_from_slice(&value[..len]);
        self.len = len;
    }

    /// Returns true if no passphrase is stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.bytes.zeroize();
        self.len = 0;
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl CredentialProvider for Secret {
    fn passphrase(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.bytes[..self.len].to_vec())
    }
}

/// Receive buffer reused across reads.
pub(crate) struct IncomingBuffer {
    data: [u8; INCOMING_CAPACITY],
    len: usize,
}

impl IncomingBuffer {
    fn new() -> Self {
        Self {
            data: [0; INCOMING_CAPACITY],
            len: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }

    // The readable region excludes the reserved terminator slot.
    pub(crate) fn readable_region(&mut self) -> &mut [u8] {
        &mut self.data[..INCOMING_CAPACITY - 1]
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.len = len.min(INCOMING_CAPACITY - 1);
    }

    pub(crate) fn message(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// All configuration, state, diagnostics and owned handles of one chat
/// session.
pub struct ConnectionContext {
    role: Role,
    peer_address: String,
    peer_port: String,
    secret: Secret,
    status: StatusCell,
    pub(crate) incoming: IncomingBuffer,
    diagnostic_error: String,
    diagnostic_info: String,
    cert_dir: PathBuf,
    handshake: Option<HandshakeSummary>,

    // Resource handles. `None` means released.
    pub(crate) transport: Option<TcpStream>,
    pub(crate) acceptor: Option<TcpListener>,
    pub(crate) session_config: Option<SessionConfig>,
    pub(crate) session: Option<TlsConnection>,
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionContext {
    /// Creates a context whose certificate material lives in
    /// `$HOME/.securechat/`.
    pub fn new() -> Result<Self, Error> {
        let home = dirs::home_dir().ok_or(Error::NoHomeDir)?;
        Ok(Self::with_cert_dir(home.join(CERT_DIR_NAME)))
    }

    /// Creates a context reading certificate material from `cert_dir`.
    pub fn with_cert_dir(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            role: Role::Undefined,
            peer_address: String::new(),
            peer_port: String::new(),
            secret: Secret::new(),
            status: StatusCell::new(),
            incoming: IncomingBuffer::new(),
            diagnostic_error: String::new(),
            diagnostic_info: String::new(),
            cert_dir: cert_dir.into(),
            handshake: None,
            transport: None,
            acceptor: None,
            session_config: None,
            session: None,
        }
    }
}

// ============================================================================
// Configuration Mutators
// ============================================================================
//
// These are meant to be called before `configure()`. Changing the address or
// port of a live session does not reconfigure it; disconnect first.

impl ConnectionContext {
    /// Stores the passphrase used to decrypt the server's private key. The
    /// previous value is zero-filled first.
    pub fn set_passphrase(&mut self, passphrase: &str) {
        self.secret.set(passphrase.as_bytes());
    }

    /// Sets the peer address (client) or bind address (server).
    pub fn set_peer_address(&mut self, address: impl Into<String>) {
        self.peer_address = address.into();
    }

    /// Sets the peer port (client) or bind port (server).
    pub fn set_peer_port(&mut self, port: impl Into<String>) {
        self.peer_port = port.into();
    }

    /// Chooses client or server role. Refused while a session is live.
    ///
    /// Between sessions (`Inactive` or `Error`) the role may be chosen again,
    /// so one context can serve as a client after it served as a server. The
    /// next `configure` picks up the new role.
    pub fn set_role(&mut self, role: Role) -> Result<(), Error> {
        match self.status() {
            Status::Inactive | Status::Error => {
                self.role = role;
                Ok(())
            }
            status => {
                warn!(?status, ?role, "Role change refused while session is live");
                Err(Error::AlreadyActive)
            }
        }
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ConnectionContext {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    pub fn peer_port(&self) -> &str {
        &self.peer_port
    }

    /// The `address:port` endpoint string built from the configured fields.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.peer_address, self.peer_port)
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Returns a cloneable handle for polling the status without the context.
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// The latest failure description.
    pub fn diagnostic_error(&self) -> &str {
        &self.diagnostic_error
    }

    /// Accumulated informational text (bind endpoint, handshake summaries).
    pub fn diagnostic_info(&self) -> &str {
        &self.diagnostic_info
    }

    pub fn clear_diagnostic_info(&mut self) {
        self.diagnostic_info.clear();
    }

    /// Bytes delivered by the last successful `read_incoming()`.
    pub fn received(&self) -> &[u8] {
        self.incoming.message()
    }

    /// What the live session's handshake negotiated.
    pub fn handshake_summary(&self) -> Option<&HandshakeSummary> {
        self.handshake.as_ref()
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// A snapshot of the stored passphrase for passing into server setup.
    pub fn credentials(&self) -> Secret {
        self.secret.clone()
    }

    /// Local address of the accept handle, or of the transport handle once
    /// connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(listener) = &self.acceptor {
            return listener.local_addr().ok();
        }
        self.transport.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Address of the connected peer, if any.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Returns true when none of the four resource handles is held.
    pub fn handles_released(&self) -> bool {
        self.transport.is_none()
            && self.acceptor.is_none()
            && self.session_config.is_none()
            && self.session.is_none()
    }
}

// ============================================================================
// Engine-side Mutators
// ============================================================================

impl ConnectionContext {
    pub(crate) fn set_status(&mut self, status: Status) {
        let previous = self.status.get();
        if previous != status {
            debug!(from = ?previous, to = ?status, "Status transition");
        }
        self.status.set(status);
    }

    pub(crate) fn append_info(&mut self, msg: &str) {
        self.diagnostic_info.push_str(msg);
    }

    /// Records `msg` as the latest error, replacing the previous text unless
    /// `append` is set.
    pub(crate) fn set_error(&mut self, msg: &str, append: bool) {
        if !append {
            self.diagnostic_error.clear();
        }
        self.diagnostic_error.push_str(ERROR_PROMPT);
        self.diagnostic_error.push_str(msg);
    }

    pub(crate) fn set_handshake_summary(&mut self, summary: HandshakeSummary) {
        self.handshake = Some(summary);
    }

    // Drops every handle. Status is left to the caller.
    pub(crate) fn release_handles(&mut self) {
        self.handshake = None;
        self.session = None;
        self.transport = None;
        self.acceptor = None;
        self.session_config = None;
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("role", &self.role)
            .field("peer_address", &self.peer_address)
            .field("peer_port", &self.peer_port)
            .field("secret", &self.secret)
            .field("status", &self.status())
            .field("cert_dir", &self.cert_dir)
            .field("transport", &self.transport.is_some())
            .field("acceptor", &self.acceptor.is_some())
            .field("session_config", &self.session_config.is_some())
            .field("session", &self.session.is_some())
            .finish()
    }
}
