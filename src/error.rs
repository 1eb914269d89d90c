use thiserror::Error;

/// The error type for securechat operations.
///
/// Every engine operation returns this type and also records its display text
/// in the context's diagnostic error string, so the presentation layer can
/// surface failures without matching on variants.
///
/// Setup errors (configuration, transport, trust) always leave the context
/// released. Session I/O errors leave a `Connected` session untouched.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured address and port could not be parsed or resolved.
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    /// Outbound TCP connection could not be established.
    #[error("Error attempting to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// The listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Accepting a pending connection failed.
    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    // ============================================================================
    // Lifecycle Errors
    // ============================================================================

    /// `configure()` was called without choosing client or server role.
    #[error("Connection role undefined - set client or server role before connecting")]
    RoleUndefined,

    /// `configure()` was called while a session is already live.
    #[error("Already connected")]
    AlreadyActive,

    /// A session operation was attempted while not connected.
    #[error("Unconnected")]
    NotConnected,

    /// `listen_incoming()` was called while not listening.
    #[error("Not listening")]
    NotListening,

    /// Writing a message to the peer failed.
    #[error("Write error: {0}")]
    Write(std::io::Error),

    /// Reading from the peer failed for a reason other than a clean close.
    #[error("Read error: {0}")]
    Read(std::io::Error),

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// The encrypted private key could not be decrypted with the passphrase.
    #[error("Failed to decrypt private key {path}: {reason}")]
    KeyDecryption { path: String, reason: String },

    /// The private key file is accessible to users other than its owner.
    #[error("Private key {path} has permissions {mode:o}; it must only be accessible by its owner")]
    KeyPermissions { path: String, mode: u32 },

    /// Server name for TLS SNI and certificate verification is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// The cipher exclusion list removed every available cipher suite.
    #[error("Cipher blacklist '{0}' excludes every supported cipher suite")]
    NoCipherSuites(String),

    /// TLS handshake did not complete.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The peer certificate chain did not verify against the trust store.
    #[error("Certificate verification error: {0}")]
    CertificateVerification(String),

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A setting has a value the engine cannot work with.
    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    /// The user's home directory could not be determined.
    #[error("Could not determine home directory for certificate material")]
    NoHomeDir,
}
