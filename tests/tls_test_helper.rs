#![allow(dead_code)]

use securechat::{
    ConnectionContext, EngineSettings, ListenOutcome, ReadOutcome, Role, TlsEngine,
    SERVER_CERT_FILE, SERVER_KEY_FILE, TRUST_STORE_FILE,
};
use std::fs;
use std::path::Path;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub const TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
///
/// Example: TEST_LOG=2 cargo test --test engine -- --nocapture
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("securechat={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Certificate Material
// ============================================================================

/// Temporary certificate directory, removed on drop
pub struct CertDir {
    dir: TempDir,
}

impl CertDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Replaces the client trust store
    pub fn write_trust_store(&self, pem: &str) {
        fs::write(self.path().join(TRUST_STORE_FILE), pem).unwrap();
    }

    /// Replaces the server key, keeping owner-only permissions
    pub fn write_server_key(&self, pem: &str) {
        let path = self.path().join(SERVER_KEY_FILE);
        fs::write(&path, pem).unwrap();
        restrict_permissions(&path);
    }
}

/// Self-signed localhost certificate, trusted by the client
pub fn cert_dir() -> CertDir {
    let (dir, _) = create_cert_dir();
    dir
}

/// Server certificate the client trust store knows nothing about
pub fn cert_dir_with_unrelated_trust() -> CertDir {
    let dir = cert_dir();
    let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    dir.write_trust_store(&other.cert.pem());
    dir
}

/// Server key stored as encrypted PKCS#8 under `passphrase`
pub fn cert_dir_with_encrypted_key(passphrase: &str) -> CertDir {
    let (dir, key_der) = create_cert_dir();
    dir.write_server_key(&encrypt_key(&key_der, passphrase));
    dir
}

fn create_cert_dir() -> (CertDir, Vec<u8>) {
    let certified_key =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    let cert_pem = certified_key.cert.pem();
    let key_pem = certified_key.key_pair.serialize_pem();

    let dir = CertDir {
        dir: tempfile::tempdir().unwrap(),
    };
    fs::write(dir.path().join(SERVER_CERT_FILE), &cert_pem).unwrap();
    // For testing, the trust store is the server cert itself (self-signed)
    dir.write_trust_store(&cert_pem);
    dir.write_server_key(&key_pem);

    (dir, certified_key.key_pair.serialize_der())
}

fn encrypt_key(pkcs8_der: &[u8], passphrase: &str) -> String {
    let salt = [7u8; 16];
    let iv = [9u8; 16];
    let params =
        pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(1_000, &salt, &iv).unwrap();
    let info = pkcs8::PrivateKeyInfo::try_from(pkcs8_der).unwrap();
    let encrypted = info
        .encrypt_with_params(params, passphrase.as_bytes())
        .unwrap();
    encrypted
        .to_pem("ENCRYPTED PRIVATE KEY", pkcs8::LineEnding::LF)
        .unwrap()
        .to_string()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

// ============================================================================
// Engine Helpers
// ============================================================================

/// Fast-ticking settings that verify against the test certificate's name
pub fn test_settings() -> EngineSettings {
    let poll_interval = Duration::from_millis(20);
    EngineSettings {
        handshake_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        poll_interval,
        shutdown_grace: poll_interval * 50,
        tls_server_name: Some("localhost".to_string()),
        ..EngineSettings::default()
    }
}

pub fn server_context(certs: &CertDir) -> ConnectionContext {
    let mut ctx = ConnectionContext::with_cert_dir(certs.path());
    ctx.set_role(Role::Server).unwrap();
    ctx.set_peer_address("127.0.0.1");
    ctx.set_peer_port("0");
    ctx
}

pub fn client_context(certs: &CertDir, port: u16) -> ConnectionContext {
    let mut ctx = ConnectionContext::with_cert_dir(certs.path());
    ctx.set_role(Role::Client).unwrap();
    ctx.set_peer_address("127.0.0.1");
    ctx.set_peer_port(port.to_string());
    ctx
}

/// Port the listening server context is bound to
pub fn listening_port(ctx: &ConnectionContext) -> u16 {
    ctx.local_addr().expect("server is not listening").port()
}

/// Connects a client to a listening server.
///
/// The client handshake runs on its own thread while this thread accepts.
/// Returns the accept result and the client context with its configure
/// result.
pub fn connect_client(
    engine: &TlsEngine,
    server: &mut ConnectionContext,
    mut client: ConnectionContext,
) -> (
    Result<ListenOutcome, securechat::Error>,
    ConnectionContext,
    Result<(), securechat::Error>,
) {
    let client_engine = engine.clone();
    let handle = thread::spawn(move || {
        let result = client_engine.configure(&mut client);
        (client, result)
    });

    let deadline = Instant::now() + TIMEOUT;
    let accepted = loop {
        match engine.listen_incoming(server) {
            Ok(ListenOutcome::Pending) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            other => break other,
        }
    };

    let (client, result) = handle.join().unwrap();
    (accepted, client, result)
}

/// Reads until something other than `Pending` arrives
pub fn read_next(
    engine: &TlsEngine,
    ctx: &mut ConnectionContext,
) -> Result<ReadOutcome, securechat::Error> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match engine.read_incoming(ctx) {
            Ok(ReadOutcome::Pending) if Instant::now() < deadline => {}
            other => return other,
        }
    }
}
