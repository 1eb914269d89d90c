use clap::{Parser, ValueEnum};
use config::Config;
use securechat::{
    ChatSession, CipherPolicy, ConnectionContext, EngineSettings, Role, SessionEvent, Status,
    TlsEngine, CIPHER_BLACKLIST_ENV,
};
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the securechat crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("securechat={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Client,
    Server,
}

#[derive(Parser)]
#[command(author, version, about = "Peer-to-peer encrypted chat", long_about = None)]
struct Args {
    /// Connect to a peer (client) or wait for one (server)
    #[arg(short, long, value_enum)]
    role: RoleArg,

    /// Peer address (client) or bind address (server)
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Peer port (client) or bind port (server)
    #[arg(short, long, default_value = "4433")]
    port: String,

    /// File holding the passphrase of the server's private key
    #[arg(long)]
    passphrase_file: Option<String>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    // Create config - load from file if specified, otherwise use defaults
    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let mut settings = match EngineSettings::from_config(&config) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if std::env::var_os(CIPHER_BLACKLIST_ENV).is_some() {
        settings.cipher_policy = CipherPolicy::from_env();
    }

    let ctx = match build_context(&args, &settings) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let (mut session, events) = ChatSession::new(ctx, TlsEngine::new(settings));
    let connected = session.connect();
    print_info(&session);
    if let Err(err) = connected {
        eprintln!("{}", session.with_context(|ctx| ctx.diagnostic_error().to_string()));
        eprintln!("Failed to connect: {err}");
        return ExitCode::FAILURE;
    }

    match session.status() {
        Status::Listening => println!("Waiting for a peer. Type /quit to exit."),
        _ => println!("Connected. Type /quit to exit."),
    }

    let session = Arc::new(Mutex::new(session));

    // Print whatever the worker observes
    let shared = Arc::clone(&session);
    thread::spawn(move || {
        for event in events {
            let report = EventReport::from_event(&event);
            if report.is_error {
                eprintln!("{}", report.line);
            } else {
                println!("{}", report.line);
            }
            if report.closes_session {
                lock_session(&shared).disconnect();
                println!("* Session closed. Type /quit to exit.");
            }
        }
    });

    for line in std::io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("Failed to read input: {err}");
                break;
            }
        };
        if line.trim() == "/quit" {
            break;
        }
        let session = lock_session(&session);
        if session.status() != Status::Connected {
            println!("* Not connected");
            continue;
        }
        if let Err(err) = session.send(line.as_bytes()) {
            eprintln!("* Send failed: {err}");
        }
    }

    lock_session(&session).disconnect();
    ExitCode::SUCCESS
}

// ============================================================================
// Event Output
// ============================================================================

struct EventReport {
    line: String,
    is_error: bool,
    // Nothing reads the session any more, so it is closed instead of left
    // half-open.
    closes_session: bool,
}

impl EventReport {
    fn from_event(event: &SessionEvent) -> Self {
        let (line, is_error, closes_session) = match event {
            SessionEvent::Accepted(peer) => (format!("* Peer {peer} connected"), false, false),
            SessionEvent::Received(msg) => {
                (format!("> {}", String::from_utf8_lossy(msg)), false, false)
            }
            SessionEvent::PeerDisconnected => ("* Peer disconnected".to_string(), false, false),
            SessionEvent::ReadFailed(err) => (format!("* Read failed: {err}"), true, true),
            SessionEvent::ListenFailed(err) => (format!("* Listening failed: {err}"), true, false),
        };
        Self {
            line,
            is_error,
            closes_session,
        }
    }
}

fn lock_session(session: &Mutex<ChatSession>) -> MutexGuard<'_, ChatSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn build_context(args: &Args, settings: &EngineSettings) -> Result<ConnectionContext, String> {
    let mut ctx = match &settings.cert_dir {
        Some(dir) => ConnectionContext::with_cert_dir(dir),
        None => ConnectionContext::new().map_err(|e| e.to_string())?,
    };

    let role = match args.role {
        RoleArg::Client => Role::Client,
        RoleArg::Server => Role::Server,
    };
    ctx.set_role(role).map_err(|e| e.to_string())?;
    ctx.set_peer_address(args.address.as_str());
    ctx.set_peer_port(args.port.as_str());

    if let Some(path) = &args.passphrase_file {
        let contents = Zeroizing::new(
            std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read passphrase file '{path}': {e}"))?,
        );
        ctx.set_passphrase(contents.trim_end_matches(['\r', '\n']));
    }
    Ok(ctx)
}

fn print_info(session: &ChatSession) {
    let info = session.with_context(|ctx| ctx.diagnostic_info().to_string());
    if !info.is_empty() {
        print!("{info}");
    }
}
