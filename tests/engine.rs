//! TLS Engine Integration Tests
//!
//! Every test runs a real client and server over loopback with generated
//! certificates.
//!
//! # Running with tracing
//!
//! ```bash
//! TEST_LOG=2 cargo test --test engine -- --nocapture
//! ```

mod tls_test_helper;

use securechat::prelude::*;
use securechat::{CipherPolicy, StaticPassphrase, INCOMING_CAPACITY};
use tls_test_helper::*;

// ============================================================================
// Helper Functions
// ============================================================================

fn connected_pair(
    certs: &CertDir,
    settings: EngineSettings,
) -> (TlsEngine, ConnectionContext, ConnectionContext) {
    let engine = TlsEngine::new(settings);
    let mut server = server_context(certs);
    engine.configure(&mut server).unwrap();
    assert_eq!(server.status(), Status::Listening);

    let client = client_context(certs, listening_port(&server));
    let (accepted, client, result) = connect_client(&engine, &mut server, client);
    result.unwrap();
    assert!(matches!(accepted, Ok(ListenOutcome::Accepted(_))));
    (engine, server, client)
}

// ============================================================================
// Connection Setup
// ============================================================================

#[test]
fn client_connects_and_records_handshake() {
    init_tracing();
    let certs = cert_dir();
    let (_engine, server, client) = connected_pair(&certs, test_settings());

    assert_eq!(client.status(), Status::Connected);
    assert_eq!(server.status(), Status::Connected);
    assert!(client
        .diagnostic_info()
        .contains("Info - Handshake complete - Algorithms:"));
    assert!(server.diagnostic_info().starts_with("Connection String: 127.0.0.1:0\n"));

    let summary = client.handshake_summary().unwrap();
    assert!(summary.protocol.is_some());
    assert!(summary.cipher.is_some());
    assert_eq!(client.remote_addr().unwrap().port(), server.local_addr().unwrap().port());
}

#[test]
fn unrelated_trust_store_fails_verification() {
    init_tracing();
    let certs = cert_dir_with_unrelated_trust();
    let engine = TlsEngine::new(test_settings());
    let mut server = server_context(&certs);
    engine.configure(&mut server).unwrap();

    let client = client_context(&certs, listening_port(&server));
    let (_, client, result) = connect_client(&engine, &mut server, client);

    assert!(matches!(result, Err(Error::CertificateVerification(_))));
    assert_eq!(client.status(), Status::Error);
    assert!(client.handles_released());
    assert!(client.diagnostic_error().contains("verification"));
    assert!(client.diagnostic_error().contains("Error setting client mode"));
}

#[test]
fn wrong_server_name_fails_verification() {
    init_tracing();
    let certs = cert_dir();
    let settings = EngineSettings {
        tls_server_name: Some("chat.example.org".to_string()),
        ..test_settings()
    };
    let engine = TlsEngine::new(settings);
    let mut server = server_context(&certs);
    engine.configure(&mut server).unwrap();

    let client = client_context(&certs, listening_port(&server));
    let (_, client, result) = connect_client(&engine, &mut server, client);

    assert!(matches!(result, Err(Error::CertificateVerification(_))));
    assert_eq!(client.status(), Status::Error);
}

#[test]
fn connect_to_closed_port_fails() {
    init_tracing();
    let certs = cert_dir();
    let engine = TlsEngine::new(test_settings());

    // Bind and drop to find a port nobody listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut client = client_context(&certs, port);

    assert!(matches!(engine.configure(&mut client), Err(Error::Connect { .. })));
    assert_eq!(client.status(), Status::Error);
    assert!(client.handles_released());
}

#[test]
fn bind_conflict_fails_server_setup() {
    init_tracing();
    let certs = cert_dir();
    let engine = TlsEngine::new(test_settings());
    let mut first = server_context(&certs);
    engine.configure(&mut first).unwrap();

    let mut second = server_context(&certs);
    second.set_peer_port(listening_port(&first).to_string());
    assert!(matches!(engine.configure(&mut second), Err(Error::Bind { .. })));
    assert_eq!(second.status(), Status::Error);
    assert!(second.handles_released());
    assert_eq!(first.status(), Status::Listening);
}

#[test]
fn failed_server_handshake_releases_listener() {
    use std::io::Write;
    use std::time::Instant;

    init_tracing();
    let certs = cert_dir();
    let engine = TlsEngine::new(test_settings());
    let mut server = server_context(&certs);
    engine.configure(&mut server).unwrap();
    let port = listening_port(&server);

    // A plain TCP peer that never speaks TLS
    let mut peer = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.write_all(b"hello, this is not a TLS record").unwrap();
    peer.flush().unwrap();

    let deadline = Instant::now() + TIMEOUT;
    let result = loop {
        match engine.listen_incoming(&mut server) {
            Ok(ListenOutcome::Pending) if Instant::now() < deadline => {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            other => break other,
        }
    };

    assert!(matches!(result, Err(Error::Handshake(_))));
    assert_eq!(server.status(), Status::Inactive);
    assert!(server.handles_released());
    assert!(server.diagnostic_error().contains("Handshake failed"));

    // No re-listen: the port is free and listening again needs configure()
    assert!(matches!(engine.listen_incoming(&mut server), Err(Error::NotListening)));
    std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
}

#[test]
fn reconfigure_after_error_succeeds() {
    init_tracing();
    let certs = cert_dir();
    let engine = TlsEngine::new(test_settings());
    let mut ctx = server_context(&certs);
    ctx.set_peer_address("not an address");
    assert!(engine.configure(&mut ctx).is_err());
    assert_eq!(ctx.status(), Status::Error);

    ctx.set_peer_address("127.0.0.1");
    engine.configure(&mut ctx).unwrap();
    assert_eq!(ctx.status(), Status::Listening);
}

#[test]
fn undefined_role_fails() {
    init_tracing();
    let certs = cert_dir();
    let engine = TlsEngine::new(test_settings());
    let mut ctx = ConnectionContext::with_cert_dir(certs.path());

    assert!(matches!(engine.configure(&mut ctx), Err(Error::RoleUndefined)));
    assert_eq!(ctx.status(), Status::Error);
    assert!(ctx.handles_released());
}

// ============================================================================
// Server Keys
// ============================================================================

#[test]
fn encrypted_key_with_passphrase() {
    init_tracing();
    let certs = cert_dir_with_encrypted_key("correct horse");
    let engine = TlsEngine::new(test_settings());
    let mut ctx = server_context(&certs);
    ctx.set_passphrase("correct horse");

    engine.configure(&mut ctx).unwrap();
    assert_eq!(ctx.status(), Status::Listening);
}

#[test]
fn empty_passphrase_falls_back_to_placeholder() {
    init_tracing();
    let certs = cert_dir_with_encrypted_key(securechat::PLACEHOLDER_PASSPHRASE);
    let engine = TlsEngine::new(test_settings());
    let mut ctx = server_context(&certs);

    engine.configure(&mut ctx).unwrap();
    assert_eq!(ctx.status(), Status::Listening);
}

#[test]
fn wrong_passphrase_fails() {
    init_tracing();
    let certs = cert_dir_with_encrypted_key("correct horse");
    let engine = TlsEngine::new(test_settings());
    let mut ctx = server_context(&certs);

    let result = engine.configure_with_credentials(&mut ctx, &StaticPassphrase::new("wrong"));
    assert!(result.is_err());
    assert_eq!(ctx.status(), Status::Error);
    assert!(ctx.handles_released());
    assert!(ctx.diagnostic_error().contains("Error setting server mode"));
}

// ============================================================================
// Cipher Policy
// ============================================================================

#[test]
fn blacklist_restricts_negotiated_cipher() {
    init_tracing();
    let certs = cert_dir();
    let settings = EngineSettings {
        cipher_policy: CipherPolicy::parse("!AES128:!AES256"),
        ..test_settings()
    };
    let (_engine, server, client) = connected_pair(&certs, settings);

    for ctx in [&server, &client] {
        let cipher = ctx.handshake_summary().unwrap().cipher.clone().unwrap();
        assert!(cipher.contains("CHACHA20"), "{cipher}");
        assert!(ctx.diagnostic_info().contains("Algorithm bits: 256"));
    }
}

#[test]
fn blacklist_excluding_everything_fails_setup() {
    init_tracing();
    let certs = cert_dir();
    let settings = EngineSettings {
        cipher_policy: CipherPolicy::parse("!AES:!CHACHA20"),
        ..test_settings()
    };
    let engine = TlsEngine::new(settings);
    let mut ctx = server_context(&certs);

    assert!(matches!(engine.configure(&mut ctx), Err(Error::NoCipherSuites(_))));
    assert_eq!(ctx.status(), Status::Error);
}

// ============================================================================
// Message Exchange
// ============================================================================

#[test]
fn messages_flow_both_ways() {
    init_tracing();
    let certs = cert_dir();
    let (engine, mut server, mut client) = connected_pair(&certs, test_settings());

    engine.send_message(&mut client, b"hello server").unwrap();
    assert_eq!(read_next(&engine, &mut server).unwrap(), ReadOutcome::Data(12));
    assert_eq!(server.received(), b"hello server");

    engine.send_message(&mut server, b"hello client").unwrap();
    assert_eq!(read_next(&engine, &mut client).unwrap(), ReadOutcome::Data(12));
    assert_eq!(client.received(), b"hello client");
}

#[test]
fn long_message_arrives_in_capacity_sized_pieces() {
    init_tracing();
    let certs = cert_dir();
    let (engine, mut server, mut client) = connected_pair(&certs, test_settings());

    let msg: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    engine.send_message(&mut client, &msg).unwrap();

    let first = INCOMING_CAPACITY - 1;
    assert_eq!(read_next(&engine, &mut server).unwrap(), ReadOutcome::Data(first));
    assert_eq!(server.received(), &msg[..first]);
    assert_eq!(
        read_next(&engine, &mut server).unwrap(),
        ReadOutcome::Data(msg.len() - first)
    );
    assert_eq!(server.received(), &msg[first..]);
}

#[test]
fn read_without_data_is_pending() {
    init_tracing();
    let certs = cert_dir();
    let (engine, mut server, _client) = connected_pair(&certs, test_settings());

    assert_eq!(engine.read_incoming(&mut server).unwrap(), ReadOutcome::Pending);
    assert_eq!(server.status(), Status::Connected);
}

#[test]
fn send_requires_connection() {
    init_tracing();
    let certs = cert_dir();
    let engine = TlsEngine::new(test_settings());

    let mut inactive = server_context(&certs);
    assert!(matches!(
        engine.send_message(&mut inactive, b"x"),
        Err(Error::NotConnected)
    ));
    assert_eq!(inactive.status(), Status::Inactive);

    let mut listening = server_context(&certs);
    engine.configure(&mut listening).unwrap();
    assert!(matches!(
        engine.send_message(&mut listening, b"x"),
        Err(Error::NotConnected)
    ));
    assert_eq!(listening.status(), Status::Listening);
    assert_eq!(listening.diagnostic_error(), "Error:---> Unconnected");

    let mut failed = ConnectionContext::with_cert_dir(certs.path());
    let _ = engine.configure(&mut failed);
    assert_eq!(failed.status(), Status::Error);
    assert!(matches!(
        engine.send_message(&mut failed, b"x"),
        Err(Error::NotConnected)
    ));
    assert_eq!(failed.status(), Status::Error);
}

#[test]
fn configure_while_connected_is_refused() {
    init_tracing();
    let certs = cert_dir();
    let (engine, _server, mut client) = connected_pair(&certs, test_settings());

    assert!(matches!(engine.configure(&mut client), Err(Error::AlreadyActive)));
    assert_eq!(client.status(), Status::Connected);
    assert!(!client.handles_released());
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn peer_close_is_reported_once() {
    init_tracing();
    let certs = cert_dir();
    let (engine, mut server, mut client) = connected_pair(&certs, test_settings());

    engine.clean_context(&mut client);
    assert_eq!(client.status(), Status::Inactive);

    assert_eq!(read_next(&engine, &mut server).unwrap(), ReadOutcome::PeerClosed);
    assert_eq!(server.status(), Status::Inactive);
    assert!(server.handles_released());
    assert!(server.diagnostic_info().ends_with("Peer disconnected.\n"));
    assert_eq!(server.diagnostic_error(), "Error:---> Peer disconnected.");

    assert!(matches!(engine.read_incoming(&mut server), Err(Error::NotConnected)));
    assert_eq!(server.status(), Status::Inactive);
}

#[test]
fn abrupt_drop_is_a_peer_close() {
    init_tracing();
    let certs = cert_dir();
    let (engine, mut server, client) = connected_pair(&certs, test_settings());

    drop(client);
    assert_eq!(read_next(&engine, &mut server).unwrap(), ReadOutcome::PeerClosed);
    assert_eq!(server.status(), Status::Inactive);
}

#[test]
fn clean_context_is_idempotent() {
    init_tracing();
    let certs = cert_dir();
    let (engine, mut server, mut client) = connected_pair(&certs, test_settings());

    for _ in 0..2 {
        engine.clean_context(&mut client);
        engine.clean_context(&mut server);
        assert_eq!(client.status(), Status::Inactive);
        assert_eq!(server.status(), Status::Inactive);
        assert!(client.handles_released());
        assert!(server.handles_released());
    }
    assert!(client.handshake_summary().is_none());
}

#[test]
fn server_can_listen_again_after_disconnect() {
    init_tracing();
    let certs = cert_dir();
    let (engine, mut server, mut client) = connected_pair(&certs, test_settings());

    engine.clean_context(&mut client);
    engine.clean_context(&mut server);

    engine.configure(&mut server).unwrap();
    let client = client_context(&certs, listening_port(&server));
    let (accepted, client, result) = connect_client(&engine, &mut server, client);
    result.unwrap();
    assert!(matches!(accepted, Ok(ListenOutcome::Accepted(_))));
    assert_eq!(client.status(), Status::Connected);
}
