//! TLS engine implementation.
//!
//! Provides a blocking, single-session TLS engine on top of rustls and std
//! sockets. The engine holds no per-session state of its own: every operation
//! works on a [`ConnectionContext`] passed by mutable reference, and every
//! failing branch either releases the context completely or leaves the
//! previous successful state untouched.

use super::diagnostics::HandshakeSummary;
use super::tls_config::{
    load_tls_client_config, load_tls_server_config, verify_peer_chain, CertMaterial,
};
use super::{EngineSettings, ListenOutcome, ReadOutcome};
use crate::context::{ConnectionContext, Role, Status};
use crate::credentials::CredentialProvider;
use crate::error::Error;

use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

// Internal enum for TLS connection type
pub(crate) enum TlsConnection {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, stream: &mut TcpStream) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(stream),
            TlsConnection::Client(conn) => conn.read_tls(stream),
        }
    }

    fn write_tls(&mut self, stream: &mut TcpStream) -> Result<usize, io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(stream),
            TlsConnection::Client(conn) => conn.write_tls(stream),
        }
    }

    fn complete_io(&mut self, stream: &mut TcpStream) -> Result<(usize, usize), io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.complete_io(stream),
            TlsConnection::Client(conn) => conn.complete_io(stream),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            TlsConnection::Server(conn) => conn.peer_certificates(),
            TlsConnection::Client(conn) => conn.peer_certificates(),
        }
    }

    pub(crate) fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            TlsConnection::Server(conn) => conn.protocol_version(),
            TlsConnection::Client(conn) => conn.protocol_version(),
        }
    }

    pub(crate) fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            TlsConnection::Server(conn) => conn.negotiated_cipher_suite(),
            TlsConnection::Client(conn) => conn.negotiated_cipher_suite(),
        }
    }
}

// The secure-session context: everything a new connection is created from.
pub(crate) enum SessionConfig {
    Client {
        config: Arc<ClientConfig>,
        verifier: Arc<WebPkiServerVerifier>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

impl SessionConfig {
    fn new_connection(&self) -> Result<TlsConnection, Error> {
        match self {
            SessionConfig::Client {
                config,
                server_name,
                ..
            } => ClientConnection::new(config.clone(), server_name.clone())
                .map(TlsConnection::Client)
                .map_err(|e| Error::TlsClientConfigBuild(e.to_string())),
            SessionConfig::Server { config } => ServerConnection::new(config.clone())
                .map(TlsConnection::Server)
                .map_err(|e| Error::TlsServerConfigBuild(e.to_string())),
        }
    }

    // Checks the live session's peer chain. Servers do not authenticate
    // clients, so there is nothing to check on that side.
    fn verify_peer(&self, session: &TlsConnection) -> Result<(), Error> {
        match self {
            SessionConfig::Client {
                verifier,
                server_name,
                ..
            } => verify_peer_chain(verifier, session.peer_certificates(), server_name),
            SessionConfig::Server { .. } => Ok(()),
        }
    }
}

// Internal result of one plaintext read attempt
enum ReadStatus {
    Data(usize),
    Closed,
    Pending,
}

/// Blocking TLS connection engine for one chat session.
///
/// Operations follow a fixed state machine:
///
/// | Operation | Valid from | Success | Failure |
/// |---|---|---|---|
/// | [`configure`](Self::configure) | `Inactive`, `Error` | `Connected` (client) / `Listening` (server) | `Error`, released |
/// | [`listen_incoming`](Self::listen_incoming) | `Listening` | `Connected` | `Inactive`, released |
/// | [`read_incoming`](Self::read_incoming) | `Connected` | `Connected` | I/O error: `Connected`; peer close: `Inactive` |
/// | [`send_message`](Self::send_message) | `Connected` | `Connected` | unchanged |
/// | [`clean_context`](Self::clean_context) | any | `Inactive` | never fails |
///
/// Not thread-safe on its own: callers sharing a context across threads must
/// serialize access, as [`ChatSession`](crate::ChatSession) does.
#[derive(Debug, Clone)]
pub struct TlsEngine {
    settings: EngineSettings,
}

// ============================================================================
// Constructors
// ============================================================================

impl TlsEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl Default for TlsEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl TlsEngine {
    /// Connects (client role) or starts listening (server role).
    ///
    /// The server key passphrase comes from the context's stored secret. Use
    /// [`Self::configure_with_credentials`] to supply a different provider.
    pub fn configure(&self, ctx: &mut ConnectionContext) -> Result<(), Error> {
        let credentials = ctx.credentials();
        self.configure_with_credentials(ctx, &credentials)
    }

    /// Like [`Self::configure`], with an explicit passphrase provider for the
    /// server key.
    #[instrument(skip(self, ctx, credentials), fields(role = ?ctx.role(), endpoint = %ctx.endpoint()))]
    pub fn configure_with_credentials(
        &self,
        ctx: &mut ConnectionContext,
        credentials: &dyn CredentialProvider,
    ) -> Result<(), Error> {
        match ctx.status() {
            Status::Inactive | Status::Error => {}
            status => {
                warn!(?status, "Configure refused, session already live");
                let err = Error::AlreadyActive;
                ctx.set_error(&err.to_string(), false);
                return Err(err);
            }
        }

        let (result, context_msg) = match (self.settings.validate(), ctx.role()) {
            (Err(err), _) => (Err(err), "Error setting mode"),
            (Ok(()), Role::Client) => (self.setup_client(ctx), "Error setting client mode"),
            (Ok(()), Role::Server) => (
                self.setup_server(ctx, credentials),
                "Error setting server mode",
            ),
            (Ok(()), Role::Undefined) => (Err(Error::RoleUndefined), "Error setting mode"),
        };

        if let Err(err) = &result {
            error!(?err, "{context_msg}");
            ctx.release_handles();
            ctx.set_status(Status::Error);
            ctx.set_error(&err.to_string(), false);
            ctx.set_error(context_msg, true);
        }
        result
    }

    /// Polls the accept handle for one pending peer and handshakes with it.
    ///
    /// Returns [`ListenOutcome::Pending`] when nobody is waiting. A failed
    /// accept or handshake releases the listener too; the server must be
    /// configured again to accept further peers.
    #[instrument(skip(self, ctx))]
    pub fn listen_incoming(&self, ctx: &mut ConnectionContext) -> Result<ListenOutcome, Error> {
        if ctx.status() != Status::Listening {
            let err = Error::NotListening;
            ctx.set_error(&err.to_string(), false);
            return Err(err);
        }

        let accepted = match ctx.acceptor.as_ref() {
            Some(listener) => listener.accept(),
            None => Err(io::Error::new(ErrorKind::NotConnected, "no accept handle")),
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted => {
                    return Ok(ListenOutcome::Pending);
                }
                ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                    warn!(?err, "Transient accept error");
                    return Ok(ListenOutcome::Pending);
                }
                _ => {
                    let err = Error::Accept(err);
                    self.fail_listen(ctx, &err);
                    return Err(err);
                }
            },
        };

        info!(%peer_addr, "Accepting connection");
        match self.accept_peer(ctx, stream) {
            Ok(()) => {
                ctx.set_status(Status::Connected);
                info!(%peer_addr, "Peer connected");
                Ok(ListenOutcome::Accepted(peer_addr))
            }
            Err(err) => {
                self.fail_listen(ctx, &err);
                Err(err)
            }
        }
    }

    /// Releases every resource handle and resets the context to `Inactive`.
    ///
    /// Sends a TLS close notification first when a session is live. Safe to
    /// call repeatedly and on a context that never allocated anything.
    #[instrument(skip(self, ctx))]
    pub fn clean_context(&self, ctx: &mut ConnectionContext) {
        if let (Some(stream), Some(session)) = (ctx.transport.as_mut(), ctx.session.as_mut()) {
            session.send_close_notify();
            while session.wants_write() {
                match session.write_tls(stream) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = stream.flush();
        }
        if !ctx.handles_released() {
            info!("Closed connection");
        }
        ctx.release_handles();
        ctx.set_status(Status::Inactive);
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl TlsEngine {
    /// Writes the whole message to the peer and flushes it.
    ///
    /// Fails without changing state when not connected. A write failure is
    /// reported and the session stays `Connected`.
    #[instrument(skip(self, ctx, msg), fields(len = msg.len()))]
    pub fn send_message(&self, ctx: &mut ConnectionContext, msg: &[u8]) -> Result<(), Error> {
        let result = if ctx.status() != Status::Connected {
            Err(Error::NotConnected)
        } else {
            match (ctx.transport.as_mut(), ctx.session.as_mut()) {
                (Some(stream), Some(session)) => {
                    write_message(session, stream, msg).map_err(Error::Write)
                }
                _ => Err(Error::NotConnected),
            }
        };

        match &result {
            Ok(()) => debug!("Sent message"),
            Err(err) => {
                warn!(?err, "Send failed");
                ctx.set_error(&err.to_string(), false);
            }
        }
        result
    }

    /// Reads the next message into the context's incoming buffer.
    ///
    /// At most `INCOMING_CAPACITY - 1` bytes are delivered per call; longer
    /// messages arrive over several calls. A clean close by the peer resets
    /// the context to `Inactive` and returns [`ReadOutcome::PeerClosed`].
    #[instrument(skip(self, ctx))]
    pub fn read_incoming(&self, ctx: &mut ConnectionContext) -> Result<ReadOutcome, Error> {
        if ctx.status() != Status::Connected {
            let err = Error::NotConnected;
            ctx.set_error(&err.to_string(), false);
            return Err(err);
        }

        ctx.incoming.clear();
        let status = match (ctx.transport.as_mut(), ctx.session.as_mut()) {
            (Some(stream), Some(session)) => {
                read_plaintext(session, stream, ctx.incoming.readable_region())
            }
            _ => Err(io::Error::new(ErrorKind::NotConnected, "no transport handle")),
        };

        match status {
            Ok(ReadStatus::Data(len)) => {
                ctx.incoming.set_len(len);
                debug!(len, "Received data");
                Ok(ReadOutcome::Data(len))
            }
            Ok(ReadStatus::Pending) => Ok(ReadOutcome::Pending),
            Ok(ReadStatus::Closed) => {
                info!("Peer closed connection");
                ctx.release_handles();
                ctx.set_status(Status::Inactive);
                ctx.append_info("Peer disconnected.\n");
                ctx.set_error("Peer disconnected.", false);
                Ok(ReadOutcome::PeerClosed)
            }
            Err(err) => {
                warn!(?err, "Read failed");
                let err = Error::Read(err);
                ctx.set_error(&err.to_string(), false);
                Err(err)
            }
        }
    }
}

// ============================================================================
// Internal Setup
// ============================================================================

impl TlsEngine {
    fn setup_client(&self, ctx: &mut ConnectionContext) -> Result<(), Error> {
        let provider = self.settings.cipher_policy.provider()?;
        let material = CertMaterial::in_dir(ctx.cert_dir());
        let (config, verifier) = load_tls_client_config(&material.trust_store, provider)?;

        let name = self
            .settings
            .tls_server_name
            .clone()
            .unwrap_or_else(|| ctx.peer_address().to_string());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| Error::TlsInvalidServerName(name))?;

        let session_config = SessionConfig::Client {
            config: Arc::new(config),
            verifier,
            server_name,
        };
        let conn = session_config.new_connection()?;
        ctx.session_config = Some(session_config);

        let endpoint = ctx.endpoint();
        let stream = self.connect_tcp(&endpoint)?;
        let local_addr = stream.local_addr()?;
        info!(%local_addr, %endpoint, "Initiating connection");
        ctx.transport = Some(stream);
        ctx.session = Some(conn);

        self.handshake(ctx)?;

        // Trust is decided here, separately from the handshake itself.
        if let (Some(session_config), Some(session)) = (&ctx.session_config, &ctx.session) {
            session_config.verify_peer(session)?;
        }
        debug!("Peer certificate verified");

        self.finish_handshake(ctx)?;
        ctx.set_status(Status::Connected);
        info!(%endpoint, "Connected");
        Ok(())
    }

    fn setup_server(
        &self,
        ctx: &mut ConnectionContext,
        credentials: &dyn CredentialProvider,
    ) -> Result<(), Error> {
        let endpoint = ctx.endpoint();
        ctx.append_info(&format!("Connection String: {endpoint}\n"));

        let provider = self.settings.cipher_policy.provider()?;
        let material = CertMaterial::in_dir(ctx.cert_dir());
        let config = load_tls_server_config(
            &material.server_cert,
            &material.server_key,
            provider,
            credentials,
        )?;
        ctx.session_config = Some(SessionConfig::Server {
            config: Arc::new(config),
        });

        let addr = resolve(&endpoint)?
            .next()
            .ok_or_else(|| Error::InvalidAddress(endpoint.clone()))?;
        let listener = TcpListener::bind(addr).map_err(|e| Error::Bind {
            addr: endpoint.clone(),
            source: e,
        })?;
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listening for connections");
        ctx.acceptor = Some(listener);
        ctx.set_status(Status::Listening);
        Ok(())
    }

    fn accept_peer(&self, ctx: &mut ConnectionContext, stream: TcpStream) -> Result<(), Error> {
        // Accepted sockets may inherit the listener's non-blocking mode.
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let conn = match &ctx.session_config {
            Some(config @ SessionConfig::Server { .. }) => config.new_connection()?,
            _ => return Err(Error::TlsServerConfigBuild("server config missing".to_string())),
        };
        ctx.transport = Some(stream);
        ctx.session = Some(conn);

        self.handshake(ctx)?;
        self.finish_handshake(ctx)?;

        // One peer per session: the accept handle is not needed any more.
        ctx.acceptor = None;
        Ok(())
    }

    fn fail_listen(&self, ctx: &mut ConnectionContext, err: &Error) {
        error!(?err, "Listener failed");
        ctx.release_handles();
        ctx.set_status(Status::Inactive);
        ctx.set_error(&err.to_string(), false);
    }

    fn connect_tcp(&self, endpoint: &str) -> Result<TcpStream, Error> {
        let mut last_err = None;
        for addr in resolve(endpoint)? {
            match TcpStream::connect_timeout(&addr, self.settings.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(%addr, ?err, "Connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(Error::Connect {
            addr: endpoint.to_string(),
            source: last_err.unwrap_or_else(|| {
                io::Error::new(ErrorKind::InvalidInput, "Could not resolve address")
            }),
        })
    }

    fn handshake(&self, ctx: &mut ConnectionContext) -> Result<(), Error> {
        let (Some(stream), Some(session)) = (ctx.transport.as_mut(), ctx.session.as_mut()) else {
            return Err(Error::Handshake("no transport handle".to_string()));
        };

        stream.set_read_timeout(Some(self.settings.handshake_timeout))?;
        stream.set_write_timeout(Some(self.settings.handshake_timeout))?;

        while session.is_handshaking() {
            match session.complete_io(stream) {
                Ok((0, 0)) => {
                    return Err(Error::Handshake(
                        "connection closed during handshake".to_string(),
                    ));
                }
                Ok((rd, wr)) => trace!(rd, wr, "Handshake progress"),
                Err(err) => return Err(Error::Handshake(err.to_string())),
            }
        }

        while session.wants_write() {
            session
                .write_tls(stream)
                .map_err(|e| Error::Handshake(e.to_string()))?;
        }
        Ok(())
    }

    // Records the handshake summary and switches the socket to poll-sized
    // read timeouts.
    fn finish_handshake(&self, ctx: &mut ConnectionContext) -> Result<(), Error> {
        if let Some(stream) = ctx.transport.as_ref() {
            stream.set_read_timeout(Some(self.settings.poll_interval))?;
        }

        let Some(summary) = ctx.session.as_ref().map(HandshakeSummary::from_connection) else {
            return Ok(());
        };
        if summary.cipher.is_none() {
            warn!("No cipher information available after handshake");
        }
        info!(
            protocol = summary.protocol.as_deref().unwrap_or("unknown"),
            cipher = summary.cipher.as_deref().unwrap_or("unknown"),
            bits = summary.bits.unwrap_or(0),
            "TLS handshake completed"
        );
        ctx.append_info(&summary.render());
        ctx.set_handshake_summary(summary);
        Ok(())
    }
}

// ============================================================================
// Internal Connection I/O
// ============================================================================

fn resolve(endpoint: &str) -> Result<std::vec::IntoIter<SocketAddr>, Error> {
    endpoint
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress(endpoint.to_string()))
}

fn write_message(
    session: &mut TlsConnection,
    stream: &mut TcpStream,
    msg: &[u8],
) -> Result<(), io::Error> {
    session.writer().write_all(msg)?;
    while session.wants_write() {
        let sz = session.write_tls(stream)?;
        trace!(len = sz, "Wrote encrypted data to socket");
    }
    stream.flush()
}

fn read_plaintext(
    session: &mut TlsConnection,
    stream: &mut TcpStream,
    buf: &mut [u8],
) -> Result<ReadStatus, io::Error> {
    let mut eof = false;
    loop {
        // Plaintext may already be buffered from an earlier record.
        match session.reader().read(buf) {
            Ok(0) => return Ok(ReadStatus::Closed),
            Ok(sz) => {
                trace!(len = sz, "Read plaintext from TLS");
                return Ok(ReadStatus::Data(sz));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if eof {
                    return Ok(ReadStatus::Closed);
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("Peer closed without close_notify");
                return Ok(ReadStatus::Closed);
            }
            Err(err) => return Err(err),
        }

        match session.read_tls(stream) {
            Ok(0) => {
                trace!("Socket reached end of stream");
                eof = true;
            }
            Ok(sz) => trace!(len = sz, "Read encrypted data from socket"),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(ReadStatus::Pending);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                debug!(?err, "Peer reset connection");
                return Ok(ReadStatus::Closed);
            }
            Err(err) => return Err(err),
        }

        if let Err(err) = session.process_new_packets() {
            // Let the peer know why before giving up.
            let _ = session.write_tls(stream);
            return Err(io::Error::new(ErrorKind::InvalidData, err));
        }

        while session.wants_write() {
            session.write_tls(stream)?;
        }
    }
}
