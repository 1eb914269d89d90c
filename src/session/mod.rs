//! Thread-safe chat session.
//!
//! [`ChatSession`] shares one [`ConnectionContext`] between the caller and a
//! background worker. Every engine call happens under the context lock; the
//! lifecycle status can be polled without it through [`ChatSession::status`].
//! Incoming data and lifecycle changes observed by the worker arrive as
//! [`SessionEvent`]s on the receiver returned by [`ChatSession::new`].

mod worker;

use crate::context::{ConnectionContext, Status, StatusCell};
use crate::error::Error;
use crate::transport::TlsEngine;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, instrument, warn};
use worker::Worker;

/// Something the background worker observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A peer connected to the listening server and the handshake completed.
    Accepted(SocketAddr),
    /// A message arrived from the peer.
    Received(Vec<u8>),
    /// The peer closed the connection. The session is now `Inactive`.
    PeerDisconnected,
    /// Reading failed. The session is still `Connected`, but no longer read.
    ReadFailed(String),
    /// Accepting failed. The session is now `Inactive`.
    ListenFailed(String),
}

/// A connection context, its engine and the worker that polls them.
///
/// # Example
///
/// ```no_run
/// use securechat::{ChatSession, ConnectionContext, Role, SessionEvent, TlsEngine};
///
/// let mut ctx = ConnectionContext::new()?;
/// ctx.set_role(Role::Client)?;
/// ctx.set_peer_address("127.0.0.1");
/// ctx.set_peer_port("4433");
///
/// let (mut session, events) = ChatSession::new(ctx, TlsEngine::default());
/// session.connect()?;
/// session.send(b"hello")?;
/// while let Ok(event) = events.recv() {
///     if let SessionEvent::Received(msg) = event {
///         println!("{}", String::from_utf8_lossy(&msg));
///     }
/// }
/// # Ok::<(), securechat::Error>(())
/// ```
pub struct ChatSession {
    ctx: Arc<Mutex<ConnectionContext>>,
    engine: Arc<TlsEngine>,
    status: StatusCell,
    events: Sender<SessionEvent>,
    worker: Option<Worker>,
}

impl ChatSession {
    pub fn new(ctx: ConnectionContext, engine: TlsEngine) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = channel();
        let session = Self {
            status: ctx.status_cell(),
            ctx: Arc::new(Mutex::new(ctx)),
            engine: Arc::new(engine),
            events: tx,
            worker: None,
        };
        (session, rx)
    }

    /// Current lifecycle status, read without taking the context lock.
    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Runs `f` with the context locked, e.g. to change configuration or read
    /// diagnostics. Blocks for at most one poll interval while a read is in
    /// progress.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ConnectionContext) -> R) -> R {
        f(&mut lock_context(&self.ctx))
    }

    /// Connects (client) or starts listening (server), then starts the
    /// background worker.
    #[instrument(skip(self))]
    pub fn connect(&mut self) -> Result<(), Error> {
        self.stop_worker();
        {
            let mut ctx = lock_context(&self.ctx);
            self.engine.configure(&mut ctx)?;
        }

        let worker = Worker::spawn(
            "securechat-worker",
            self.ctx.clone(),
            self.engine.clone(),
            self.events.clone(),
        );
        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(err) => {
                warn!(?err, "Failed to start worker");
                self.engine.clean_context(&mut lock_context(&self.ctx));
                Err(err)
            }
        }
    }

    /// Sends one message to the peer.
    pub fn send(&self, msg: &[u8]) -> Result<(), Error> {
        self.engine.send_message(&mut lock_context(&self.ctx), msg)
    }

    /// Stops the worker and releases every session resource. Safe to call at
    /// any time, including repeatedly.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) {
        self.stop_worker();
        self.engine.clean_context(&mut lock_context(&self.ctx));
        info!("Session closed");
    }

    /// Returns true while a worker thread is running.
    pub fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(self.engine.settings().shutdown_grace);
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// A panic while the lock was held leaves the context in a state the engine
// can still clean up, so poisoning is ignored.
pub(crate) fn lock_context(ctx: &Mutex<ConnectionContext>) -> MutexGuard<'_, ConnectionContext> {
    ctx.lock().unwrap_or_else(PoisonError::into_inner)
}
