//! Background polling worker.
//!
//! A worker runs the listener loop while the context is `Listening` and the
//! reader loop while it is `Connected`, so one server-side worker turns into a
//! reader once its peer is accepted. It exits when the context leaves both
//! states, when a stop request arrives, or when the stop sender is dropped.

use super::{lock_context, SessionEvent};
use crate::context::{ConnectionContext, Status};
use crate::error::Error;
use crate::transport::{ListenOutcome, ReadOutcome, TlsEngine};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// What the loop does after a tick
enum Step {
    // Work was done; check for stop and go again.
    Busy,
    // Nothing to do; wait one poll interval.
    Idle,
    Exit,
}

/// Handle to a running worker thread.
pub(crate) struct Worker {
    name: String,
    stop: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(
        name: &str,
        ctx: Arc<Mutex<ConnectionContext>>,
        engine: Arc<TlsEngine>,
        events: Sender<SessionEvent>,
    ) -> Result<Self, Error> {
        let (stop_tx, stop_rx) = channel();
        let (done_tx, done_rx) = channel();
        let poll_interval = engine.settings().poll_interval;

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                run(&ctx, &engine, &events, &stop_rx, poll_interval);
                let _ = done_tx.send(());
            })?;

        debug!(worker = name, "Worker started");
        Ok(Self {
            name: name.to_string(),
            stop: stop_tx,
            done: done_rx,
            handle,
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Asks the worker to stop and waits up to `grace` for it. A worker that
    /// does not exit in time is detached.
    pub(crate) fn shutdown(self, grace: Duration) {
        let _ = self.stop.send(());
        match self.done.recv_timeout(grace) {
            // A disconnected done channel means the thread is gone already.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!(worker = %self.name, "Worker panicked");
                } else {
                    debug!(worker = %self.name, "Worker stopped");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, ?grace, "Worker did not stop in time, detaching");
            }
        }
    }
}

fn run(
    ctx: &Mutex<ConnectionContext>,
    engine: &TlsEngine,
    events: &Sender<SessionEvent>,
    stop: &Receiver<()>,
    poll_interval: Duration,
) {
    loop {
        let step = tick(ctx, engine, events);

        let stopped = match step {
            Step::Exit => break,
            Step::Busy => match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => true,
                Err(TryRecvError::Empty) => false,
            },
            Step::Idle => match stop.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
        };
        if stopped {
            debug!("Stop requested");
            break;
        }
    }
    trace!("Worker loop finished");
}

fn tick(
    ctx: &Mutex<ConnectionContext>,
    engine: &TlsEngine,
    events: &Sender<SessionEvent>,
) -> Step {
    let mut ctx = lock_context(ctx);
    let (event, step) = match ctx.status() {
        Status::Listening => listen_tick(engine, &mut ctx),
        Status::Connected => read_tick(engine, &mut ctx),
        status => {
            debug!(?status, "Nothing to poll");
            return Step::Exit;
        }
    };
    drop(ctx);

    if let Some(event) = event {
        if events.send(event).is_err() {
            info!("Event receiver dropped, stopping worker");
            return Step::Exit;
        }
    }
    step
}

fn listen_tick(engine: &TlsEngine, ctx: &mut ConnectionContext) -> (Option<SessionEvent>, Step) {
    match engine.listen_incoming(ctx) {
        Ok(ListenOutcome::Accepted(peer)) => (Some(SessionEvent::Accepted(peer)), Step::Busy),
        Ok(ListenOutcome::Pending) => (None, Step::Idle),
        Err(err) => (Some(SessionEvent::ListenFailed(err.to_string())), Step::Exit),
    }
}

fn read_tick(engine: &TlsEngine, ctx: &mut ConnectionContext) -> (Option<SessionEvent>, Step) {
    match engine.read_incoming(ctx) {
        Ok(ReadOutcome::Data(_)) => (
            Some(SessionEvent::Received(ctx.received().to_vec())),
            Step::Busy,
        ),
        // The socket read already waited one poll interval. Idle anyway so a
        // sender gets a chance at the lock.
        Ok(ReadOutcome::Pending) => (None, Step::Idle),
        Ok(ReadOutcome::PeerClosed) => (Some(SessionEvent::PeerDisconnected), Step::Exit),
        // The session stays connected; whoever owns it decides what happens next.
        Err(err) => (Some(SessionEvent::ReadFailed(err.to_string())), Step::Exit),
    }
}
