//! Per-connection state shared between tasks
//!
//! A [`ClusterLink`] is created at handshake and shared by three parties:
//! the connection's dispatch loop, its heartbeat supervisor, and the
//! coordinator (which relays broadcasts through it). All mutable fields
//! sit behind one lock, so every reader sees a consistent snapshot and the
//! heartbeat flag is only cleared by the party that observed it set.
//!
//! Frames leave through an [`Outbox`], an unbounded channel drained by
//! whatever transport owns the socket.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::protocol::{CloseFrame, Frame, Intent, OpCode};

/// Error type for outbound delivery
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection already closed")]
    Closed,

    #[error("Transport dropped")]
    Disconnected,
}

/// Frames queued for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close(CloseFrame),
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Create an outbox together with the receiver a transport drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn push(&self, frame: Outbound) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Disconnected)
    }

    pub fn close(&self, frame: CloseFrame) -> Result<(), TransportError> {
        self.push(Outbound::Close(frame))
    }
}

/// Lifecycle of a cluster connection. There are no backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, identify not yet accepted.
    Connected,
    /// Authenticated and registered with the coordinator.
    Identified,
    /// Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "CONNECTED"),
            Self::Identified => write!(f, "IDENTIFIED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug)]
struct LinkState {
    state: ConnectionState,
    /// Messages sent so far; the first frame carries seq 1.
    sequence: u64,
    awaiting_heartbeat: bool,
    /// Close frame sent by this side, if any.
    sent_close: Option<CloseFrame>,
}

/// Shared state of one identified-or-handshaking cluster connection.
pub struct ClusterLink {
    identifier: char,
    session_id: String,
    state: Mutex<LinkState>,
    wake: Notify,
    /// Woken for every waiter when the link enters `CLOSED`.
    closed: Notify,
    outbox: Outbox,
}

impl ClusterLink {
    pub fn new(identifier: char, session_id: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            identifier,
            session_id: session_id.into(),
            state: Mutex::new(LinkState {
                state: ConnectionState::Connected,
                sequence: 0,
                awaiting_heartbeat: true,
                sent_close: None,
            }),
            wake: Notify::new(),
            closed: Notify::new(),
            outbox,
        }
    }

    pub fn identifier(&self) -> char {
        self.identifier
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Identified
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn sent_close(&self) -> Option<CloseFrame> {
        self.lock().sent_close.clone()
    }

    /// `CONNECTED → IDENTIFIED`. Returns false from any other state.
    pub fn mark_identified(&self) -> bool {
        let mut state = self.lock();
        if state.state != ConnectionState::Connected {
            return false;
        }
        state.state = ConnectionState::Identified;
        true
    }

    /// Serialize and queue a frame, stamping the next sequence number.
    pub fn send(&self, op: OpCode, data: &Value) -> Result<u64, TransportError> {
        let mut state = self.lock();
        if state.state == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        state.sequence += 1;
        let seq = state.sequence;
        let text = Frame { op, seq, data }.encode();
        // Queue while still holding the lock so seq order matches wire order.
        self.outbox.push(Outbound::Text(text))?;
        trace!(identifier = %self.identifier, %op, seq, "Frame queued");
        Ok(seq)
    }

    /// Relay `intent` unless this link is the one that broadcast it.
    ///
    /// Returns whether a frame was queued.
    pub fn dispatch(&self, origin: &str, intent: &Intent) -> Result<bool, TransportError> {
        if origin == self.session_id {
            return Ok(false);
        }
        self.send(intent.op(), &intent.payload())?;
        Ok(true)
    }

    /// Send a close frame and enter `CLOSED`.
    ///
    /// Only the first close takes effect; later calls return false.
    pub fn close(&self, frame: CloseFrame) -> bool {
        {
            let mut state = self.lock();
            if state.state == ConnectionState::Closed {
                return false;
            }
            state.state = ConnectionState::Closed;
            state.sent_close = Some(frame.clone());
            // A dropped transport has nothing left to close.
            let _ = self.outbox.close(frame);
        }
        self.wake.notify_one();
        self.closed.notify_waiters();
        true
    }

    /// Enter `CLOSED` after the transport went away without our close.
    pub fn mark_closed(&self) {
        self.lock().state = ConnectionState::Closed;
        self.wake.notify_one();
        self.closed.notify_waiters();
    }

    /// Resolve once the link is `CLOSED`, whichever task closed it.
    pub async fn closed(&self) {
        loop {
            // Registered before the state check so a close in between is not missed.
            let notified = self.closed.notified();
            if !self.is_open() {
                return;
            }
            notified.await;
        }
    }

    /// Record a heartbeat-ack from the client.
    pub fn record_heartbeat(&self) {
        self.lock().awaiting_heartbeat = false;
        self.wake.notify_one();
    }

    /// Consume a pending heartbeat-ack, re-arming the flag for the next
    /// cycle. Returns false when no ack arrived since the last call.
    pub fn take_heartbeat(&self) -> bool {
        let mut state = self.lock();
        if state.awaiting_heartbeat {
            return false;
        }
        state.awaiting_heartbeat = true;
        true
    }

    /// Wait for the next heartbeat-ack.
    ///
    /// Resolves to true when an ack was consumed and false once the link
    /// closes.
    pub async fn wait_heartbeat(&self) -> bool {
        loop {
            if !self.is_open() {
                return false;
            }
            if self.take_heartbeat() {
                return true;
            }
            self.wake.notified().await;
        }
    }
}

impl fmt::Debug for ClusterLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterLink")
            .field("identifier", &self.identifier)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}
