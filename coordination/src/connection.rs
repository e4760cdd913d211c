//! Cluster connection state machine
//!
//! [`Connection`] is the transport-agnostic event adapter for one accepted
//! connection. A transport calls [`Connection::on_open`] once the link is
//! established, [`Connection::on_message`] for every text frame and
//! [`Connection::on_close`] exactly once at teardown. Outbound frames,
//! including close frames, are queued on the connection's [`Outbox`].
//!
//! ```text
//! CONNECTED ──identify ok──▶ IDENTIFIED
//!     │                          │
//!     └──── close / teardown ────┴──▶ CLOSED
//! ```
//!
//! Request handling is the free function [`dispatch`], matched
//! exhaustively over [`Request`].

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{Coordinator, SharedCoordinator};
use crate::crash;
use crate::heartbeat;
use crate::link::{ClusterLink, ConnectionState, Outbox};
use crate::notifier::notify_in_background;
use crate::protocol::{self, CloseCode, CloseFrame, Intent, OpCode, Request};

/// Identifier reported before a letter is assigned.
pub const UNASSIGNED: &str = "UNASSIGNED";

/// One cluster connection.
pub struct Connection {
    coordinator: SharedCoordinator,
    outbox: Outbox,
    peer: String,
    link: Option<Arc<ClusterLink>>,
    supervisor: Option<JoinHandle<()>>,
    /// Refused at handshake because the pool was full.
    refused: bool,
    torn_down: bool,
}

impl Connection {
    pub fn new(coordinator: SharedCoordinator, outbox: Outbox, peer: impl Into<String>) -> Self {
        Self {
            coordinator,
            outbox,
            peer: peer.into(),
            link: None,
            supervisor: None,
            refused: false,
            torn_down: false,
        }
    }

    pub fn identifier(&self) -> String {
        self.link
            .as_ref()
            .map(|link| link.identifier().to_string())
            .unwrap_or_else(|| UNASSIGNED.to_string())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.link.as_ref().map(|link| link.session_id())
    }

    pub fn state(&self) -> ConnectionState {
        match &self.link {
            Some(link) => link.state(),
            None if self.refused || self.torn_down => ConnectionState::Closed,
            None => ConnectionState::Connected,
        }
    }

    pub fn link(&self) -> Option<&Arc<ClusterLink>> {
        self.link.as_ref()
    }

    /// Handshake: reserve an identifier, start the heartbeat supervisor and
    /// greet the client.
    ///
    /// Returns false when the pool is full; the coordinator has already
    /// queued the pool-full close.
    pub fn on_open(&mut self) -> bool {
        if self.link.is_some() || self.refused {
            return self.link.is_some();
        }

        let session_id = Uuid::new_v4().to_string();
        let Some(identifier) = self.coordinator.assign_identifier(&session_id, &self.outbox) else {
            self.refused = true;
            return false;
        };

        let link = Arc::new(ClusterLink::new(identifier, session_id, self.outbox.clone()));
        let config = self.coordinator.config();
        let hello = json!({
            "id": link.session_id(),
            "host": config.host_name,
            "heartbeat": config.heartbeat_interval_secs,
            "cluster": identifier.to_string(),
            "total": config.clusters,
            "shard": config.shards,
        });
        if let Err(e) = link.send(OpCode::Hello, &hello) {
            debug!(identifier = %identifier, error = %e, "Hello not delivered");
        }

        self.supervisor = Some(heartbeat::spawn_supervisor(
            Arc::clone(&link),
            config.heartbeat_interval(),
            config.heartbeat_grace(),
        ));
        info!(
            identifier = %identifier,
            session_id = %link.session_id(),
            peer = %self.peer,
            "Cluster handshake complete"
        );
        self.link = Some(link);
        true
    }

    /// Handle one raw text frame from the client.
    pub async fn on_message(&mut self, raw: &str) {
        let Some(link) = self.link.clone() else {
            return;
        };
        if !link.is_open() {
            return;
        }

        let message = match protocol::decode(raw) {
            Ok(message) => message,
            Err(frame) => return self.close(&link, frame),
        };
        if !link.is_authenticated() && message.op != OpCode::Identify {
            return self.close(
                &link,
                CloseFrame::new(CloseCode::NotAuthenticated, "Not authenticated"),
            );
        }

        let op = message.op;
        let outcome = match Request::parse(message) {
            Ok(request) => dispatch(&self.coordinator, &link, request).await,
            Err(frame) => Err(frame),
        };
        if let Err(frame) = outcome {
            return self.close(&link, frame);
        }

        if link.is_open() {
            // The client may close right after sending; a lost ack is fine.
            if let Err(e) = link.send(OpCode::Ack, &json!({ "received": op.code() })) {
                debug!(identifier = %link.identifier(), %op, error = %e, "Ack not delivered");
            }
        }
    }

    fn close(&self, link: &ClusterLink, frame: CloseFrame) {
        if link.close(frame.clone()) {
            warn!(
                identifier = %link.identifier(),
                code = frame.code.code(),
                reason = %frame.reason,
                "Closing connection"
            );
        }
    }

    /// Transport teardown, clean or not.
    ///
    /// `peer_close` is the close frame received from the client, if any.
    pub fn on_close(&mut self, clean: bool, peer_close: Option<CloseFrame>) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }

        let sent = match &self.link {
            Some(link) => {
                link.mark_closed();
                self.coordinator.unregister(link.session_id());
                link.sent_close()
            }
            None if self.refused => Some(CloseFrame::new(CloseCode::PoolFull, "Too many clusters")),
            None => None,
        };
        let (frame, clean) = match sent.or(peer_close) {
            Some(frame) => (frame, clean),
            None => (CloseFrame::new(CloseCode::Abnormal, "Connection lost"), false),
        };

        let identifier = self.identifier();
        info!(
            identifier = %identifier,
            peer = %self.peer,
            clean,
            code = frame.code.code(),
            reason = %frame.reason,
            "Connection closed"
        );
        if !clean || !frame.code.is_expected() {
            notify_in_background(
                self.coordinator.notifier(),
                &identifier,
                format!(
                    "Cluster {} Has closed uncleanly with reason {} - {}",
                    identifier, frame.code, frame.reason
                ),
            );
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Apply one validated request to `link`.
///
/// An `Err` is a protocol violation; the caller closes the connection with
/// the returned frame.
pub async fn dispatch(
    coordinator: &Coordinator,
    link: &Arc<ClusterLink>,
    request: Request,
) -> Result<(), CloseFrame> {
    match request {
        Request::Identify {
            authorization,
            identifier,
        } => {
            if link.is_authenticated() {
                return Err(CloseFrame::new(
                    CloseCode::InvalidOpcode,
                    "Payload opcode was not acceptable",
                ));
            }
            if !coordinator.is_authorized(&authorization) {
                return Err(CloseFrame::auth_failed("Client authorization invalid"));
            }
            if identifier != link.identifier().to_string() {
                return Err(CloseFrame::auth_failed("Identifier does not match"));
            }
            if !link.mark_identified() {
                // Closed concurrently, e.g. by the heartbeat supervisor.
                return Ok(());
            }
            coordinator.register(link);
        }
        Request::HeartbeatAck => link.record_heartbeat(),
        Request::Broadcast { intent, content } => {
            coordinator.broadcast(link.session_id(), &Intent::new(&intent, content));
        }
        Request::Dedupe {
            scope,
            content,
            req,
        } => {
            // JSON text keys keep the number 7 and the string "7" apart.
            let duplicate = coordinator.dedupe(&scope, &content.to_string());
            let reply = json!({ "duplicate": duplicate, "req": req });
            if let Err(e) = link.send(OpCode::Dedupe, &reply) {
                debug!(identifier = %link.identifier(), error = %e, "Dedupe reply not delivered");
            }
        }
        Request::Event { intent } => {
            info!(identifier = %link.identifier(), intent = %intent, "Event received");
        }
        Request::Panic { error, traceback } => {
            let identifier = link.identifier().to_string();
            match crash::write_report(
                &coordinator.config().crash_dir,
                &identifier,
                error.as_ref(),
                traceback.as_ref(),
            )
            .await
            {
                Ok(path) => info!(identifier = %identifier, path = %path.display(), "Crash report saved"),
                Err(e) => warn!(identifier = %identifier, error = %e, "Failed to save crash report"),
            }
            link.close(CloseFrame::new(
                CloseCode::ClientException,
                "Client exception thrown",
            ));
            notify_in_background(
                coordinator.notifier(),
                &identifier,
                format!(
                    "Cluster {} Has crashed {}",
                    identifier,
                    crash::render_field(error.as_ref())
                ),
            );
        }
    }
    Ok(())
}
