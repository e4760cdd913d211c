//! Heartbeat supervisor
//!
//! One task per connection, started at handshake. Each cycle waits for a
//! heartbeat-ack for at most `interval + grace`; an ack starts the next
//! cycle, silence closes the connection with the heartbeat-timeout code.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::link::ClusterLink;
use crate::protocol::{CloseCode, CloseFrame};

/// Spawn the supervisor for `link`. It exits on its own once the link closes.
pub fn spawn_supervisor(link: Arc<ClusterLink>, interval: Duration, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(supervise(link, interval, grace))
}

async fn supervise(link: Arc<ClusterLink>, interval: Duration, grace: Duration) {
    let window = interval + grace;
    let mut beats = 0u64;
    loop {
        match tokio::time::timeout(window, link.wait_heartbeat()).await {
            Ok(true) => {
                beats += 1;
                trace!(identifier = %link.identifier(), beats, "Heartbeat received");
            }
            Ok(false) => {
                debug!(identifier = %link.identifier(), "Heartbeat supervisor stopped");
                return;
            }
            Err(_) => {
                if link.close(CloseFrame::new(
                    CloseCode::HeartbeatTimeout,
                    "No heartbeat received",
                )) {
                    warn!(
                        identifier = %link.identifier(),
                        session_id = %link.session_id(),
                        window_secs = window.as_secs(),
                        "Heartbeat timeout, closing connection"
                    );
                }
                return;
            }
        }
    }
}
