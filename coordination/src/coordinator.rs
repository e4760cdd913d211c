//! Cluster coordinator - registry, identifier allocation, relay and dedupe
//!
//! Process-wide state shared by every connection:
//!
//! - the membership table, one slot per live identifier (a slot is
//!   reserved at handshake and becomes a broadcast target on identify);
//! - the per-scope dedupe tables.
//!
//! Both tables sit behind their own mutex. No lock is held across an
//! await point, so a connection's handshake or dedupe query never waits on
//! another connection's I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::BoundedCache;
use crate::config::GatewayConfig;
use crate::link::{ClusterLink, Outbox};
use crate::notifier::SharedNotifier;
use crate::protocol::{CloseCode, CloseFrame, Intent};

/// Shared reference to Coordinator
pub type SharedCoordinator = Arc<Coordinator>;

/// One held identifier.
struct Slot {
    identifier: char,
    session_id: String,
    /// Set once the connection identifies.
    link: Option<Arc<ClusterLink>>,
}

/// Snapshot of a membership slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub identifier: char,
    pub session_id: String,
    pub identified: bool,
}

type ScopeTable = BoundedCache<String, u64>;

/// Coordinates the cluster pool.
pub struct Coordinator {
    config: GatewayConfig,
    notifier: SharedNotifier,
    members: Mutex<Vec<Slot>>,
    dedupe: Mutex<HashMap<String, ScopeTable>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Coordinator {
    pub fn new(config: GatewayConfig, notifier: SharedNotifier) -> Self {
        Self {
            config,
            notifier,
            members: Mutex::new(Vec::new()),
            dedupe: Mutex::new(HashMap::new()),
        }
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedCoordinator {
        Arc::new(self)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn notifier(&self) -> &SharedNotifier {
        &self.notifier
    }

    pub fn is_authorized(&self, token: &str) -> bool {
        self.config.is_authorized(token)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Reserve the first free identifier for a handshaking connection.
    ///
    /// When the pool is full the connection is closed with the pool-full
    /// code through `outbox` and `None` is returned.
    pub fn assign_identifier(&self, session_id: &str, outbox: &Outbox) -> Option<char> {
        let assigned = {
            let mut members = lock(&self.members);
            if members.len() >= self.config.clusters {
                None
            } else {
                let identifier = self
                    .config
                    .identifiers()
                    .find(|id| members.iter().all(|slot| slot.identifier != *id));
                if let Some(identifier) = identifier {
                    members.push(Slot {
                        identifier,
                        session_id: session_id.to_string(),
                        link: None,
                    });
                }
                identifier
            }
        };

        match assigned {
            Some(identifier) => {
                debug!(identifier = %identifier, session_id, "Identifier reserved");
            }
            None => {
                warn!(
                    session_id,
                    clusters = self.config.clusters,
                    "Cluster pool full, refusing connection"
                );
                let _ = outbox.close(CloseFrame::new(CloseCode::PoolFull, "Too many clusters"));
            }
        }
        assigned
    }

    /// Make an identified link a broadcast target.
    ///
    /// Returns false when the link's reservation is gone or it was already
    /// registered.
    pub fn register(&self, link: &Arc<ClusterLink>) -> bool {
        let mut members = lock(&self.members);
        let Some(slot) = members
            .iter_mut()
            .find(|slot| slot.session_id == link.session_id())
        else {
            debug!(session_id = link.session_id(), "Register without reservation ignored");
            return false;
        };
        if slot.link.is_some() {
            return false;
        }
        slot.link = Some(Arc::clone(link));
        info!(
            identifier = %slot.identifier,
            session_id = %slot.session_id,
            "Registered cluster"
        );
        true
    }

    /// Release the identifier held by `session_id`. Idempotent.
    pub fn unregister(&self, session_id: &str) -> bool {
        let mut members = lock(&self.members);
        let Some(pos) = members.iter().position(|slot| slot.session_id == session_id) else {
            return false;
        };
        let slot = members.remove(pos);
        info!(
            identifier = %slot.identifier,
            session_id = %slot.session_id,
            "Unregistered cluster"
        );
        true
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        lock(&self.members)
            .iter()
            .map(|slot| MemberInfo {
                identifier: slot.identifier,
                session_id: slot.session_id.clone(),
                identified: slot.link.is_some(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Relay
    // =========================================================================

    /// Relay `intent` to every identified connection except `origin`.
    ///
    /// A peer that cannot be reached is skipped. Returns the number of
    /// peers the intent was queued for.
    pub fn broadcast(&self, origin: &str, intent: &Intent) -> usize {
        let targets: Vec<Arc<ClusterLink>> = lock(&self.members)
            .iter()
            .filter_map(|slot| slot.link.clone())
            .collect();

        let mut delivered = 0;
        for link in targets {
            match link.dispatch(origin, intent) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        identifier = %link.identifier(),
                        intent = %intent.name,
                        error = %e,
                        "Relay to cluster failed"
                    );
                }
            }
        }
        debug!(intent = %intent.name, delivered, "Broadcast relayed");
        delivered
    }

    // =========================================================================
    // Dedupe
    // =========================================================================

    /// Record `hash` under `scope`, returning whether it was seen before.
    ///
    /// The first sighting stores a count of one and returns false; every
    /// later sighting bumps the count and returns true.
    pub fn dedupe(&self, scope: &str, hash: &str) -> bool {
        let mut scopes = lock(&self.dedupe);
        let table = scopes
            .entry(scope.to_string())
            .or_insert_with(|| BoundedCache::new(self.config.dedupe_capacity));

        let duplicate = match table.get_mut(&hash.to_string()) {
            Some(count) => {
                *count += 1;
                true
            }
            None => {
                table.set(hash.to_string(), 1);
                false
            }
        };
        debug!(scope, hash, duplicate, "Dedupe query");
        duplicate
    }

    /// Times `hash` has been seen under `scope`, without touching recency.
    pub fn dedupe_count(&self, scope: &str, hash: &str) -> Option<u64> {
        lock(&self.dedupe)
            .get(scope)
            .and_then(|table| table.peek(&hash.to_string()).copied())
    }
}
