//! Cluster Coordination Library
//!
//! Core of the cluster gateway: lets a fixed-size pool of bot clusters,
//! each owning a shard range, behave as one logical system.
//!
//! This library provides:
//! - Cluster authentication and single-letter identifier allocation
//! - Intent relay from one cluster to every other connected cluster
//! - Heartbeat supervision of each connection
//! - Cross-cluster dedupe over bounded per-scope LRU tables
//! - Crash reports and panic notifications for abnormal disconnects
//!
//! The crate holds no socket code. A transport feeds text frames into a
//! [`Connection`] and drains its [`Outbox`].
//!
//! # Usage
//!
//! ```ignore
//! use coordination::{notifier, Connection, Coordinator, GatewayConfig, Outbox};
//!
//! let config = GatewayConfig::load(None)?;
//! let notifier = notifier::from_config(config.panic.as_ref())?;
//! let coordinator = Coordinator::new(config, notifier).shared();
//!
//! // Per accepted transport
//! let (outbox, mut outbound) = Outbox::channel();
//! let mut conn = Connection::new(coordinator.clone(), outbox, "10.0.0.7:51234");
//! conn.on_open();
//! conn.on_message(r#"{"op": 1, "data": {"authorization": "t", "identifier": "A"}}"#).await;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod crash;
pub mod heartbeat;
pub mod link;
pub mod notifier;
pub mod protocol;

pub use cache::BoundedCache;
pub use config::{ConfigError, ConfigResult, GatewayConfig, PanicConfig};
pub use connection::{dispatch, Connection, UNASSIGNED};
pub use coordinator::{Coordinator, MemberInfo, SharedCoordinator};
pub use link::{ClusterLink, ConnectionState, Outbound, Outbox, TransportError};
pub use notifier::{LogNotifier, NotifyError, PanicNotifier, PushedNotifier, SharedNotifier};
pub use protocol::{CloseCode, CloseFrame, Intent, Message, OpCode, Request};
