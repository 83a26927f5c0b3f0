//! cinder-cluster: membership, failure detection and sharding for cinder.
//!
//! Every node keeps a full view of the cluster and exchanges it with its
//! peers over a binary bus, so the cluster works without any central
//! coordinator.
//!
//! # Architecture
//!
//! - **Slots**: the keyspace is split into 16384 hash slots, each served by
//!   one master
//! - **Gossip**: PING/PONG heartbeats carry the sender's slots and a sample
//!   of what it knows about other nodes
//! - **Failure detection**: local PFAIL suspicion, promoted to FAIL once a
//!   majority of masters agree
//! - **Failover**: replicas of a failed master run an epoch-based election;
//!   the winner takes over its slots
//! - **Migration**: slots move between masters while clients are redirected
//!   with ASK and MOVED
//!
//! The crate does no I/O. [`ClusterState`] is driven by the host: it feeds
//! in decoded messages, link events and periodic ticks, and carries out the
//! [`Action`]s that come back.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cinder_cluster::{ClusterConfig, ClusterState, NodeAddr, NodeName, key_slot};
//!
//! let addr = NodeAddr::from_client("127.0.0.1:7000".parse().unwrap());
//! let mut state = ClusterState::new(ClusterConfig::default(), NodeName::random(), addr, now)?;
//! state.bootstrap()?;
//!
//! // route a key to its slot
//! let slot = key_slot(b"mykey");
//! assert_eq!(state.slot_owner(slot), Some(state.myself_name()));
//! ```

mod bus;
mod config;
mod election;
mod error;
mod failover;
mod failure;
mod gossip;
mod message;
mod migration;
mod slots;
mod state;
mod topology;

pub use bus::{Action, LinkId};
pub use config::ClusterConfig;
pub use election::{Election, ElectionState};
pub use error::ClusterError;
pub use failover::ManualFailoverMode;
pub use message::{
    ClusterMessage, GossipEntry, Header, MessageBody, MessageFlags, MessageType,
    GOSSIP_ENTRY_LEN, HEADER_LEN, MAX_MESSAGE_LEN, PROTOCOL_VERSION, SIGNATURE,
};
pub use migration::{DownReason, Keyspace, Route, RouteRequest};
pub use slots::{check_slot, key_slot, SlotBitmap, SlotMap, SlotRange, SLOT_COUNT};
pub use state::{ClusterHealth, ClusterState};
pub use topology::{
    ClusterNode, FailReport, NodeAddr, NodeFlags, NodeLink, NodeName, NodeObservation,
    BUS_PORT_OFFSET, NAME_LEN,
};
