//! Error types for cluster operations.

use crate::NodeName;

/// Errors that can occur during cluster operations.
///
/// Routing outcomes (MOVED, ASK, CROSSSLOT, CLUSTERDOWN) are not errors;
/// see [`crate::Route`].
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Bus bytes that can't be decoded. The link they arrived on should be
    /// closed.
    #[error("malformed bus message: {0}")]
    Malformed(String),

    /// A slot claim lost against the current owner's config epoch.
    #[error("slot {slot} is owned by {owner} at config epoch {epoch}")]
    SlotOwnerConflict {
        slot: u16,
        owner: NodeName,
        epoch: u64,
    },

    /// Node not found in the cluster.
    #[error("unknown node {0}")]
    NotFound(NodeName),

    /// A node name that isn't 40 hex characters.
    #[error("invalid node name: {0}")]
    InvalidName(String),

    /// Slot index outside 0..16384.
    #[error("slot {0} is out of range")]
    SlotOutOfRange(u32),

    /// The slot is already assigned.
    #[error("slot {0} is already busy")]
    SlotBusy(u16),

    /// The operation requires this node to own the slot.
    #[error("I'm not the owner of hash slot {0}")]
    NotOwner(u16),

    /// A migration can't complete while the source still holds keys.
    #[error("slot {slot} still has {keys} keys")]
    KeysRemaining { slot: u16, keys: u64 },

    /// Importing a slot the local node already owns.
    #[error("I'm already the owner of hash slot {0}")]
    AlreadyOwner(u16),

    /// Moving keys of a slot that isn't migrating.
    #[error("slot {0} is not being migrated")]
    NotMigrating(u16),

    /// The slot already has a migration marker.
    #[error("slot {0} is already being migrated or imported")]
    MigrationInProgress(u16),

    /// Operation requires a different node role.
    #[error("operation not supported on {role} node")]
    WrongRole { role: String },

    /// The slot has no owner.
    #[error("slot {0} is already unassigned")]
    SlotUnassigned(u16),

    /// A master can't become a replica while it serves slots.
    #[error("can't replicate while serving slots")]
    OwnsSlots,

    /// A replica can't forget the master it replicates.
    #[error("can't forget my master {0}")]
    ForgetPrimary(NodeName),

    /// A coordinated manual failover needs a reachable master.
    #[error("master {0} is down or failed, use FORCE")]
    PrimaryUnreachable(NodeName),

    /// The operation can't target this node itself.
    #[error("can't {0} myself")]
    IsMyself(&'static str),

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}

impl ClusterError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ClusterError::Malformed(msg.into())
    }

    pub(crate) fn wrong_role(role: &str) -> Self {
        ClusterError::WrongRole {
            role: role.to_owned(),
        }
    }
}
