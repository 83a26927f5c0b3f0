//! Live slot migration and request routing.
//!
//! Moving a slot between masters follows these steps:
//!
//! 1. The destination marks the slot importing from the source
//!    ([`ClusterState::begin_import`]).
//! 2. The source marks it migrating to the destination
//!    ([`ClusterState::begin_migration`]).
//! 3. Keys are moved one by one ([`ClusterState::migrate_keys`]). Meanwhile
//!    the source answers ASK for keys it no longer has, and the destination
//!    serves clients that sent ASKING.
//! 4. Once the source is empty, both sides call
//!    [`ClusterState::complete_migration`], which reassigns the slot under a
//!    new config epoch and broadcasts an UPDATE.
//!
//! [`ClusterState::route`] is the check the command layer runs before every
//! keyed request.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info};

use crate::bus::Action;
use crate::slots::{check_slot, key_slot};
use crate::topology::NodeAddr;
use crate::{ClusterError, ClusterHealth, ClusterState, NodeName};

/// The local key store, as far as migration and routing need it.
pub trait Keyspace {
    fn contains_key(&self, key: &[u8]) -> bool;

    /// Moves one key of `slot` to the node at `target`. Returns false once
    /// the slot has no keys left.
    fn move_one_key(&mut self, slot: u16, target: &NodeAddr) -> bool;
}

/// The parts of a client request routing looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteRequest<'a> {
    pub keys: &'a [&'a [u8]],
    /// The client sent ASKING just before this request.
    pub asking: bool,
    /// The client sent READONLY.
    pub readonly: bool,
    /// The command modifies data.
    pub write: bool,
}

/// Why requests are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
    /// The cluster state is FAIL.
    State,
    /// The request's slot has no owner.
    Unbound,
}

/// Where a request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    /// The slot lives elsewhere; clients should update their slot cache.
    Moved { slot: u16, addr: SocketAddr },
    /// Retry this one request on `addr`, preceded by ASKING.
    Ask { slot: u16, addr: SocketAddr },
    /// Keys hash to different slots.
    CrossSlot,
    /// Multi-key request on a slot being migrated, with some keys missing.
    TryAgain { slot: u16 },
    ClusterDown(DownReason),
}

impl Route {
    /// Client-facing error line, `None` for [`Route::Local`].
    pub fn to_error_string(&self) -> Option<String> {
        match self {
            Route::Local => None,
            Route::Moved { slot, addr } => Some(format!("MOVED {} {}", slot, addr)),
            Route::Ask { slot, addr } => Some(format!("ASK {} {}", slot, addr)),
            Route::CrossSlot => {
                Some("CROSSSLOT Keys in request don't hash to the same slot".into())
            }
            Route::TryAgain { .. } => {
                Some("TRYAGAIN Multiple keys request during rehashing of slot".into())
            }
            Route::ClusterDown(DownReason::State) => Some("CLUSTERDOWN The cluster is down".into()),
            Route::ClusterDown(DownReason::Unbound) => {
                Some("CLUSTERDOWN Hash slot not served".into())
            }
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_error_string() {
            Some(err) => f.write_str(&err),
            None => f.write_str("local"),
        }
    }
}

impl ClusterState {
    /// Marks a slot the local node owns as migrating to `dest`.
    pub fn begin_migration(&mut self, slot: u16, dest: &NodeName) -> Result<(), ClusterError> {
        self.check_migration_slot(slot)?;
        if self.slots.get(slot) != Some(self.myself) {
            return Err(ClusterError::NotOwner(slot));
        }
        if *dest == self.myself {
            return Err(ClusterError::IsMyself("migrate to"));
        }
        let target = self.nodes.get(dest).ok_or(ClusterError::NotFound(*dest))?;
        if !target.is_primary() {
            return Err(ClusterError::wrong_role("replica"));
        }
        self.migrating_to.set(slot, Some(*dest));
        info!("slot {} migrating to {}", slot, dest.short());
        Ok(())
    }

    /// Marks a slot another node owns as importing from `source`.
    pub fn begin_import(&mut self, slot: u16, source: &NodeName) -> Result<(), ClusterError> {
        self.check_migration_slot(slot)?;
        if self.slots.get(slot) == Some(self.myself) {
            return Err(ClusterError::AlreadyOwner(slot));
        }
        if *source == self.myself {
            return Err(ClusterError::IsMyself("import from"));
        }
        if !self.nodes.contains_key(source) {
            return Err(ClusterError::NotFound(*source));
        }
        self.importing_from.set(slot, Some(*source));
        info!("slot {} importing from {}", slot, source.short());
        Ok(())
    }

    fn check_migration_slot(&self, slot: u16) -> Result<(), ClusterError> {
        check_slot(u32::from(slot))?;
        if !self.myself().is_primary() {
            return Err(ClusterError::wrong_role("replica"));
        }
        if self.migrating_to.get(slot).is_some() || self.importing_from.get(slot).is_some() {
            return Err(ClusterError::MigrationInProgress(slot));
        }
        Ok(())
    }

    /// Clears both migration markers of a slot.
    pub fn abort_migration(&mut self, slot: u16) -> Result<(), ClusterError> {
        check_slot(u32::from(slot))?;
        let migrating = self.migrating_to.set(slot, None);
        let importing = self.importing_from.set(slot, None);
        if migrating.is_some() || importing.is_some() {
            info!("migration of slot {} aborted", slot);
        }
        Ok(())
    }

    /// Moves up to `max` keys of a migrating slot to its destination.
    /// Returns how many were moved.
    pub fn migrate_keys(
        &mut self,
        slot: u16,
        keyspace: &mut impl Keyspace,
        max: usize,
    ) -> Result<usize, ClusterError> {
        let dest = self
            .migrating_to
            .get(slot)
            .ok_or(ClusterError::NotMigrating(slot))?;
        let target = self
            .nodes
            .get(&dest)
            .map(|n| n.addr)
            .ok_or(ClusterError::NotFound(dest))?;

        let mut moved = 0;
        while moved < max && keyspace.move_one_key(slot, &target) {
            self.key_removed(slot);
            moved += 1;
        }
        debug!("moved {} keys of slot {} to {}", moved, slot, dest.short());
        Ok(moved)
    }

    /// Hands a migrated slot over to its new owner.
    ///
    /// On the source the slot must be empty; it is assigned to the
    /// destination with a fresh config epoch. On the destination the slot is
    /// claimed with a bumped epoch. Either way an UPDATE is broadcast.
    /// Without migration markers this is a no-op.
    pub fn complete_migration(&mut self, slot: u16, now: Instant) -> Result<Vec<Action>, ClusterError> {
        check_slot(u32::from(slot))?;
        let mut out = Vec::new();

        if let Some(dest) = self.migrating_to.get(slot) {
            let keys = self.keys_in_slot(slot);
            if keys > 0 {
                return Err(ClusterError::KeysRemaining { slot, keys });
            }
            if !self.nodes.contains_key(&dest) {
                return Err(ClusterError::NotFound(dest));
            }
            self.current_epoch += 1;
            let epoch = self.current_epoch;
            if let Some(node) = self.nodes.get_mut(&dest) {
                node.config_epoch = epoch;
            }
            self.set_slot_owner(slot, Some(dest));
            self.migrating_to.set(slot, None);
            self.importing_from.set(slot, None);
            info!(
                "slot {} handed over to {} at config epoch {}",
                slot,
                dest.short(),
                epoch
            );
            self.broadcast_update(&dest, &mut out);
        } else if let Some(source) = self.importing_from.get(slot) {
            let me = self.myself;
            self.set_slot_owner(slot, Some(me));
            self.importing_from.set(slot, None);
            let epoch = self.bump_config_epoch();
            info!(
                "slot {} imported from {} at config epoch {}",
                slot,
                source.short(),
                epoch
            );
            self.broadcast_update(&me, &mut out);
            self.broadcast_pong(now, &mut out);
        } else {
            debug!("slot {} has no migration to complete", slot);
            return Ok(out);
        }

        self.update_state();
        Ok(out)
    }

    /// Decides where a request should run.
    pub fn route(&self, request: &RouteRequest<'_>, keyspace: &impl Keyspace) -> Route {
        let Some((first, rest)) = request.keys.split_first() else {
            return Route::Local;
        };
        let slot = key_slot(first);
        if rest.iter().any(|k| key_slot(k) != slot) {
            return Route::CrossSlot;
        }
        if self.state == ClusterHealth::Fail {
            return Route::ClusterDown(DownReason::State);
        }
        let Some(owner) = self.slots.get(slot) else {
            return Route::ClusterDown(DownReason::Unbound);
        };

        let migrating = owner == self.myself && self.migrating_to.get(slot).is_some();
        let importing = self.importing_from.get(slot).is_some();
        let missing = if migrating || importing {
            request
                .keys
                .iter()
                .filter(|k| !keyspace.contains_key(k))
                .count()
        } else {
            0
        };

        if migrating && missing > 0 {
            if let Some(addr) = self
                .migrating_to
                .get(slot)
                .and_then(|dest| self.nodes.get(&dest))
                .map(|n| n.addr.client_addr())
            {
                return Route::Ask { slot, addr };
            }
        }
        if importing && request.asking {
            if request.keys.len() > 1 && missing > 0 {
                return Route::TryAgain { slot };
            }
            return Route::Local;
        }

        let me = self.myself();
        if request.readonly && !request.write && me.is_replica() && me.replicates == Some(owner) {
            return Route::Local;
        }
        if owner == self.myself {
            return Route::Local;
        }
        match self.nodes.get(&owner) {
            Some(node) => Route::Moved {
                slot,
                addr: node.addr.client_addr(),
            },
            None => Route::ClusterDown(DownReason::Unbound),
        }
    }
}
