//! Multi-node scenarios driven through the in-memory harness.

mod failover;
mod helpers;
mod membership;
mod migration;
