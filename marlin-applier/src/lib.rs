//! Replication log applier: follows the master's copied log files,
//! decodes replication records and re-executes row operations against a
//! replica database through the standard client library seam.

pub mod applier;
pub mod cache;
pub mod error;
pub mod item;
pub mod replica;

pub use applier::{Applier, StepOutcome};
pub use cache::LogCache;
pub use error::{Error, Result};
pub use replica::{ApplierState, ApplyInfo, MasterState, MemReplica, ReplicaClient};
