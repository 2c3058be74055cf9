//! The weir control plane.
//!
//! Maintains a versioned, shared-memory description of how dataplane
//! workers classify and forward packets through a tree of processing
//! stages. Controller processes ("agents") mutate the description through
//! copy-on-write configuration generations; workers read the active
//! generation lock-free on every packet and advertise the generation they
//! execute against, which gates retirement of replaced memory.
//!
//! The pieces, bottom up:
//!
//! - [`Registry`]: name-keyed, reference-counted item arrays; the unit
//!   of copy-on-write between generations.
//! - [`counter`]: declared counter registries, path-keyed storages, and
//!   value carry-over across updates.
//! - [`entity`]: the five configurable entities (module, chain,
//!   function, pipeline, device) and their builders.
//! - [`ConfigGen`]: one immutable configuration snapshot.
//! - [`ectx`]: the index-keyed projection workers consume at packet
//!   time.
//! - [`ControlPlane`] / [`Agent`]: zone layout, the writer lock, the
//!   install sequence and the agent-facing update API.
//! - [`Worker`]: the lock-free read path and generation advertisement.

mod agent;
mod config;
pub mod counter;
mod ectx;
pub mod entity;
mod error;
mod generation;
mod reader;
mod registry;
#[cfg(test)]
mod testutil;
mod zone;

pub use agent::AgentRec;
pub use config::{ChainConfig, DeviceConfig, FunctionConfig, ModuleConfig, PipelineConfig};
pub use ectx::{
	ChainEctx, DeviceEctx, DeviceEntryEctx, FunctionEctx, GenEctx, ModuleEctx, PipelineEctx,
};
pub use error::{Diag, EntityKind, Error, drain_diags, push_diag};
pub use generation::ConfigGen;
pub use reader::{Snapshot, Worker};
pub use registry::{Embedded, Registry, RegistryItem};
pub use zone::{Agent, ControlPlane, CpConfig};
