//! Arena-resident configuration entities.
//!
//! Each entity is built from a validated config blob into an immutable
//! `#[repr(C)]` descriptor allocated in one shot with a flexible-array
//! tail, embedding its registry header and its declared counter registry.
//! Builders validate every name reference, release partial allocations on
//! failure, and return the structured error.

mod chain;
mod device;
mod function;
mod module;
mod pipeline;

pub use chain::{Chain, ModuleRef};
pub use device::{Device, DeviceEntry, PipelineSlot};
pub use function::{ChainSlot, Function};
pub use module::Module;
pub use pipeline::Pipeline;
