//! Control-plane failure kinds and the per-thread diagnostic stack.

use core::fmt;
use std::cell::RefCell;

use weir_shm::ShmError;

/// The kinds of entity a failure can refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
	/// A control-plane module.
	Module,
	/// A chain within a function.
	Chain,
	/// A function.
	Function,
	/// A pipeline.
	Pipeline,
	/// A device.
	Device,
	/// A dataplane handler type.
	DpModule,
	/// A dataplane device.
	DpDevice,
	/// An attached agent.
	Agent,
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Module => "module",
			Self::Chain => "chain",
			Self::Function => "function",
			Self::Pipeline => "pipeline",
			Self::Device => "device",
			Self::DpModule => "dataplane module",
			Self::DpDevice => "dataplane device",
			Self::Agent => "agent",
		})
	}
}

/// Control-plane errors.
///
/// Builders return these and unwind their own partial allocations before
/// doing so; a failed install never mutates the active generation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The shared arena allocator was exhausted.
	#[error("shared arena exhausted")]
	OutOfArena,
	/// A name reference failed to resolve during a build.
	#[error("{kind} {name:?} not found")]
	NotFound {
		/// What kind of entity was looked up.
		kind: EntityKind,
		/// The name that missed.
		name: String,
	},
	/// A delete was rejected because the entity is still referenced.
	#[error("{kind} {name:?} is referenced by {holder:?}")]
	InUse {
		/// What kind of entity the delete targeted.
		kind: EntityKind,
		/// The targeted name.
		name: String,
		/// A referencing entity.
		holder: String,
	},
	/// A delete targeted a key that is not present.
	#[error("{kind} {name:?} is not present")]
	Duplicate {
		/// What kind of entity the delete targeted.
		kind: EntityKind,
		/// The missing name.
		name: String,
	},
	/// A single-attempt lock acquisition found the lock held.
	#[error("configuration lock is held by another controller")]
	LockContention,
	/// The counter storage allocator failed to materialize backing.
	#[error("counter storage allocation failed")]
	CounterSpawnFailed,
	/// A configured name was empty, oversize, or not ASCII.
	#[error("invalid name {0:?}")]
	InvalidName(String),
	/// A weighted reference carried a zero weight.
	#[error("{kind} {name:?} has a zero-weight reference")]
	InvalidWeight {
		/// The entity carrying the weight list.
		kind: EntityKind,
		/// Its name.
		name: String,
	},
	/// An attach found no weir zone header at the mapping base.
	#[error("mapping does not carry a weir zone header")]
	BadZone,
	/// The zone mapping layer failed.
	#[error("zone error: {0}")]
	Zone(ShmError),
}

impl From<ShmError> for Error {
	fn from(err: ShmError) -> Self {
		match err {
			ShmError::OutOfArena => Self::OutOfArena,
			ShmError::InvalidName(name) => Self::InvalidName(name),
			other => Self::Zone(other),
		}
	}
}

/// One structured record on the diagnostic stack.
#[derive(Debug, Clone)]
pub struct Diag {
	/// The agent-facing operation that failed.
	pub op:     &'static str,
	/// The entity kind the operation targeted.
	pub kind:   EntityKind,
	/// The targeted name, when one applies.
	pub name:   String,
	/// Rendered failure detail.
	pub detail: String,
}

thread_local! {
	/// The per-thread diagnostic stack.
	static DIAGS: RefCell<Vec<Diag>> = const { RefCell::new(Vec::new()) };
}

/// Pushes a record onto the calling thread's diagnostic stack.
pub fn push_diag(diag: Diag) {
	log::warn!(
		"{} failed for {} {:?}: {}",
		diag.op,
		diag.kind,
		diag.name,
		diag.detail
	);
	DIAGS.with(|d| d.borrow_mut().push(diag));
}

/// Drains the calling thread's diagnostic stack in push order.
#[must_use]
pub fn drain_diags() -> Vec<Diag> {
	DIAGS.with(|d| core::mem::take(&mut *d.borrow_mut()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn diag_stack_accumulates_in_order() {
		drop(drain_diags());

		push_diag(Diag {
			op:     "update_modules",
			kind:   EntityKind::Module,
			name:   "b0".into(),
			detail: "dataplane module \"balancer\" not found".into(),
		});
		push_diag(Diag {
			op:     "update_modules",
			kind:   EntityKind::Module,
			name:   "b0".into(),
			detail: "generation aborted".into(),
		});

		let diags = drain_diags();
		assert_eq!(diags.len(), 2);
		assert_eq!(diags[0].detail, "dataplane module \"balancer\" not found");
		assert!(drain_diags().is_empty());
	}

	#[test]
	fn shm_errors_map_to_core_kinds() {
		assert!(matches!(
			Error::from(ShmError::OutOfArena),
			Error::OutOfArena
		));
		assert!(matches!(
			Error::from(ShmError::InvalidName("x".into())),
			Error::InvalidName(_)
		));
	}
}
