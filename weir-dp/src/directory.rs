//! Per-process name directory over the dataplane tables.

use hashbrown::HashMap;
use weir_shm::Name;

use crate::DpConfig;

/// Hasher used for the directory maps.
type DirState = foldhash::fast::FixedState;

/// A process-local cache of the dataplane name tables.
///
/// Built once when a controller attaches to a zone, so the repeated name
/// resolutions performed by configuration builders avoid rescanning the
/// flat arena tables. Strictly a cache: the arena tables stay the source
/// of truth and are immutable for the life of the zone.
pub struct DpDirectory {
	/// Handler type name to `dp_module_index`.
	modules: HashMap<Name, u64, DirState>,
	/// Device name to `dp_device_index`.
	devices: HashMap<Name, u64, DirState>,
}

impl DpDirectory {
	/// Indexes the zone's dataplane tables.
	#[must_use]
	pub fn new(dp: &DpConfig) -> Self {
		let mut modules = HashMap::with_hasher(DirState::default());
		for (i, m) in dp.modules().iter().enumerate() {
			modules.insert(m.type_name, i as u64);
		}

		let mut devices = HashMap::with_hasher(DirState::default());
		for (i, d) in dp.devices().iter().enumerate() {
			devices.insert(d.name, i as u64);
		}

		Self { modules, devices }
	}

	/// Resolves a handler type name to its `dp_module_index`.
	#[must_use]
	pub fn module(&self, type_name: &Name) -> Option<u64> {
		self.modules.get(type_name).copied()
	}

	/// Resolves a device name to its `dp_device_index`.
	#[must_use]
	pub fn device(&self, name: &Name) -> Option<u64> {
		self.devices.get(name).copied()
	}
}
