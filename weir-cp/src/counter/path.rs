//! Tuple keys for counter-storage lookup.

use weir_shm::Name;

/// Which prefix of the entity tuple a [`CounterPath`] keys.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum PathFlavor {
	/// (device)
	Device   = 0,
	/// (device, pipeline)
	Pipeline = 1,
	/// (device, pipeline, function)
	Function = 2,
	/// (device, pipeline, function, chain)
	Chain    = 3,
	/// (device, pipeline, function, chain, module type, module)
	Module   = 4,
}

/// A compound counter-storage key.
///
/// Five flavors, one per entity level; unused components hold the empty
/// name so that equal paths are bit-identical and compare bytewise.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct CounterPath {
	/// Which prefix of the tuple is populated.
	flavor:      PathFlavor,
	/// Device name.
	device:      Name,
	/// Pipeline name.
	pipeline:    Name,
	/// Function name.
	function:    Name,
	/// Chain name.
	chain:       Name,
	/// Module handler type.
	module_type: Name,
	/// Module name.
	module:      Name,
}

impl CounterPath {
	/// The (device) path.
	#[must_use]
	pub fn device(device: Name) -> Self {
		Self {
			flavor: PathFlavor::Device,
			device,
			pipeline: Name::EMPTY,
			function: Name::EMPTY,
			chain: Name::EMPTY,
			module_type: Name::EMPTY,
			module: Name::EMPTY,
		}
	}

	/// The (device, pipeline) path.
	#[must_use]
	pub fn pipeline(device: Name, pipeline: Name) -> Self {
		Self {
			flavor: PathFlavor::Pipeline,
			pipeline,
			..Self::device(device)
		}
	}

	/// The (device, pipeline, function) path.
	#[must_use]
	pub fn function(device: Name, pipeline: Name, function: Name) -> Self {
		Self {
			flavor: PathFlavor::Function,
			function,
			..Self::pipeline(device, pipeline)
		}
	}

	/// The (device, pipeline, function, chain) path.
	#[must_use]
	pub fn chain(device: Name, pipeline: Name, function: Name, chain: Name) -> Self {
		Self {
			flavor: PathFlavor::Chain,
			chain,
			..Self::function(device, pipeline, function)
		}
	}

	/// The full module path.
	#[must_use]
	pub fn module(
		device: Name,
		pipeline: Name,
		function: Name,
		chain: Name,
		module_type: Name,
		module: Name,
	) -> Self {
		Self {
			flavor: PathFlavor::Module,
			module_type,
			module,
			..Self::chain(device, pipeline, function, chain)
		}
	}

	/// The path's flavor.
	#[must_use]
	pub fn flavor(&self) -> PathFlavor {
		self.flavor
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn name(s: &str) -> Name {
		Name::new(s).unwrap()
	}

	#[test]
	fn flavors_do_not_collide() {
		let dev = CounterPath::device(name("eth0"));
		let pl = CounterPath::pipeline(name("eth0"), name("p0"));
		assert_ne!(dev, pl);
		assert_eq!(pl, CounterPath::pipeline(name("eth0"), name("p0")));
		assert_ne!(pl, CounterPath::pipeline(name("eth0"), name("p1")));
		assert_eq!(pl.flavor(), PathFlavor::Pipeline);
	}
}
