//! Validated configuration input.
//!
//! Agents hand these process-local blobs to the update calls; the entity
//! builders turn them into arena-resident, immutable descriptors. Name
//! and weight validation happens during the build, against the generation
//! being assembled.

/// Configuration for one control-plane module.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
	/// Dataplane handler type, e.g. `balancer`.
	pub module_type: String,
	/// Module instance name.
	pub name:        String,
	/// Devices the module intends to bind to.
	pub devices:     Vec<String>,
	/// Opaque handler configuration, copied into the module's sub-arena.
	pub data:        Vec<u8>,
	/// Sub-arena size in bytes; zero selects the default.
	pub arena_size:  u64,
}

/// One weighted chain inside a function.
#[derive(Debug, Clone)]
pub struct ChainConfig {
	/// Chain name, unique within its function.
	pub name:    String,
	/// Ordered (module type, module name) references.
	pub modules: Vec<(String, String)>,
	/// Positive selection weight.
	pub weight:  u64,
}

/// Configuration for one function.
#[derive(Debug, Clone, Default)]
pub struct FunctionConfig {
	/// Function name.
	pub name:   String,
	/// The function's chains, built and owned inline.
	pub chains: Vec<ChainConfig>,
}

/// Configuration for one pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
	/// Pipeline name.
	pub name:      String,
	/// Ordered function names.
	pub functions: Vec<String>,
}

/// Configuration for one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
	/// Device name; must resolve in the dataplane device table.
	pub name:   String,
	/// Weighted pipeline selection for received packets.
	pub input:  Vec<(String, u64)>,
	/// Weighted pipeline selection for transmitted packets.
	pub output: Vec<(String, u64)>,
}
