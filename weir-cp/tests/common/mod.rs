//! Shared fixtures for the control-plane integration tests.
#![allow(dead_code)]

use weir_cp::{
	ChainConfig, ControlPlane, DeviceConfig, FunctionConfig, ModuleConfig, PipelineConfig,
};
use weir_shm::{Name, ShmZone};

/// Zone size for every test; roomy enough for any scenario here.
pub const ZONE_LEN: usize = 1 << 20;

/// Dataplane handler types every test zone publishes.
pub const DP_MODULES: &[&str] = &["balancer", "nat64"];

/// Dataplane devices every test zone publishes.
pub const DP_DEVICES: &[&str] = &["01:00.0", "02:00.0"];

/// Maps an anonymous zone and lays out a control plane over it.
pub fn zone_with_workers(workers: u64) -> (ShmZone, ControlPlane) {
	let zone = ShmZone::anon(ZONE_LEN).expect("test zone");
	let cp =
		ControlPlane::init(&zone, DP_MODULES, DP_DEVICES, workers).expect("zone layout");
	(zone, cp)
}

/// A zone with no advertising workers (installs never wait).
pub fn zone() -> (ShmZone, ControlPlane) {
	zone_with_workers(0)
}

/// Shorthand for validated names in assertions.
pub fn name(s: &str) -> Name {
	Name::new(s).expect("test name")
}

pub fn module(module_type: &str, name: &str) -> ModuleConfig {
	ModuleConfig {
		module_type: module_type.into(),
		name: name.into(),
		..ModuleConfig::default()
	}
}

pub fn chain(name: &str, modules: &[(&str, &str)], weight: u64) -> ChainConfig {
	ChainConfig {
		name: name.into(),
		modules: modules
			.iter()
			.map(|(t, n)| ((*t).into(), (*n).into()))
			.collect(),
		weight,
	}
}

pub fn function(name: &str, chains: Vec<ChainConfig>) -> FunctionConfig {
	FunctionConfig {
		name: name.into(),
		chains,
	}
}

pub fn pipeline(name: &str, functions: &[&str]) -> PipelineConfig {
	PipelineConfig {
		name:      name.into(),
		functions: functions.iter().map(|f| (*f).into()).collect(),
	}
}

pub fn device(name: &str, input: &[(&str, u64)], output: &[(&str, u64)]) -> DeviceConfig {
	let refs = |list: &[(&str, u64)]| {
		list.iter()
			.map(|(p, w)| ((*p).into(), *w))
			.collect::<Vec<(String, u64)>>()
	};
	DeviceConfig {
		name:   name.into(),
		input:  refs(input),
		output: refs(output),
	}
}
