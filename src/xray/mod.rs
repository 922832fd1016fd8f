pub mod builder;
pub mod process;

pub use builder::{EngineConfig, Outbound, SynthesisError, build_outbound, synthesize};
pub use process::{EngineOptions, OrchestrateError, ProbeContext, ReadinessMode};
