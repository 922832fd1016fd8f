pub mod config;
pub mod install;
pub mod node;
pub mod pipeline;
pub mod probe;
pub mod rank;
pub mod scheduler;
pub mod sources;
pub mod util;
pub mod version;
pub mod xray;
