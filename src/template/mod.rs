//! Template rendering
//!
//! Deterministic rendering of a spec model into CAPI manifest byte streams.
//! Providers plug infrastructure-specific pieces into the shared renderer;
//! value maps are the contract between the two halves.
//!
//! - [`values`] - control-plane and worker value-map builders
//! - [`extra_args`] - per-component flag-map builders
//! - [`names`] - stable object names and timestamped template names
//! - [`renderer`] - value map → manifest document generation

pub mod extra_args;
pub mod names;
pub mod renderer;
pub mod values;

pub use extra_args::ExtraArgs;
pub use names::{system_now, NowFn};
pub use renderer::{InfraTemplates, MachineRole, TemplateRenderer};
pub use values::{BuildOption, Values};
