pub mod duration;
mod spec;

pub use spec::{load_spec, parse_spec, ReadinessConfig, ServiceSpec, StopSignal};
