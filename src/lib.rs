/* src/lib.rs */

//! Test fixtures that run an external service process, wait until it is
//! usable, and tear it down deterministically.
//!
//! ```no_run
//! use std::time::Duration;
//! use service_fixture::{fixture, ServiceSpec};
//!
//! let spec = ServiceSpec::new("cache", "memcached")
//!     .args(["-p", "11311"])
//!     .ready_on_port("127.0.0.1", 11311)
//!     .min_uptime(Duration::from_millis(500));
//!
//! let mut cache = fixture::start(spec, Duration::from_secs(10))?;
//! // ... talk to 127.0.0.1:11311 ...
//! fixture::stop(&mut cache, Duration::from_secs(5));
//! # Ok::<(), service_fixture::FixtureError>(())
//! ```

pub mod control;
pub mod detector;
pub mod error;
pub mod event_loop;
pub mod fixture;
pub mod logger;
pub mod parse;
pub mod probe;
pub mod runtime;
pub mod sink;
pub mod supervisor;
pub mod testing;

pub use error::{ConfigError, CrashPhase, FixtureError, LaunchErrorKind, LoopError};
pub use event_loop::{EventLoopRunner, LoopFuture, LoopHandle};
pub use fixture::ServiceAdapter;
pub use parse::{load_spec, parse_spec, ReadinessConfig, ServiceSpec, StopSignal};
pub use probe::{ProbeStatus, ProbeTarget, ReadinessProbe};
pub use runtime::{ExitInfo, ServiceProcess};
pub use sink::{Detail, Details, OutputSink, Stream};
pub use supervisor::{FailureReason, Supervisor, SupervisorState};
