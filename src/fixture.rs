//! Caller-facing fixture API.
//!
//! Thin functions over [`Supervisor`] for test code, plus the trait concrete
//! service adapters implement to describe how their service is launched.

use std::time::Duration;

use crate::error::Result;
use crate::parse::ServiceSpec;
use crate::supervisor::Supervisor;

/// Per-service configuration supplied by a concrete adapter (a database, a
/// browser helper, ...): command line, readiness probe, minimum uptime.
pub trait ServiceAdapter {
    fn spec(&self) -> ServiceSpec;

    /// Start the adapter's service with its own startup timeout.
    fn start(&self) -> Result<Supervisor> {
        let spec = self.spec();
        let timeout = spec.startup_timeout;
        start(spec, timeout)
    }
}

/// Start `spec` and return its running supervisor.
///
/// On failure nothing is left running; the error's [`detail`] still renders
/// the captured output.
///
/// [`detail`]: crate::error::FixtureError::detail
pub fn start(spec: ServiceSpec, timeout: Duration) -> Result<Supervisor> {
    let mut supervisor = Supervisor::new(spec)?;
    supervisor.start_with_timeout(timeout)?;
    Ok(supervisor)
}

/// Never fails. Calling it again is a no-op.
pub fn stop(fixture: &mut Supervisor, timeout: Duration) {
    fixture.stop_with_timeout(timeout);
}

pub fn get_detail(fixture: &Supervisor, name: &str) -> Option<String> {
    fixture.detail(name)
}
