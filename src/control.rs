use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tracing::{error, info, warn};

use crate::parse::ServiceSpec;
use crate::runtime::{ExitInfo, ServiceProcess};

/// Upper bound on waiting for output pipes to close once the process is gone.
pub const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Minimum wait for the process to be reaped after SIGKILL.
pub const KILL_WAIT_FLOOR: Duration = Duration::from_secs(1);

/// Longest grace period a process gets when its start has failed.
pub const ABORT_GRACE: Duration = Duration::from_millis(250);

/// How to bring a service down: `signal`, wait `grace`, then SIGKILL and wait
/// at most `kill_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub signal: Signal,
    pub grace: Duration,
    pub kill_wait: Duration,
}

impl TerminationPolicy {
    /// Fit the spec's stop signal and grace period into a `total` budget.
    pub fn within(spec: &ServiceSpec, total: Duration) -> Self {
        let grace = spec.grace_period.min(total);
        Self {
            signal: spec.stop_signal.0,
            grace,
            kill_wait: total.saturating_sub(grace).max(KILL_WAIT_FLOOR),
        }
    }

    /// Teardown after a failed start. The process was never trusted, so it
    /// gets at most [`ABORT_GRACE`] before SIGKILL; this keeps `start` close
    /// to its timeout even when the service ignores the stop signal.
    pub fn abort(spec: &ServiceSpec) -> Self {
        let grace = spec.grace_period.min(ABORT_GRACE);
        Self::within(spec, grace.saturating_add(KILL_WAIT_FLOOR))
    }

    /// Longest time [`terminate`] can take under this policy.
    pub fn budget(&self) -> Duration {
        self.grace.saturating_add(self.kill_wait).saturating_add(OUTPUT_DRAIN)
    }
}

fn send(process: &ServiceProcess, signal: Signal) {
    match process.signal_group(signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => error!(service = %process.service(), pid = process.pid(), error = %e, "failed to send {}", signal.as_str()),
    }
}

async fn finish(process: &mut ServiceProcess, exit: ExitInfo) -> Option<ExitInfo> {
    process.kill_stragglers();
    process.drain_output(OUTPUT_DRAIN).await;
    Some(exit)
}

/// Stop `process`: stop signal to its group, wait out the grace period,
/// escalate to SIGKILL. Never fails; returns `None` only if the process was
/// still not reaped after SIGKILL.
///
/// Also SIGKILLs any remaining group members and drains captured output, so
/// it doubles as cleanup for a process that already exited.
pub async fn terminate(process: &mut ServiceProcess, policy: &TerminationPolicy) -> Option<ExitInfo> {
    let service = process.service().to_string();
    let pid = process.pid();

    if let Some(exit) = process.exit_info() {
        return finish(process, exit).await;
    }

    // 1) Graceful stop
    if policy.signal != Signal::SIGKILL {
        info!(service = %service, pid, signal = policy.signal.as_str(), "sending stop signal");
        send(process, policy.signal);

        // 2) Wait up to the grace period
        if let Some(exit) = process.wait_exit_timeout(policy.grace).await {
            info!(service = %service, pid, exit = %exit, "exited after stop signal");
            return finish(process, exit).await;
        }
        warn!(service = %service, pid, grace = ?policy.grace, "still running after grace period");
    }

    // 3) Force-kill
    send(process, Signal::SIGKILL);
    match process.wait_exit_timeout(policy.kill_wait).await {
        Some(exit) => {
            warn!(service = %service, pid, exit = %exit, "killed with SIGKILL");
            finish(process, exit).await
        }
        None => {
            error!(service = %service, pid, waited = ?policy.kill_wait, "process not reaped after SIGKILL");
            None
        }
    }
}
