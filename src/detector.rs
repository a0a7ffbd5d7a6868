use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;

use crate::probe::{ProbeStatus, ProbeTarget, ReadinessProbe};
use crate::runtime::{ExitInfo, ServiceProcess};

/// Stand-in for "no deadline" when a duration does not fit on the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `base + d`, saturating to a far-future instant instead of overflowing.
pub fn instant_after(base: Instant, d: Duration) -> Instant {
    base.checked_add(d).unwrap_or_else(|| base + FAR_FUTURE)
}

pub fn deadline_after(timeout: Duration) -> Instant {
    instant_after(Instant::now(), timeout)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    TimedOut,
    ProcessExitedEarly(ExitInfo),
    ProbeFailed(String),
}

/// Bounded polling of a readiness probe against a running process.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessDetector {
    poll_interval: Duration,
}

impl ReadinessDetector {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Check `probe` every poll interval until it is satisfied, fails for
    /// good, the process exits, or `deadline` passes.
    ///
    /// Process exit is watched between and during attempts, so a crash ends
    /// the wait immediately instead of running out the deadline.
    pub async fn watch(
        &self,
        probe: &mut dyn ReadinessProbe,
        process: &ServiceProcess,
        deadline: Instant,
    ) -> ReadyOutcome {
        let mut exit = process.exit_watch();
        let sink = process.sink().clone();
        let target = ProbeTarget { output: &sink };
        let description = probe.describe();
        let mut attempts: u32 = 0;

        loop {
            if let Some(info) = exit.get() {
                return ReadyOutcome::ProcessExitedEarly(info);
            }

            attempts += 1;
            let status = tokio::select! {
                biased;
                info = exit.wait() => return ReadyOutcome::ProcessExitedEarly(info),
                checked = timeout_at(deadline, probe.check(&target)) => match checked {
                    Ok(status) => status,
                    Err(_) => return ReadyOutcome::TimedOut,
                },
            };

            match status {
                ProbeStatus::Satisfied => {
                    debug!(service = %process.service(), probe = %description, attempts, "probe satisfied");
                    return ReadyOutcome::Ready;
                }
                ProbeStatus::Failed(reason) => return ReadyOutcome::ProbeFailed(reason),
                ProbeStatus::NotYet => {}
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(service = %process.service(), probe = %description, attempts, "deadline passed");
                return ReadyOutcome::TimedOut;
            }

            tokio::select! {
                biased;
                info = exit.wait() => return ReadyOutcome::ProcessExitedEarly(info),
                _ = sleep_until(instant_after(now, self.poll_interval).min(deadline)) => {}
            }
        }
    }
}
