//! Lifecycle supervisor.
//!
//! Synchronous `start`/`stop` over a private event loop. All work on the
//! service process (spawn, readiness polling, minimum-uptime check, teardown)
//! runs as units on the loop; the calling thread blocks on the unit's
//! [`LoopFuture`](crate::event_loop::LoopFuture) with a bounded wait and only
//! ever sees the published result.
//!
//! ```text
//! Idle ──start──▶ Starting ──ready + uptime──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                    │                            │
//!                    └──crash/timeout/launch──▶ Failed ──stop──▶ Stopped
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::control::{self, TerminationPolicy};
use crate::detector::{deadline_after, instant_after, ReadinessDetector, ReadyOutcome};
use crate::error::{CrashPhase, FixtureError, LaunchErrorKind, LoopError, Result};
use crate::event_loop::{EventLoopRunner, LoopHandle};
use crate::parse::ServiceSpec;
use crate::probe::ReadinessProbe;
use crate::runtime::{self, ExitInfo, ServiceProcess};
use crate::sink::{Detail, Details, OutputSink, Stream};

/// Slack on top of the start and stop budgets before the caller gives up on
/// the loop unit and cancels it.
const CALL_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Launch(LaunchErrorKind),
    Crashed,
    Timeout,
    Hung,
    ProbeFailed,
    EventLoop,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Launch(kind) => write!(f, "launch error ({kind})"),
            FailureReason::Crashed => f.write_str("crashed"),
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Hung => f.write_str("hung"),
            FailureReason::ProbeFailed => f.write_str("probe failed"),
            FailureReason::EventLoop => f.write_str("event loop error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(FailureReason),
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => f.write_str("idle"),
            SupervisorState::Starting => f.write_str("starting"),
            SupervisorState::Running => f.write_str("running"),
            SupervisorState::Stopping => f.write_str("stopping"),
            SupervisorState::Stopped => f.write_str("stopped"),
            SupervisorState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

impl FailureReason {
    fn of(err: &FixtureError) -> Self {
        match err {
            FixtureError::Launch { kind, .. } => FailureReason::Launch(*kind),
            FixtureError::Crashed { .. } => FailureReason::Crashed,
            FixtureError::Timeout { .. } => FailureReason::Timeout,
            FixtureError::Hung { .. } => FailureReason::Hung,
            FixtureError::ProbeFailed { .. } => FailureReason::ProbeFailed,
            FixtureError::InvalidState { .. }
            | FixtureError::EventLoop(_)
            | FixtureError::Config(_) => FailureReason::EventLoop,
        }
    }
}

pub fn output_detail_name(service: &str) -> String {
    format!("{service}-output")
}

pub fn stream_detail_name(service: &str, stream: Stream) -> String {
    format!("{service}-{stream}")
}

pub fn environment_detail_name(service: &str) -> String {
    format!("{service}-environment")
}

/// Which loop the supervisor schedules on.
enum LoopBinding {
    /// Started on demand, stopped on teardown.
    Private(EventLoopRunner),
    /// Owned by the caller; never stopped here.
    Injected(LoopHandle),
}

impl LoopBinding {
    fn acquire(&mut self) -> std::result::Result<LoopHandle, LoopError> {
        match self {
            LoopBinding::Private(runner) => {
                runner.start()?;
                runner.handle()
            }
            LoopBinding::Injected(handle) if handle.is_closed() => {
                Err(LoopError::Stopped(handle.name().to_string()))
            }
            LoopBinding::Injected(handle) => Ok(handle.clone()),
        }
    }

    /// The current loop, without starting one.
    fn current(&self) -> std::result::Result<LoopHandle, LoopError> {
        match self {
            LoopBinding::Private(runner) => runner.handle(),
            LoopBinding::Injected(handle) => Ok(handle.clone()),
        }
    }

    fn release(&mut self) {
        if let LoopBinding::Private(runner) = self {
            runner.stop();
        }
    }
}

/// A start attempt that failed, with the pid it got to, if any.
struct StartFailure {
    error: FixtureError,
    pid: Option<u32>,
}

enum Uptime {
    Held,
    Exited(ExitInfo),
    DeadlineFirst,
}

/// Wait out the rest of the minimum-uptime window, bounded by `deadline`.
async fn hold_for_min_uptime(spec: &ServiceSpec, process: &ServiceProcess, deadline: Instant) -> Uptime {
    let trusted_at = instant_after(process.started(), spec.min_uptime);
    let mut exit = process.exit_watch();

    if trusted_at > Instant::now() {
        if let Ok(info) = timeout_at(trusted_at.min(deadline), exit.wait()).await {
            return Uptime::Exited(info);
        }
        if trusted_at > deadline {
            return Uptime::DeadlineFirst;
        }
    }

    // Re-check once the window has elapsed.
    match exit.get() {
        Some(info) => Uptime::Exited(info),
        None => Uptime::Held,
    }
}

/// Spawn, wait for readiness and minimum uptime. On any failure the process
/// is torn down before returning.
async fn bring_up(
    spec: Arc<ServiceSpec>,
    mut probe: Box<dyn ReadinessProbe>,
    sink: OutputSink,
    output: Detail,
    timeout: Duration,
) -> std::result::Result<ServiceProcess, StartFailure> {
    let deadline = deadline_after(timeout);
    let mut process = runtime::spawn(&spec, &sink).map_err(|error| StartFailure { error, pid: None })?;
    let pid = process.pid();
    let service = spec.name.clone();

    let detector = ReadinessDetector::new(spec.poll_interval);
    let error = match detector.watch(probe.as_mut(), &process, deadline).await {
        ReadyOutcome::Ready => match hold_for_min_uptime(&spec, &process, deadline).await {
            Uptime::Held => {
                info!(service = %service, pid, uptime = ?process.uptime(), "service is ready");
                return Ok(process);
            }
            Uptime::Exited(exit) => FixtureError::Crashed {
                service,
                exit,
                phase: CrashPhase::WithinMinUptime,
                detail: output,
            },
            Uptime::DeadlineFirst => FixtureError::Timeout { service, timeout, detail: output },
        },
        ReadyOutcome::ProcessExitedEarly(exit) => FixtureError::Crashed {
            service,
            exit,
            phase: CrashPhase::BeforeReady,
            detail: output,
        },
        ReadyOutcome::TimedOut if sink.is_empty() => FixtureError::Hung { service, timeout, detail: output },
        ReadyOutcome::TimedOut => FixtureError::Timeout { service, timeout, detail: output },
        ReadyOutcome::ProbeFailed(reason) => FixtureError::ProbeFailed { service, reason, detail: output },
    };

    warn!(service = %spec.name, pid, error = %error, "start failed; tearing down");
    control::terminate(&mut process, &TerminationPolicy::abort(&spec)).await;
    Err(StartFailure { error, pid: Some(pid) })
}

/// Supervises one service through start, readiness and teardown.
///
/// Dropping a supervisor stops it.
pub struct Supervisor {
    spec: Arc<ServiceSpec>,
    state: SupervisorState,
    binding: LoopBinding,
    process: Option<ServiceProcess>,
    last_pid: Option<u32>,
    details: Details,
}

impl Supervisor {
    /// Supervisor with its own private event loop.
    pub fn new(spec: ServiceSpec) -> Result<Self> {
        spec.validate()?;
        let runner = EventLoopRunner::new(spec.name.clone());
        Ok(Self::build(spec, LoopBinding::Private(runner)))
    }

    /// Supervisor scheduling on a caller-owned loop.
    pub fn with_loop(spec: ServiceSpec, handle: LoopHandle) -> Result<Self> {
        spec.validate()?;
        Ok(Self::build(spec, LoopBinding::Injected(handle)))
    }

    fn build(spec: ServiceSpec, binding: LoopBinding) -> Self {
        Self {
            spec: Arc::new(spec),
            state: SupervisorState::Idle,
            binding,
            process: None,
            last_pid: None,
            details: Details::default(),
        }
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Pid of the currently owned process.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServiceProcess::pid)
    }

    /// Pid of the most recently spawned process, even after teardown.
    pub fn last_pid(&self) -> Option<u32> {
        self.last_pid
    }

    pub fn is_alive(&self) -> bool {
        self.process.as_ref().is_some_and(ServiceProcess::is_running)
    }

    pub fn details(&self) -> &Details {
        &self.details
    }

    pub fn detail(&self, name: &str) -> Option<String> {
        self.details.render(name)
    }

    /// Start with the spec's startup timeout.
    pub fn start(&mut self) -> Result<()> {
        self.start_with_timeout(self.spec.startup_timeout)
    }

    /// Spawn the service and block until it is ready and has stayed up for
    /// its minimum uptime, or until the start fails.
    ///
    /// Blocks for at most `timeout` plus a short teardown: a failed start gives
    /// the process [`ABORT_GRACE`](control::ABORT_GRACE) before SIGKILL and
    /// never leaves it running. Durations too large for the clock mean no
    /// deadline.
    pub fn start_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        if !matches!(self.state, SupervisorState::Idle | SupervisorState::Stopped) {
            return Err(FixtureError::InvalidState { op: "start", state: self.state });
        }

        let probe = self.spec.readiness.build()?;
        let handle = match self.binding.acquire() {
            Ok(handle) => handle,
            Err(e) => {
                self.state = SupervisorState::Failed(FailureReason::EventLoop);
                return Err(e.into());
            }
        };

        self.state = SupervisorState::Starting;
        let sink = OutputSink::new(&self.spec.name);
        self.attach_details(&sink);
        let output = sink.attach(output_detail_name(&self.spec.name), None);

        info!(service = %self.spec.name, timeout = ?timeout, "starting service");
        let budget = timeout
            .saturating_add(TerminationPolicy::abort(&self.spec).budget())
            .saturating_add(CALL_SLACK);
        let unit = bring_up(self.spec.clone(), probe, sink, output.clone(), timeout);

        match handle.call(unit, budget) {
            Ok(Ok(process)) => {
                self.last_pid = Some(process.pid());
                info!(service = %self.spec.name, pid = process.pid(), "service is running");
                self.process = Some(process);
                self.state = SupervisorState::Running;
                Ok(())
            }
            Ok(Err(StartFailure { error, pid })) => {
                self.last_pid = pid.or(self.last_pid);
                self.state = SupervisorState::Failed(FailureReason::of(&error));
                warn!(service = %self.spec.name, state = %self.state, "start failed");
                Err(error)
            }
            Err(LoopError::WaitTimedOut(_)) => {
                // Unit cancelled; dropping its process killed the group.
                error!(service = %self.spec.name, budget = ?budget, "start unit overran its budget");
                self.state = SupervisorState::Failed(FailureReason::Timeout);
                Err(FixtureError::Timeout {
                    service: self.spec.name.clone(),
                    timeout,
                    detail: output,
                })
            }
            Err(e) => {
                self.state = SupervisorState::Failed(FailureReason::EventLoop);
                Err(e.into())
            }
        }
    }

    /// Stop with the spec's shutdown timeout.
    pub fn stop(&mut self) {
        self.stop_with_timeout(self.spec.shutdown_timeout);
    }

    /// Tear everything down: stop signal, grace period, SIGKILL, then the
    /// private loop. Never fails; a no-op when idle or already stopped.
    ///
    /// `Starting` is never seen here: `start` holds `&mut self` for its whole
    /// bounded run, and a start that overruns its timeout aborts and tears
    /// down on its own.
    pub fn stop_with_timeout(&mut self, timeout: Duration) {
        if matches!(self.state, SupervisorState::Idle | SupervisorState::Stopped) {
            return;
        }
        self.state = SupervisorState::Stopping;

        if let Some(process) = self.process.take() {
            let policy = TerminationPolicy::within(&self.spec, timeout);
            let pid = process.pid();
            match self.binding.current() {
                Ok(handle) => {
                    let unit = async move {
                        let mut process = process;
                        control::terminate(&mut process, &policy).await
                    };
                    match handle.call(unit, policy.budget().saturating_add(CALL_SLACK)) {
                        Ok(Some(exit)) => info!(service = %self.spec.name, pid, exit = %exit, "service stopped"),
                        Ok(None) => error!(service = %self.spec.name, pid, "service did not die"),
                        Err(e) => warn!(service = %self.spec.name, pid, error = %e, "teardown unit did not complete"),
                    }
                }
                // Dropping the process SIGKILLs its group.
                Err(e) => warn!(service = %self.spec.name, pid, error = %e, "no event loop for teardown"),
            }
        }

        self.binding.release();
        self.state = SupervisorState::Stopped;
    }

    /// Notice a crash after start: `Running` becomes `Failed(Crashed)` once
    /// the process has exited.
    pub fn refresh(&mut self) -> SupervisorState {
        if self.state == SupervisorState::Running {
            if let Some(exit) = self.process.as_ref().and_then(ServiceProcess::exit_info) {
                warn!(service = %self.spec.name, exit = %exit, "service exited while running");
                self.state = SupervisorState::Failed(FailureReason::Crashed);
            }
        }
        self.state
    }

    fn attach_details(&mut self, sink: &OutputSink) {
        let name = &self.spec.name;
        self.details.clear();
        self.details.attach(sink.attach(output_detail_name(name), None));
        self.details.attach(sink.attach(stream_detail_name(name, Stream::Stdout), Some(Stream::Stdout)));
        self.details.attach(sink.attach(stream_detail_name(name, Stream::Stderr), Some(Stream::Stderr)));
        self.details.attach(Detail::text(environment_detail_name(name), environment_snapshot(&self.spec)));
    }
}

fn environment_snapshot(spec: &ServiceSpec) -> String {
    let mut out = format!(
        "command: {}\nworking_dir: {}\ninherit_env: {}\nprepared_at: {}\n",
        spec.command_line(),
        spec.working_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| String::from("(inherited)")),
        spec.inherit_env,
        chrono::Utc::now().to_rfc3339(),
    );
    for (key, value) in &spec.env {
        out.push_str(&format!("env {key}={value}\n"));
    }
    out
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("service", &self.spec.name)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn sh(name: &str, script: &str) -> ServiceSpec {
        ServiceSpec::new(name, "/bin/sh")
            .args(["-c", script])
            .grace_period(Duration::from_millis(500))
            .poll_interval(Duration::from_millis(50))
    }

    #[test]
    fn state_display() {
        assert_eq!(SupervisorState::Running.to_string(), "running");
        assert_eq!(
            SupervisorState::Failed(FailureReason::Launch(LaunchErrorKind::NotFound)).to_string(),
            "failed: launch error (executable not found)"
        );
    }

    #[test]
    #[traced_test]
    fn start_and_stop_roundtrip() {
        let mut sup = Supervisor::new(sh("echo", "echo up; exec sleep 30").ready_on_output("^up$")).unwrap();
        assert_eq!(sup.state(), SupervisorState::Idle);

        sup.start().unwrap();
        assert_eq!(sup.state(), SupervisorState::Running);
        assert!(sup.is_alive());
        assert!(logs_contain("service is running"));

        sup.stop();
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(sup.pid().is_none());
        assert!(sup.last_pid().is_some());
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut sup = Supervisor::new(sh("twice", "exec sleep 30")).unwrap();
        sup.start().unwrap();
        match sup.start() {
            Err(FixtureError::InvalidState { op, state }) => {
                assert_eq!(op, "start");
                assert_eq!(state, SupervisorState::Running);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn restart_after_stop() {
        let mut sup = Supervisor::new(sh("again", "exec sleep 30")).unwrap();
        sup.start().unwrap();
        let first = sup.pid();
        sup.stop();
        sup.start().unwrap();
        assert_eq!(sup.state(), SupervisorState::Running);
        assert_ne!(sup.pid(), first);
    }

    #[test]
    fn refresh_notices_a_later_crash() {
        let mut sup = Supervisor::new(sh("flaky", "echo up; sleep 0.3; exit 9").ready_on_output("up")).unwrap();
        sup.start().unwrap();
        assert_eq!(sup.refresh(), SupervisorState::Running);

        std::thread::sleep(Duration::from_millis(1000));
        assert_eq!(sup.refresh(), SupervisorState::Failed(FailureReason::Crashed));
        sup.stop();
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[test]
    fn details_are_attached_on_start() {
        let mut sup = Supervisor::new(sh("chatty", "echo hello; echo warn >&2; exec sleep 30")
            .ready_on_output("warn")
            .env("MODE", "test"))
        .unwrap();
        sup.start().unwrap();

        let names: Vec<_> = sup.details().names().map(String::from).collect();
        assert_eq!(
            names,
            vec!["chatty-environment", "chatty-output", "chatty-stderr", "chatty-stdout"]
        );
        assert!(sup.detail("chatty-stdout").unwrap().contains("hello"));
        let env = sup.detail("chatty-environment").unwrap();
        assert!(env.contains("env MODE=test"));
        assert!(env.contains("command: /bin/sh -c"));
    }

    #[test]
    fn injected_loop_survives_supervisor() {
        let runner = EventLoopRunner::started("shared").unwrap();
        {
            let mut sup = Supervisor::with_loop(sh("guest", "exec sleep 30"), runner.handle().unwrap()).unwrap();
            sup.start().unwrap();
            sup.stop();
        }
        assert!(runner.is_running());
        let still_serving = runner.run_in_loop(async { 1 + 1 }).unwrap();
        assert_eq!(still_serving.wait(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn stopped_injected_loop_fails_start() {
        let mut runner = EventLoopRunner::started("gone").unwrap();
        let mut sup = Supervisor::with_loop(sh("orphan", "exec sleep 30"), runner.handle().unwrap()).unwrap();
        runner.stop();

        let err = sup.start().unwrap_err();
        assert!(matches!(err, FixtureError::EventLoop(LoopError::Stopped(_))));
        assert_eq!(sup.state(), SupervisorState::Failed(FailureReason::EventLoop));
    }

    #[test]
    fn unrepresentable_timeouts_mean_no_deadline() {
        let mut sup = Supervisor::new(sh("forever", "echo up; exec sleep 30").ready_on_output("up")).unwrap();
        sup.start_with_timeout(Duration::MAX).unwrap();
        assert_eq!(sup.state(), SupervisorState::Running);
        sup.stop_with_timeout(Duration::MAX);
        assert_eq!(sup.state(), SupervisorState::Stopped);

        let spec = crate::parse::parse_spec(
            "name: patient\ncommand: /bin/sh\nargs: [\"-c\", \"exit 2\"]\n\
             readiness: {kind: output, pattern: never}\n\
             startup_timeout: 18446744073709551615s\n",
        )
        .unwrap();
        let mut crashing = Supervisor::new(spec).unwrap();
        assert!(crashing.start().unwrap_err().is_crash());
    }

    #[test]
    fn invalid_spec_is_rejected_up_front() {
        let err = Supervisor::new(ServiceSpec::new("bad", "")).unwrap_err();
        assert!(matches!(err, FixtureError::Config(_)));
    }
}
