use std::env;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FixtureError, LaunchErrorKind};
use crate::parse::ServiceSpec;
use crate::sink::{OutputSink, Stream};

/// PATH used when the service does not inherit the caller's environment and
/// sets none of its own.
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How a service process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Exit observed without a status, e.g. the reaper was torn down.
    pub const UNKNOWN: ExitInfo = ExitInfo { code: None, signal: None };

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(s) => write!(f, "killed by {}", s.as_str()),
                Err(_) => write!(f, "killed by signal {sig}"),
            },
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Receiving side of a process's exit notification.
#[derive(Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl ExitWatch {
    pub fn get(&self) -> Option<ExitInfo> {
        *self.rx.borrow()
    }

    /// Resolves once the process has exited.
    pub async fn wait(&mut self) -> ExitInfo {
        let seen = match self.rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            // Sender gone: the reaper was dropped with the loop.
            Err(_) => None,
        };
        seen.or_else(|| self.get()).unwrap_or(ExitInfo::UNKNOWN)
    }
}

/// One spawned service process.
///
/// The child itself is owned by a reaper task on the event loop; this handle
/// carries the pid, the exit notification and the output capture tasks.
/// Dropping a handle whose process is still alive SIGKILLs its process group.
pub struct ServiceProcess {
    service: String,
    pid: u32,
    launched_at: DateTime<Utc>,
    started: Instant,
    exit: ExitWatch,
    captures: Vec<JoinHandle<()>>,
    sink: OutputSink,
}

impl ServiceProcess {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// `None` until the process exits.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.get()
    }

    pub fn is_running(&self) -> bool {
        self.exit_info().is_none()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub async fn wait_exit(&mut self) -> ExitInfo {
        self.exit.wait().await
    }

    /// `None` if still running after `limit`.
    pub async fn wait_exit_timeout(&mut self, limit: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(limit, self.exit.wait()).await.ok()
    }

    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Signal the service's process group. A process that already exited is
    /// left alone so a recycled pid is never hit.
    pub fn signal_group(&self, signal: Signal) -> nix::Result<()> {
        if !self.is_running() {
            return Err(Errno::ESRCH);
        }
        killpg(self.pgid(), signal)
    }

    /// SIGKILL whatever is left of the process group after the leader exited.
    pub fn kill_stragglers(&self) {
        match killpg(self.pgid(), Signal::SIGKILL) {
            Ok(()) => debug!(service = %self.service, pid = self.pid, "killed leftover group members"),
            Err(Errno::ESRCH) => {}
            Err(e) => debug!(service = %self.service, pid = self.pid, error = %e, "could not signal process group"),
        }
    }

    /// Wait up to `limit` for the capture tasks to hit EOF. Lines are never
    /// dropped by this; a capture still running at the limit is abandoned.
    pub async fn drain_output(&mut self, limit: Duration) {
        let deadline = crate::detector::deadline_after(limit);
        for capture in self.captures.drain(..) {
            let abort = capture.abort_handle();
            if tokio::time::timeout_at(deadline, capture).await.is_err() {
                debug!(service = %self.service, pid = self.pid, "output still open after drain limit");
                abort.abort();
            }
        }
    }

    fn pgid(&self) -> Pid {
        // Spawned with process_group(0): the group id is the leader's pid.
        Pid::from_raw(self.pid as i32)
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(service = %self.service, pid = self.pid, "service process dropped while running; killing its group");
            if let Err(e) = killpg(self.pgid(), Signal::SIGKILL) {
                debug!(service = %self.service, pid = self.pid, error = %e, "SIGKILL on drop failed");
            }
        }
    }
}

impl fmt::Debug for ServiceProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProcess")
            .field("service", &self.service)
            .field("pid", &self.pid)
            .field("launched_at", &self.launched_at)
            .field("exit", &self.exit_info())
            .finish()
    }
}

fn launch_error(program: &str, kind: LaunchErrorKind, source: io::Error) -> FixtureError {
    FixtureError::Launch {
        program: program.to_string(),
        kind,
        source,
    }
}

fn check_executable(program: &str, path: &Path) -> Result<(), FixtureError> {
    let meta = match path.metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(launch_error(program, LaunchErrorKind::NotFound, e));
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(launch_error(program, LaunchErrorKind::PermissionDenied, e));
        }
        Err(e) => return Err(launch_error(program, LaunchErrorKind::Spawn, e)),
    };

    if meta.is_dir() || meta.permissions().mode() & 0o111 == 0 {
        return Err(launch_error(
            program,
            LaunchErrorKind::NotExecutable,
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not an executable file", path.display()),
            ),
        ));
    }

    access(path, AccessFlags::X_OK)
        .map_err(|errno| launch_error(program, LaunchErrorKind::PermissionDenied, io::Error::from(errno)))
}

fn search_path(spec: &ServiceSpec) -> OsString {
    if let Some(path) = spec.env.get("PATH") {
        return OsString::from(path);
    }
    if spec.inherit_env {
        if let Some(path) = env::var_os("PATH") {
            return path;
        }
    }
    OsString::from(FALLBACK_PATH)
}

/// Resolve the spec's command to an invocable path.
///
/// Commands containing a `/` are taken as paths (relative ones against the
/// working directory); bare names are looked up on the service's PATH.
pub fn resolve_executable(spec: &ServiceSpec) -> Result<PathBuf, FixtureError> {
    let program = spec.command.as_str();

    if program.contains('/') {
        let mut path = PathBuf::from(program);
        if path.is_relative() {
            if let Some(dir) = &spec.working_dir {
                path = dir.join(path);
            }
        }
        check_executable(program, &path)?;
        return Ok(path);
    }

    let mut first_refusal = None;
    for dir in env::split_paths(&search_path(spec)) {
        let candidate = dir.join(program);
        if !candidate.exists() {
            continue;
        }
        match check_executable(program, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) => {
                first_refusal.get_or_insert(e);
            }
        }
    }

    Err(first_refusal.unwrap_or_else(|| {
        launch_error(
            program,
            LaunchErrorKind::NotFound,
            io::Error::new(io::ErrorKind::NotFound, format!("`{program}` not found on PATH")),
        )
    }))
}

fn classify_spawn_error(e: &io::Error) -> LaunchErrorKind {
    match e.kind() {
        io::ErrorKind::NotFound => LaunchErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => LaunchErrorKind::PermissionDenied,
        _ if e.raw_os_error() == Some(Errno::ENOEXEC as i32) => LaunchErrorKind::NotExecutable,
        _ => LaunchErrorKind::Spawn,
    }
}

/// Spawn the service described by `spec`, streaming its stdout/stderr into
/// `sink`.
///
/// Must run on the event loop: the reaper and capture tasks are spawned onto
/// the current runtime.
pub fn spawn(spec: &ServiceSpec, sink: &OutputSink) -> Result<ServiceProcess, FixtureError> {
    if let Some(dir) = &spec.working_dir {
        if !dir.is_dir() {
            return Err(launch_error(
                &spec.command,
                LaunchErrorKind::BadWorkingDir,
                io::Error::new(io::ErrorKind::NotFound, format!("{} is not a directory", dir.display())),
            ));
        }
    }

    let program = resolve_executable(spec)?;

    let mut cmd = Command::new(&program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
    if !spec.inherit_env {
        cmd.env_clear();
    }
    cmd.envs(&spec.env);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| launch_error(&spec.command, classify_spawn_error(&e), e))?;
    let launched_at = Utc::now();
    let started = Instant::now();

    let Some(pid) = child.id() else {
        return Err(launch_error(
            &spec.command,
            LaunchErrorKind::Spawn,
            io::Error::new(io::ErrorKind::Other, "spawned process has no pid"),
        ));
    };

    let mut captures = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        captures.push(sink.capture(Stream::Stdout, stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        captures.push(sink.capture(Stream::Stderr, stderr));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(reap(spec.name.clone(), pid, child, exit_tx));

    info!(
        service = %spec.name,
        pid,
        command = %spec.command_line(),
        "spawned service process"
    );

    Ok(ServiceProcess {
        service: spec.name.clone(),
        pid,
        launched_at,
        started,
        exit: ExitWatch { rx: exit_rx },
        captures,
        sink: sink.clone(),
    })
}

/// Owns the child until it exits and publishes how it ended.
async fn reap(service: String, pid: u32, mut child: Child, exit_tx: watch::Sender<Option<ExitInfo>>) {
    let exit = match child.wait().await {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            warn!(service = %service, pid, error = %e, "failed to wait on service process");
            ExitInfo::UNKNOWN
        }
    };
    info!(service = %service, pid, exit = %exit, "service process exited");
    exit_tx.send_replace(Some(exit));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn spec(command: &str) -> ServiceSpec {
        ServiceSpec::new("svc", command)
    }

    #[test]
    fn resolves_bare_names_on_path() {
        let path = resolve_executable(&spec("sh")).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn missing_executable_is_not_found() {
        match resolve_executable(&spec("/nonexistent/bin/service")) {
            Err(FixtureError::Launch { kind, .. }) => assert_eq!(kind, LaunchErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
        match resolve_executable(&spec("no-such-service-binary-xyz")) {
            Err(FixtureError::Launch { kind, .. }) => assert_eq!(kind, LaunchErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_without_exec_bits_is_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("service.sh");
        fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();

        match resolve_executable(&spec(script.to_str().unwrap())) {
            Err(FixtureError::Launch { kind, .. }) => assert_eq!(kind, LaunchErrorKind::NotExecutable),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn directory_is_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        match resolve_executable(&spec(dir.path().to_str().unwrap())) {
            Err(FixtureError::Launch { kind, .. }) => assert_eq!(kind, LaunchErrorKind::NotExecutable),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let resolved = resolve_executable(&spec("./run.sh").working_dir(dir.path())).unwrap();
        assert_eq!(resolved, dir.path().join("./run.sh"));
    }

    #[test]
    fn exit_info_display() {
        assert_eq!(ExitInfo { code: Some(3), signal: None }.to_string(), "exit code 3");
        assert_eq!(ExitInfo { code: None, signal: Some(9) }.to_string(), "killed by SIGKILL");
        assert_eq!(ExitInfo::UNKNOWN.to_string(), "unknown status");
    }

    #[tokio::test]
    async fn exit_watch_outlives_the_reaper() {
        let (tx, rx) = watch::channel(None);
        let mut watch = ExitWatch { rx };
        tx.send_replace(Some(ExitInfo { code: Some(5), signal: None }));
        drop(tx);
        assert_eq!(watch.wait().await.code, Some(5));

        let (tx, rx) = watch::channel(None);
        let mut orphaned = ExitWatch { rx };
        drop(tx);
        assert_eq!(orphaned.wait().await, ExitInfo::UNKNOWN);
    }

    #[tokio::test]
    async fn spawn_captures_output_and_reports_exit() {
        let sink = OutputSink::new("svc");
        let spec = spec("/bin/sh").args(["-c", "echo out; echo err >&2; exit 4"]);
        let mut process = spawn(&spec, &sink).unwrap();

        let exit = process.wait_exit().await;
        process.drain_output(Duration::from_secs(2)).await;

        assert_eq!(exit.code, Some(4));
        assert_eq!(process.exit_info(), Some(exit));
        assert_eq!(sink.render(Some(Stream::Stdout)), "out\n");
        assert_eq!(sink.render(Some(Stream::Stderr)), "err\n");
    }

    #[tokio::test]
    async fn spawn_applies_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::new("svc");
        let spec = spec("sh")
            .args(["-c", "echo \"$GREETING\"; pwd"])
            .env("GREETING", "hi there")
            .working_dir(dir.path());
        let mut process = spawn(&spec, &sink).unwrap();
        process.wait_exit().await;
        process.drain_output(Duration::from_secs(2)).await;

        let lines: Vec<_> = sink.lines().into_iter().map(|l| l.text).collect();
        assert_eq!(lines[0], "hi there");
        let reported = fs::canonicalize(&lines[1]).unwrap();
        assert_eq!(reported, fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn missing_working_dir_is_reported() {
        let sink = OutputSink::new("svc");
        let spec = spec("sh").working_dir("/definitely/not/a/dir");
        match spawn(&spec, &sink) {
            Err(FixtureError::Launch { kind, .. }) => assert_eq!(kind, LaunchErrorKind::BadWorkingDir),
            other => panic!("unexpected {other:?}"),
        }
    }
}
