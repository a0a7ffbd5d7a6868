//! Readiness probes.
//!
//! A probe is checked repeatedly by the [`detector`](crate::detector) until it
//! reports [`ProbeStatus::Satisfied`] or [`ProbeStatus::Failed`]. Transient
//! conditions (connection refused, file not there yet) are `NotYet`.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use regex::Regex;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::error::ConfigError;
use crate::parse::ReadinessConfig;
use crate::sink::{OutputSink, Stream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Satisfied,
    NotYet,
    /// Will never be satisfied; stop waiting.
    Failed(String),
}

/// What a probe may look at.
pub struct ProbeTarget<'a> {
    pub output: &'a OutputSink,
}

#[async_trait]
pub trait ReadinessProbe: Send {
    /// Short human-readable description, used in logs.
    fn describe(&self) -> String;

    async fn check(&mut self, target: &ProbeTarget<'_>) -> ProbeStatus;
}

impl ReadinessConfig {
    pub fn build(&self) -> Result<Box<dyn ReadinessProbe>, ConfigError> {
        Ok(match self {
            ReadinessConfig::None => Box::new(Immediate),
            ReadinessConfig::Tcp { host, port } => Box::new(TcpProbe::new(host.clone(), *port)),
            ReadinessConfig::Output { pattern, stream } => {
                Box::new(OutputProbe::new(Regex::new(pattern)?, *stream))
            }
            ReadinessConfig::PidFile { path } => Box::new(PidFileProbe::new(path.clone())),
            ReadinessConfig::All { probes } => Box::new(AllOf::new(
                probes.iter().map(ReadinessConfig::build).collect::<Result<_, _>>()?,
            )),
        })
    }
}

/// Ready as soon as the process is up.
pub struct Immediate;

#[async_trait]
impl ReadinessProbe for Immediate {
    fn describe(&self) -> String {
        String::from("immediate")
    }

    async fn check(&mut self, _target: &ProbeTarget<'_>) -> ProbeStatus {
        ProbeStatus::Satisfied
    }
}

/// Ready once `host:port` accepts a TCP connection.
///
/// The host is resolved once; a name that does not resolve fails the probe
/// for good.
pub struct TcpProbe {
    host: String,
    port: u16,
    attempt_timeout: Duration,
    resolved: Option<Vec<SocketAddr>>,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            attempt_timeout: Duration::from_secs(1),
            resolved: None,
        }
    }

    async fn resolve(&mut self) -> Result<Option<Vec<SocketAddr>>, String> {
        if let Some(addrs) = &self.resolved {
            return Ok(Some(addrs.clone()));
        }
        let lookup = lookup_host((self.host.as_str(), self.port));
        match tokio::time::timeout(self.attempt_timeout, lookup).await {
            Ok(Ok(addrs)) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    return Err(format!("{} resolved to no addresses", self.host));
                }
                self.resolved = Some(addrs.clone());
                Ok(Some(addrs))
            }
            Ok(Err(e)) => Err(format!("cannot resolve {}: {e}", self.host)),
            // Slow resolver; retry next tick.
            Err(_) => Ok(None),
        }
    }

    /// Bound on a single connect attempt.
    pub fn attempt_timeout(mut self, d: Duration) -> Self {
        self.attempt_timeout = d;
        self
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    fn describe(&self) -> String {
        format!("tcp {}:{}", self.host, self.port)
    }

    async fn check(&mut self, _target: &ProbeTarget<'_>) -> ProbeStatus {
        let addrs = match self.resolve().await {
            Ok(Some(addrs)) => addrs,
            Ok(None) => return ProbeStatus::NotYet,
            Err(reason) => return ProbeStatus::Failed(reason),
        };

        let connect = TcpStream::connect(&addrs[..]);
        match tokio::time::timeout(self.attempt_timeout, connect).await {
            Ok(Ok(_stream)) => ProbeStatus::Satisfied,
            Ok(Err(e)) => {
                debug!(probe = %self.describe(), error = %e, "not accepting connections yet");
                ProbeStatus::NotYet
            }
            Err(_) => ProbeStatus::NotYet,
        }
    }
}

/// Ready once a captured output line matches a pattern.
pub struct OutputProbe {
    pattern: Regex,
    stream: Option<Stream>,
    cursor: usize,
}

impl OutputProbe {
    pub fn new(pattern: Regex, stream: Option<Stream>) -> Self {
        Self {
            pattern,
            stream,
            cursor: 0,
        }
    }
}

#[async_trait]
impl ReadinessProbe for OutputProbe {
    fn describe(&self) -> String {
        match self.stream {
            Some(stream) => format!("{stream} matching /{}/", self.pattern),
            None => format!("output matching /{}/", self.pattern),
        }
    }

    async fn check(&mut self, target: &ProbeTarget<'_>) -> ProbeStatus {
        let fresh = target.output.lines_since(self.cursor);
        self.cursor += fresh.len();

        let matched = fresh.iter().any(|line| {
            self.stream.map_or(true, |s| s == line.stream) && self.pattern.is_match(&line.text)
        });
        if matched {
            ProbeStatus::Satisfied
        } else {
            ProbeStatus::NotYet
        }
    }
}

/// Ready once a pid file exists and names a live process.
pub struct PidFileProbe {
    path: PathBuf,
}

impl PidFileProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReadinessProbe for PidFileProbe {
    fn describe(&self) -> String {
        format!("pid file {}", self.path.display())
    }

    async fn check(&mut self, _target: &ProbeTarget<'_>) -> ProbeStatus {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(probe = %self.describe(), error = %e, "pid file unreadable");
                }
                return ProbeStatus::NotYet;
            }
        };

        // Partially written files parse as garbage; try again next tick.
        let Some(pid) = contents
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<i32>().ok())
            .filter(|pid| *pid > 0)
        else {
            return ProbeStatus::NotYet;
        };

        match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => ProbeStatus::Satisfied,
            Err(_) => {
                debug!(probe = %self.describe(), pid, "pid file names a dead process");
                ProbeStatus::NotYet
            }
        }
    }
}

/// Ready once every inner probe has been satisfied at least once.
pub struct AllOf {
    probes: Vec<(Box<dyn ReadinessProbe>, bool)>,
}

impl AllOf {
    pub fn new(probes: Vec<Box<dyn ReadinessProbe>>) -> Self {
        Self {
            probes: probes.into_iter().map(|p| (p, false)).collect(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for AllOf {
    fn describe(&self) -> String {
        let parts: Vec<_> = self.probes.iter().map(|(p, _)| p.describe()).collect();
        format!("all of [{}]", parts.join(", "))
    }

    async fn check(&mut self, target: &ProbeTarget<'_>) -> ProbeStatus {
        for (probe, satisfied) in self.probes.iter_mut().filter(|(_, s)| !*s) {
            match probe.check(target).await {
                ProbeStatus::Satisfied => *satisfied = true,
                ProbeStatus::NotYet => {}
                failed @ ProbeStatus::Failed(_) => return failed,
            }
        }
        if self.probes.iter().all(|(_, s)| *s) {
            ProbeStatus::Satisfied
        } else {
            ProbeStatus::NotYet
        }
    }
}
