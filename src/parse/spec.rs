use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use super::duration;
use crate::error::ConfigError;
use crate::sink::Stream;

/// How the supervisor decides that a freshly spawned service is usable.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessConfig {
    /// Ready as soon as it is spawned; only the minimum uptime applies.
    #[default]
    None,
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        port: u16,
    },
    /// A captured line matches `pattern`. `stream` absent means either stream.
    Output {
        pattern: String,
        #[serde(default)]
        stream: Option<Stream>,
    },
    /// A pid file exists and names a live process.
    PidFile { path: PathBuf },
    All { probes: Vec<ReadinessConfig> },
}

/// Signal sent first when stopping a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct StopSignal(pub Signal);

impl FromStr for StopSignal {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let sig = match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "TERM" => Signal::SIGTERM,
            "INT" => Signal::SIGINT,
            "QUIT" => Signal::SIGQUIT,
            "HUP" => Signal::SIGHUP,
            "USR1" => Signal::SIGUSR1,
            "USR2" => Signal::SIGUSR2,
            "KILL" => Signal::SIGKILL,
            _ => return Err(ConfigError::Signal(s.to_string())),
        };
        Ok(StopSignal(sig))
    }
}

impl TryFrom<String> for StopSignal {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal(Signal::SIGTERM)
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

fn default_host() -> String { String::from("127.0.0.1") }
fn default_true() -> bool { true }
fn default_startup_timeout() -> Duration { Duration::from_secs(10) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(5) }
fn default_grace_period() -> Duration { Duration::from_secs(1) }
fn default_poll_interval() -> Duration { Duration::from_millis(100) }

/// Everything needed to launch and supervise one service.
///
/// All values are passed explicitly; nothing is read from global state.
/// A supervisor keeps its own copy, so later edits to a spec never affect a
/// running fixture.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub min_uptime: Duration,
    #[serde(default = "default_startup_timeout", deserialize_with = "duration::deserialize")]
    pub startup_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", deserialize_with = "duration::deserialize")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_grace_period", deserialize_with = "duration::deserialize")]
    pub grace_period: Duration,
    #[serde(default = "default_poll_interval", deserialize_with = "duration::deserialize")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub stop_signal: StopSignal,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            inherit_env: true,
            working_dir: None,
            readiness: ReadinessConfig::None,
            min_uptime: Duration::ZERO,
            startup_timeout: default_startup_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            grace_period: default_grace_period(),
            poll_interval: default_poll_interval(),
            stop_signal: StopSignal::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Start from an empty environment instead of the caller's.
    pub fn clear_env(mut self) -> Self {
        self.inherit_env = false;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn ready_on_port(self, host: impl Into<String>, port: u16) -> Self {
        self.readiness(ReadinessConfig::Tcp { host: host.into(), port })
    }

    pub fn ready_on_output(self, pattern: impl Into<String>) -> Self {
        self.readiness(ReadinessConfig::Output { pattern: pattern.into(), stream: None })
    }

    pub fn ready_on_pid_file(self, path: impl Into<PathBuf>) -> Self {
        self.readiness(ReadinessConfig::PidFile { path: path.into() })
    }

    pub fn min_uptime(mut self, d: Duration) -> Self {
        self.min_uptime = d;
        self
    }

    pub fn startup_timeout(mut self, d: Duration) -> Self {
        self.startup_timeout = d;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn grace_period(mut self, d: Duration) -> Self {
        self.grace_period = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn stop_signal(mut self, signal: Signal) -> Self {
        self.stop_signal = StopSignal(signal);
        self
    }

    /// Full command line, for logs and the environment detail.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("service name is empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("`{}` has an empty command", self.name)));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be greater than zero".into()));
        }
        if !self.min_uptime.is_zero() && self.min_uptime >= self.startup_timeout {
            return Err(ConfigError::Invalid(format!(
                "min_uptime ({:?}) must be shorter than startup_timeout ({:?})",
                self.min_uptime, self.startup_timeout
            )));
        }
        // Surfaces bad regexes at construction rather than at start.
        self.readiness.build()?;
        Ok(())
    }
}

/// Parse a service spec from YAML text and validate it.
pub fn parse_spec(yaml: &str) -> Result<ServiceSpec, ConfigError> {
    let spec: ServiceSpec = serde_yaml::from_str(yaml)?;
    spec.validate()?;
    Ok(spec)
}

pub fn load_spec(path: impl AsRef<Path>) -> Result<ServiceSpec, ConfigError> {
    let path = path.as_ref();
    let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_spec(&yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_with_defaults() {
        let spec = parse_spec(
            r#"
name: cache
command: /usr/bin/memcached
args: ["-p", "11311"]
readiness:
  kind: tcp
  port: 11311
"#,
        )
        .unwrap();

        assert_eq!(spec.name, "cache");
        assert_eq!(spec.args, vec!["-p", "11311"]);
        assert_eq!(
            spec.readiness,
            ReadinessConfig::Tcp { host: "127.0.0.1".into(), port: 11311 }
        );
        assert!(spec.inherit_env);
        assert_eq!(spec.startup_timeout, Duration::from_secs(10));
        assert_eq!(spec.poll_interval, Duration::from_millis(100));
        assert_eq!(spec.stop_signal, StopSignal(Signal::SIGTERM));
    }

    #[test]
    fn yaml_full() {
        let spec = parse_spec(
            r#"
name: db
command: postgres
env:
  PGDATA: /tmp/pg
inherit_env: false
working_dir: /tmp
readiness:
  kind: all
  probes:
    - kind: output
      pattern: "ready to accept connections"
      stream: stderr
    - kind: pid_file
      path: /tmp/pg/postmaster.pid
min_uptime: 500ms
startup_timeout: 30s
shutdown_timeout: 10s
grace_period: 2s
poll_interval: 50ms
stop_signal: SIGINT
"#,
        )
        .unwrap();

        assert_eq!(spec.env.get("PGDATA").map(String::as_str), Some("/tmp/pg"));
        assert!(!spec.inherit_env);
        assert_eq!(spec.min_uptime, Duration::from_millis(500));
        assert_eq!(spec.grace_period, Duration::from_secs(2));
        assert_eq!(spec.stop_signal.0, Signal::SIGINT);
        match &spec.readiness {
            ReadinessConfig::All { probes } => {
                assert_eq!(probes.len(), 2);
                assert_eq!(
                    probes[0],
                    ReadinessConfig::Output {
                        pattern: "ready to accept connections".into(),
                        stream: Some(Stream::Stderr),
                    }
                );
            }
            other => panic!("unexpected readiness {other:?}"),
        }
    }

    #[test]
    fn unknown_signal_is_rejected() {
        let err = parse_spec("name: a\ncommand: b\nstop_signal: BOGUS\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)), "{err}");
    }

    #[test]
    fn min_uptime_must_fit_in_startup_timeout() {
        let spec = ServiceSpec::new("svc", "true")
            .min_uptime(Duration::from_secs(3))
            .startup_timeout(Duration::from_secs(2));
        assert!(matches!(spec.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_pattern_fails_validation() {
        let spec = ServiceSpec::new("svc", "true").ready_on_output("(unclosed");
        assert!(matches!(spec.validate(), Err(ConfigError::Pattern(_))));
    }

    #[test]
    fn builder_and_command_line() {
        let spec = ServiceSpec::new("svc", "/bin/sh").args(["-c", "exit 0"]).env("A", "1");
        assert_eq!(spec.command_line(), "/bin/sh -c exit 0");
        assert_eq!(spec.env["A"], "1");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn load_spec_reports_missing_file() {
        let err = load_spec("/definitely/not/here.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
