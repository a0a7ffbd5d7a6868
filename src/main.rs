use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::info;

use service_fixture::{load_spec, logger, Supervisor};

const USAGE: &str = "usage: service-fixture <config.yml> [--log-dir DIR]";

struct Args {
    config: PathBuf,
    log_dir: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut log_dir = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-dir" => {
                let dir = args.next().context("--log-dir needs a directory")?;
                log_dir = Some(PathBuf::from(dir));
            }
            "-h" | "--help" => bail!(USAGE),
            _ if config.is_none() => config = Some(PathBuf::from(arg)),
            other => bail!("unexpected argument `{other}`\n{USAGE}"),
        }
    }

    Ok(Args {
        config: config.context(USAGE)?,
        log_dir,
    })
}

/// Block until SIGINT or SIGTERM arrives; returns the signal number.
fn wait_for_signal() -> Result<i32> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;

    rt.block_on(async {
        let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
        let handle = signals.handle();
        let signal = signals.next().await.context("signal stream closed")?;
        handle.close();
        Ok::<_, anyhow::Error>(signal)
    })
}

fn run() -> Result<ExitCode> {
    let args = parse_args()?;

    let _guard = match &args.log_dir {
        Some(dir) => Some(logger::init_file_logging(dir)?),
        None => {
            logger::init_stderr_logging()?;
            None
        }
    };

    let spec = load_spec(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut supervisor = Supervisor::new(spec)?;

    if let Err(err) = supervisor.start() {
        eprintln!("{err}");
        if let Some(detail) = err.detail() {
            eprintln!("--- {} ---\n{}", detail.name(), detail.render());
        }
        return Ok(ExitCode::FAILURE);
    }

    if let Some(pid) = supervisor.pid() {
        println!("{} running with pid {pid}", supervisor.name());
    }

    let signal = wait_for_signal()?;
    info!(service = %supervisor.name(), signal, "stopping on signal");
    supervisor.stop();
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
