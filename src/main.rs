use anyhow::{bail, Context};
use clap::Parser;
use log::debug;
use mpir_shim::shim::error::Error;
use mpir_shim::shim::mode::Mode;
use mpir_shim::shim::ShimConfig;
use std::path::{Path, PathBuf};
use std::process;

/// Library file a PMIx install prefix must contain.
const PMIX_LIBRARY: &str = "lib/libpmix.so";

/// Run an MPI job through a PMIx launcher and make it visible to an MPIR debugger.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print debug messages
    #[clap(short, long)]
    debug: bool,

    /// Start the launcher as a proxy (launcher starts a temporary session for the job)
    #[clap(short = 'p', long, conflicts_with_all = ["force_non_proxy_run", "pid"])]
    force_proxy_run: bool,

    /// Start the launcher as a non-proxy (launcher joins a persistent session)
    #[clap(short = 'n', long, conflicts_with = "pid")]
    force_non_proxy_run: bool,

    /// Attach to a running launcher with this process id
    #[clap(short = 'c', long, visible_alias = "attach", allow_negative_numbers = true)]
    pid: Option<i32>,

    /// PMIx install path
    #[clap(long)]
    pmix_prefix: Option<PathBuf>,

    /// Launcher command line followed by the MPI application command line
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.pid.is_some() {
            Mode::Attach
        } else if self.force_proxy_run {
            Mode::Proxy
        } else if self.force_non_proxy_run {
            Mode::NonProxy
        } else {
            Mode::Dynamic
        }
    }

    fn into_config(self) -> anyhow::Result<ShimConfig> {
        let pmix_prefix = match self.pmix_prefix.as_deref() {
            Some(prefix) => Some(validate_prefix(prefix).context("--pmix-prefix")?),
            None => None,
        };

        Ok(ShimConfig {
            mode: self.mode(),
            pid: self.pid.unwrap_or_default(),
            argv: self.command,
            pmix_prefix,
            ..ShimConfig::default()
        })
    }
}

fn validate_prefix(prefix: &Path) -> anyhow::Result<PathBuf> {
    let reason = if !prefix.is_absolute() {
        "must be an absolute path"
    } else if !prefix.exists() {
        "does not exist"
    } else if !prefix.join(PMIX_LIBRARY).exists() {
        "does not contain lib/libpmix.so"
    } else {
        return Ok(prefix.to_path_buf());
    };
    bail!(Error::InvalidPrefix(prefix.to_path_buf(), reason))
}

/// Run configuration of the arguments, or the message to exit with status 1.
fn prepare(args: Args) -> Result<ShimConfig, String> {
    if args.pid.is_none() && args.command.is_empty() {
        return Err("No MPI application invocation specified, exiting.".to_string());
    }
    args.into_config().map_err(|e| format!("FATAL ERROR: {e:#}"))
}

fn main() {
    let args = Args::parse();
    mpir_shim::log::init(args.debug);

    let config = match prepare(args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            process::exit(1);
        }
    };

    process::exit(run(config));
}

#[cfg(feature = "pmix")]
fn run(config: ShimConfig) -> i32 {
    use mpir_shim::shim::pmix::native::NativePmix;
    use mpir_shim::shim::{signal, ExitHook, Shim};
    use std::sync::Arc;

    let mut shim = match Shim::new(config, Arc::new(NativePmix::new()), Arc::new(ExitHook)) {
        Ok(shim) => shim,
        Err(e) => return report(e),
    };
    if let Err(e) = signal::install(shim.context()) {
        return report(e);
    }

    match shim.run() {
        Ok(code) => code,
        Err(e) => report(e),
    }
}

#[cfg(not(feature = "pmix"))]
fn run(config: ShimConfig) -> i32 {
    debug!(target: "shim", "requested {}", config.mode.describe());
    eprintln!(
        "{} was built without PMIx support, rebuild it with the `pmix` feature",
        env!("CARGO_BIN_NAME")
    );
    1
}

/// Print a run error, return the process exit code.
#[cfg(feature = "pmix")]
fn report(e: Error) -> i32 {
    if e.is_fatal() {
        eprintln!("FATAL ERROR: {e}");
    } else {
        debug!(target: "shim", "run ended: {e}");
    }
    1
}
