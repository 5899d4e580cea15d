use crate::shim::error::Error;
use std::path::Path;
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Launcher name that joins a persistent session.
const NON_PROXY_LAUNCHER: &str = "prun";

/// How the shim reaches the launcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Mode {
    /// Chosen from the launcher program name.
    #[default]
    Dynamic,
    /// Launcher starts a temporary session for the job.
    Proxy,
    /// Launcher joins a persistent session.
    NonProxy,
    /// Connect to an already running launcher by process id.
    Attach,
}

impl Mode {
    /// Resolve the mode of a run.
    ///
    /// # Arguments
    ///
    /// * `pid`: launcher process id, non-zero value requests attach mode
    /// * `argv`: launcher command line, used by dynamic mode
    pub fn resolve(self, pid: i32, argv: &[String]) -> Result<Mode, Error> {
        let mode = if pid != 0 { Mode::Attach } else { self };

        match mode {
            Mode::Attach if pid <= 0 => Err(Error::InvalidPid(pid)),
            Mode::Attach => Ok(Mode::Attach),
            Mode::Dynamic => {
                let launcher = argv.first().ok_or(Error::NoInvocation)?;
                let base = Path::new(launcher)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(launcher);
                if base == NON_PROXY_LAUNCHER {
                    Ok(Mode::NonProxy)
                } else {
                    Ok(Mode::Proxy)
                }
            }
            Mode::Proxy | Mode::NonProxy if argv.is_empty() => Err(Error::NoInvocation),
            mode => Ok(mode),
        }
    }

    /// Human-readable run kind.
    pub fn describe(self) -> &'static str {
        match self {
            Mode::Dynamic => "dynamic run",
            Mode::Proxy => "proxy run",
            Mode::NonProxy => "non-proxy run",
            Mode::Attach => "attach run",
        }
    }
}
