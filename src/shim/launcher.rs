use crate::shim::context::Context;
use crate::shim::error::Error;
use crate::shim::lifecycle::resolve_launcher;
use crate::shim::mode::Mode;
use crate::shim::pmix::{
    App, DataArray, Envar, EventCode, Info, Key, ProcessControl, Proc, Rank, Value,
};
use crate::shim::session::SessionPaths;
use itertools::Itertools;
use log::{debug, warn};
use std::ffi::OsString;

/// Connection attempts of a proxy run.
pub const CONNECT_MAX_RETRIES: i32 = 10;
/// Seconds between connection attempts.
pub const CONNECT_RETRY_DELAY: i32 = 1;

/// Tells the launcher which tool it waits for before launching.
pub const PAUSE_FOR_TOOL_ENV: &str = "PMIX_LAUNCHER_PAUSE_FOR_TOOL";
const SERVER_TMPDIR_ENV: &str = "PMIX_SERVER_TMPDIR";
const RENDEZVOUS_FILE_ENV: &str = "PMIX_LAUNCHER_RENDEZVOUS_FILE";

/// Value of the pause-for-tool directive.
pub fn pause_for_tool(tool: &Proc) -> String {
    format!("{}:{}", tool.nspace, tool.rank)
}

/// Command descriptor of the launcher.
///
/// # Arguments
///
/// * `argv`: launcher command line, `argv[0]` is the executable
/// * `cwd`: working directory, empty if unknown
/// * `session`: session paths, given in proxy mode only
/// * `tool`: tool identity the launcher pauses for
/// * `environ`: environment copied in proxy mode
pub fn launcher_app(
    argv: &[String],
    cwd: String,
    session: Option<&SessionPaths>,
    tool: &Proc,
    environ: impl IntoIterator<Item = (OsString, OsString)>,
) -> Result<App, Error> {
    let cmd = argv.first().ok_or(Error::NoInvocation)?.clone();

    let mut env = vec![];
    if let Some(session) = session {
        let overridden = [SERVER_TMPDIR_ENV, RENDEZVOUS_FILE_ENV, PAUSE_FOR_TOOL_ENV];
        env.extend(environ.into_iter().filter_map(|(name, value)| {
            // the shim's own values replace inherited ones
            if overridden.iter().any(|var| name == *var) {
                debug!(target: "shim", "override inherited {name:?}");
                return None;
            }
            let mut entry = name;
            entry.push("=");
            entry.push(value);
            match entry.into_string() {
                Ok(entry) => Some(entry),
                Err(entry) => {
                    warn!(target: "shim", "skip non UTF-8 environment entry {entry:?}");
                    None
                }
            }
        }));
        env.push(format!(
            "{SERVER_TMPDIR_ENV}={}",
            session.dir().to_string_lossy()
        ));
        env.push(format!(
            "{RENDEZVOUS_FILE_ENV}={}",
            session.rendezvous_file().to_string_lossy()
        ));
        env.push(format!("{PAUSE_FOR_TOOL_ENV}={}", pause_for_tool(tool)));
    }

    Ok(App {
        cmd,
        argv: argv.to_vec(),
        env,
        cwd,
        maxprocs: 1,
    })
}

/// Job level attributes of the launcher spawn request.
pub fn job_attributes(mode: Mode, tool: &Proc) -> Vec<Info> {
    let mut attrs = vec![
        Info::string(Key::MapBy, "slot"),
        Info::flag(Key::ForwardStdout),
        Info::flag(Key::ForwardStderr),
        Info::flag(Key::NotifyCompletion),
        Info::flag(Key::SpawnTool),
    ];
    // a proxy launcher gets the directive through its environment
    if mode == Mode::NonProxy {
        attrs.push(Info::new(
            Key::SetEnvar,
            Value::Envar(Envar {
                name: PAUSE_FOR_TOOL_ENV.to_string(),
                value: pause_for_tool(tool),
                separator: ':',
            }),
        ));
    }
    attrs
}

/// Attributes of the server connection request.
pub fn connect_attributes(mode: Mode, session: Option<&SessionPaths>) -> Vec<Info> {
    let mut attrs = vec![
        Info::new(Key::ConnectMaxRetries, Value::Int(CONNECT_MAX_RETRIES)),
        Info::new(Key::ConnectRetryDelay, Value::Int(CONNECT_RETRY_DELAY)),
    ];
    match (mode, session) {
        (Mode::Proxy, Some(session)) => attrs.push(Info::string(
            Key::ToolAttachmentFile,
            session.rendezvous_file().to_string_lossy(),
        )),
        // the server publishes its URI, no rendezvous file
        _ => attrs.push(Info::flag(Key::ConnectSystemFirst)),
    }
    attrs
}

/// Launch directives scoped to the launcher.
///
/// Processes are stopped in their startup call unless the run attaches to an already running
/// job.
pub fn launch_directives(mode: Mode, launcher: &Proc) -> Vec<Info> {
    let job_directives = match mode {
        Mode::Attach => vec![Info::flag(Key::NotifyLaunch)],
        _ => vec![
            Info::flag(Key::DebugStopInInit),
            Info::flag(Key::NotifyLaunch),
        ],
    };
    vec![
        Info::new(Key::EventCustomRange, Value::Proc(launcher.clone())),
        Info::flag(Key::EventNonDefault),
        Info::new(
            Key::DebugJobDirectives,
            Value::DataArray(DataArray::Info(job_directives)),
        ),
    ]
}

/// Starts, or connects to, the launcher of a run.
pub struct Launcher<'a, P: ProcessControl> {
    pmix: &'a P,
    ctx: &'a Context,
}

impl<'a, P: ProcessControl> Launcher<'a, P> {
    pub fn new(pmix: &'a P, ctx: &'a Context) -> Self {
        Self { pmix, ctx }
    }

    /// Spawn the launcher with the application command line.
    ///
    /// In non-proxy mode the launcher identity is the spawned namespace at rank 0, in proxy mode
    /// it is resolved by [`Launcher::connect`].
    pub fn spawn(&self, argv: &[String], session: Option<&SessionPaths>) -> Result<String, Error> {
        let mode = self.ctx.mode();
        let tool = self.ctx.tool();
        let cwd = std::env::current_dir()
            .map(|cwd| cwd.to_string_lossy().into_owned())
            .unwrap_or_default();

        let app = launcher_app(argv, cwd, session, &tool, std::env::vars_os())?;
        let attrs = job_attributes(mode, &tool);

        debug!(target: "shim", "spawn {}", app.argv.iter().join(" "));
        let nspace = self
            .pmix
            .spawn(&attrs, &[app])
            .map_err(|status| Error::library(self.pmix, "PMIx_Spawn", status))?;
        debug!(target: "shim", "launcher namespace is '{nspace}'");

        if mode == Mode::NonProxy {
            self.ctx.set_launcher(Proc::new(nspace.clone(), Rank::Index(0)));
        }
        Ok(nspace)
    }

    /// Connect to the server started by a proxy launcher and resolve the launcher identity.
    pub fn connect(&self, session: Option<&SessionPaths>) -> Result<(), Error> {
        let tool = self.ctx.tool();
        let attrs = connect_attributes(self.ctx.mode(), session);

        self.pmix
            .connect_to_server(&tool, &attrs)
            .map_err(|status| Error::library(self.pmix, "PMIx_tool_connect_to_server", status))?;

        let launcher = resolve_launcher(self.pmix, &tool)?;
        self.ctx.set_launcher(launcher);
        self.ctx.add_session();
        Ok(())
    }

    /// Send the launch directives to the launcher.
    pub fn send_directives(&self) -> Result<(), Error> {
        let launcher = self.ctx.launcher();
        debug!(target: "shim", "send launch directives to {launcher}");

        let attrs = launch_directives(self.ctx.mode(), &launcher);
        self.pmix
            .notify_event(EventCode::LaunchDirective, &attrs)
            .map_err(|status| Error::library(self.pmix, "PMIx_Notify_event(launch directive)", status))
    }
}
