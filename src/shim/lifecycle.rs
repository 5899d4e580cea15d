use crate::shim::condition::lock;
use crate::shim::context::Context;
use crate::shim::error::Error;
use crate::shim::mode::Mode;
use crate::shim::pmix::{Info, Key, ProcessControl, Proc, Rank, Value};
use log::{debug, warn};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Rank of the tool inside its own namespace.
pub const TOOL_RANK: u32 = 0;

/// Namespace the tool asks for when it runs a proxy launcher.
pub fn tool_namespace(tool_name: &str, pid: u32) -> String {
    format!("{tool_name}.{pid}")
}

/// Attributes of the tool initialization call.
///
/// # Arguments
///
/// * `mode`: resolved mode of the run
/// * `tool_nspace`: namespace requested in proxy mode
/// * `pid`: launcher process id in attach mode
/// * `prefix`: library install path override
pub fn init_attributes(mode: Mode, tool_nspace: &str, pid: i32, prefix: Option<&Path>) -> Vec<Info> {
    let mut attrs = match mode {
        Mode::Proxy => vec![
            Info::flag(Key::ToolDoNotConnect),
            Info::string(Key::ToolNspace, tool_nspace),
            Info::new(Key::ToolRank, Value::Rank(Rank::Index(TOOL_RANK))),
            Info::flag(Key::Launcher),
        ],
        Mode::Attach => vec![Info::new(Key::ServerPidinfo, Value::Pid(pid))],
        Mode::NonProxy | Mode::Dynamic => vec![],
    };
    if let Some(prefix) = prefix {
        attrs.push(Info::string(Key::Prefix, prefix.to_string_lossy()));
    }
    attrs
}

/// Resolve the identity of the server (launcher) the tool is connected to.
pub fn resolve_launcher<P: ProcessControl + ?Sized>(pmix: &P, tool: &Proc) -> Result<Proc, Error> {
    let nspace = match pmix.get(tool, &Key::ServerNspace) {
        Ok(Value::Str(nspace)) => nspace,
        Ok(other) => {
            warn!(target: "shim", "server namespace has unexpected type {}", other.type_name());
            return Err(Error::LauncherUnresolved);
        }
        Err(status) => return Err(Error::library(pmix, "PMIx_Get(server namespace)", status)),
    };
    let rank = match pmix.get(tool, &Key::ServerRank) {
        Ok(Value::Rank(rank)) => rank,
        Ok(Value::Uint32(raw)) => Rank::from_raw(raw),
        Ok(other) => {
            warn!(target: "shim", "server rank has unexpected type {}", other.type_name());
            return Err(Error::LauncherUnresolved);
        }
        Err(status) => return Err(Error::library(pmix, "PMIx_Get(server rank)", status)),
    };

    let launcher = Proc::new(nspace, rank);
    debug!(target: "shim", "connected to launcher {launcher}");
    Ok(launcher)
}

/// Tool initialization and finalization against the library.
///
/// Every successful initialization is counted, [`Lifecycle::finalize`] tears the tool down only
/// while the count is positive, so it can be called from every exit path.
pub struct Lifecycle<P: ProcessControl> {
    pmix: Arc<P>,
    initialized: Mutex<u32>,
}

impl<P: ProcessControl> Lifecycle<P> {
    pub fn new(pmix: Arc<P>) -> Self {
        Self {
            pmix,
            initialized: Mutex::new(0),
        }
    }

    /// Initialize as a tool.
    ///
    /// # Arguments
    ///
    /// * `ctx`: run context, receives the tool (and in attach mode the launcher) identity
    /// * `tool_name`: tool name, prefix of the proxy mode namespace
    /// * `pid`: launcher process id in attach mode
    /// * `prefix`: library install path override
    pub fn initialize(
        &self,
        ctx: &Context,
        tool_name: &str,
        pid: i32,
        prefix: Option<&Path>,
    ) -> Result<Proc, Error> {
        let nspace = tool_namespace(tool_name, std::process::id());
        let attrs = init_attributes(ctx.mode(), &nspace, pid, prefix);

        let tool = self
            .pmix
            .tool_init(&attrs)
            .map_err(|status| Error::library(&*self.pmix, "PMIx_tool_init", status))?;
        *lock(&self.initialized) += 1;
        debug!(target: "shim", "initialized as tool {tool}");
        ctx.set_tool(tool.clone());

        match ctx.mode() {
            Mode::Attach => {
                ctx.add_session();
                ctx.set_launcher(resolve_launcher(&*self.pmix, &tool)?);
            }
            Mode::NonProxy => ctx.add_session(),
            Mode::Proxy | Mode::Dynamic => {}
        }

        Ok(tool)
    }

    /// Finalize the tool if it is initialized.
    pub fn finalize(&self) -> Result<(), Error> {
        let mut initialized = lock(&self.initialized);
        if *initialized == 0 {
            return Ok(());
        }

        debug!(target: "shim", "finalize tool ({})", *initialized);
        *initialized -= 1;
        self.pmix
            .tool_finalize()
            .map_err(|status| Error::library(&*self.pmix, "PMIx_tool_finalize", status))
    }

    pub fn is_initialized(&self) -> bool {
        *lock(&self.initialized) > 0
    }
}
