//! MPIR shim: makes a job started through a PMIx launcher visible to an MPIR debugger.
//!
//! [`Shim::run`] drives one run of the shim:
//! - initialize as a PMIx tool
//! - spawn a launcher (or attach to a running one)
//! - wait for the launcher to start the application paused
//! - publish the application process table through the MPIR symbols and hit `MPIR_Breakpoint`
//! - release the launcher and the application, wait for termination

pub mod condition;
pub mod context;
pub mod error;
pub mod events;
pub mod launcher;
pub mod lifecycle;
pub mod mode;
pub mod pmix;
pub mod proctable;
pub mod release;
pub mod session;
pub mod signal;

use crate::log::Scope;
use crate::mpir::Snapshot;
use crate::shim::condition::{Condition, Wake};
use crate::shim::context::Context;
use crate::shim::error::Error;
use crate::shim::events::{EventClass, Registry};
use crate::shim::launcher::Launcher;
use crate::shim::lifecycle::Lifecycle;
use crate::shim::mode::Mode;
use crate::shim::pmix::ProcessControl;
use crate::shim::proctable::Extractor;
use crate::shim::release::{teardown, Releaser};
use crate::shim::session::SessionPaths;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;

/// Default tool name, prefix of the tool namespace and of session paths.
pub const TOOL_NAME: &str = "mpir";

/// Resumes the application of a run.
pub trait ApplicationControl {
    /// Release the application processes paused in their startup call.
    fn release_application(&self) -> Result<(), Error>;
}

/// Observer of a shim run.
pub trait ShimHook: Send + Sync {
    /// Called right after `MPIR_Breakpoint` with the published MPIR state.
    fn on_breakpoint(&self, snapshot: &Snapshot, app: &dyn ApplicationControl);

    /// Called from the library thread when the last server connection is lost,
    /// after every waiter was released.
    fn on_connection_lost(&self);
}

/// Hook of the `mpirc` binary: a lost connection ends the process at once, without running
/// any teardown that could call into the library from inside its callback.
pub struct ExitHook;

impl ShimHook for ExitHook {
    fn on_breakpoint(&self, _: &Snapshot, _: &dyn ApplicationControl) {}

    fn on_connection_lost(&self) {
        unsafe { nix::libc::_exit(1) }
    }
}

/// Hook that observes nothing.
pub struct NoopHook;

impl ShimHook for NoopHook {
    fn on_breakpoint(&self, _: &Snapshot, _: &dyn ApplicationControl) {}
    fn on_connection_lost(&self) {}
}

#[derive(Clone, Debug)]
pub struct ShimConfig {
    pub mode: Mode,
    /// Launcher pid of an attach run, 0 otherwise.
    pub pid: i32,
    /// Launcher command line followed by the application command line.
    pub argv: Vec<String>,
    /// PMIx install prefix override.
    pub pmix_prefix: Option<PathBuf>,
    pub tool_name: String,
    /// Release the application after releasing the launcher. When disabled the application stays
    /// paused until a hook calls [`ApplicationControl::release_application`].
    pub release_application: bool,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Dynamic,
            pid: 0,
            argv: vec![],
            pmix_prefix: None,
            tool_name: TOOL_NAME.to_string(),
            release_application: true,
        }
    }
}

/// Coordinator of a shim run.
///
/// Dropping the shim tears the run down (see [`release::teardown`]).
pub struct Shim<P: ProcessControl> {
    config: ShimConfig,
    pmix: Arc<P>,
    ctx: Arc<Context>,
    lifecycle: Lifecycle<P>,
    registry: Registry<P>,
    session: Option<SessionPaths>,
}

impl<P: ProcessControl> Shim<P> {
    /// Create a shim for a run. The mode is resolved here, so an invalid configuration fails
    /// before any library call.
    pub fn new(config: ShimConfig, pmix: Arc<P>, hook: Arc<dyn ShimHook>) -> Result<Self, Error> {
        let mode = config.mode.resolve(config.pid, &config.argv)?;
        let ctx = Arc::new(Context::new(mode, hook));

        Ok(Self {
            lifecycle: Lifecycle::new(pmix.clone()),
            registry: Registry::new(pmix.clone(), ctx.clone()),
            config,
            pmix,
            ctx,
            session: None,
        })
    }

    pub fn mode(&self) -> Mode {
        self.ctx.mode()
    }

    /// Run context, shared with event handlers and the signal thread.
    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    pub fn session(&self) -> Option<&SessionPaths> {
        self.session.as_ref()
    }

    /// Execute the run, return the exit code of the launcher (of the application in attach
    /// mode), or 0 if none was reported.
    pub fn run(&mut self) -> Result<i32, Error> {
        let _scope = Scope::enter("shim run");
        info!(
            target: "shim",
            "tool '{}', performing a {}",
            self.config.tool_name,
            self.mode().describe()
        );

        match self.start() {
            Ok(()) | Err(Error::LauncherTerminated(_)) => {}
            Err(e) => return Err(e),
        }

        self.registry.deregister_all();
        self.lifecycle.finalize()?;

        let code = self.ctx.exit_code();
        debug!(target: "shim", "exiting with status {code}");
        Ok(code)
    }

    /// Steps of the run, up to the launcher (application) termination.
    fn start(&mut self) -> Result<(), Error> {
        let mode = self.mode();
        self.lifecycle.initialize(
            &self.ctx,
            &self.config.tool_name,
            self.config.pid,
            self.config.pmix_prefix.as_deref(),
        )?;

        if mode != Mode::Attach {
            let session = SessionPaths::current(&self.config.tool_name)?;
            session.create()?;
            self.ctx.set_session_dir(session.dir());
            self.session = Some(session);
        }

        self.registry.register(EventClass::Default)?;

        if mode == Mode::Attach {
            self.attach()?;
        } else {
            self.launch()?;
        }

        debug!(target: "shim", "waiting for launcher to terminate");
        self.wait(&self.ctx.conditions.terminate)
    }

    fn launch(&self) -> Result<(), Error> {
        let _scope = Scope::enter("launch");
        let mode = self.mode();
        let pmix = &*self.pmix;
        let launcher = Launcher::new(pmix, &self.ctx);
        let session = self.session.as_ref().filter(|_| mode == Mode::Proxy);

        launcher.spawn(&self.config.argv, session)?;
        if mode == Mode::Proxy {
            launcher.connect(session)?;
        }

        // completion handlers can only be registered once connected to the server
        self.registry.register(EventClass::LauncherReady)?;
        self.registry.register(EventClass::LaunchComplete)?;

        debug!(target: "shim", "waiting for launcher to become ready");
        self.wait(&self.ctx.conditions.ready)?;

        self.registry.register(EventClass::LauncherTerminated)?;
        launcher.send_directives()?;

        debug!(target: "shim", "waiting for launch to complete");
        self.wait(&self.ctx.conditions.complete)?;
        if !self.ctx.application().is_resolved() {
            return Err(Error::NoApplicationNamespace);
        }

        Extractor::new(pmix, &self.ctx).publish()?;

        // avoids a race between a proxy launcher shutting down and the terminate event
        if mode == Mode::Proxy {
            self.registry.register(EventClass::ApplicationTerminated)?;
        }

        let releaser = Releaser::new(pmix, &self.ctx);
        releaser.release_launcher()?;
        if self.config.release_application {
            releaser.release_application()?;
        }
        Ok(())
    }

    fn attach(&self) -> Result<(), Error> {
        let _scope = Scope::enter("attach");
        let extractor = Extractor::new(&*self.pmix, &self.ctx);

        let application = extractor.query_application_namespace()?;
        self.ctx.set_application(application);
        extractor.publish()?;

        self.registry.register(EventClass::ApplicationTerminated)?;
        Ok(())
    }

    fn wait(&self, condition: &Condition) -> Result<(), Error> {
        match condition.wait() {
            Wake::Posted => Ok(()),
            Wake::Released(trip) => Err(Error::from_trip(trip, condition.name())),
        }
    }

    /// Release the application processes on demand.
    pub fn release_application(&self) -> Result<(), Error> {
        Releaser::new(&*self.pmix, &self.ctx).release_application()
    }
}

impl<P: ProcessControl> Drop for Shim<P> {
    fn drop(&mut self) {
        teardown(&self.lifecycle, self.mode(), self.session.as_ref());
    }
}
