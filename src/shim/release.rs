use crate::mpir;
use crate::shim::context::Context;
use crate::shim::error::Error;
use crate::shim::lifecycle::Lifecycle;
use crate::shim::mode::Mode;
use crate::shim::pmix::{EventCode, Info, Key, ProcessControl, Proc, Rank, Value};
use crate::shim::session::SessionPaths;
use crate::shim::ApplicationControl;
use crate::weak_error;
use log::debug;

/// Attributes of a release notification for `target`.
pub fn release_attributes(target: &Proc) -> Vec<Info> {
    vec![
        Info::new(Key::EventCustomRange, Value::Proc(target.clone())),
        Info::flag(Key::EventNonDefault),
    ]
}

/// Resumes processes paused for the debugger.
pub struct Releaser<'a, P: ProcessControl> {
    pmix: &'a P,
    ctx: &'a Context,
}

impl<'a, P: ProcessControl> Releaser<'a, P> {
    pub fn new(pmix: &'a P, ctx: &'a Context) -> Self {
        Self { pmix, ctx }
    }

    /// Send a debugger release notification to `target`.
    pub fn release(&self, target: &Proc) -> Result<(), Error> {
        debug!(target: "shim", "release {target}");
        self.pmix
            .notify_event(EventCode::DebuggerRelease, &release_attributes(target))
            .map_err(|status| {
                eprintln!(
                    "An error occurred resuming launcher process: {}.",
                    self.pmix.error_string(status)
                );
                Error::library(self.pmix, "PMIx_Notify_event(debugger release)", status)
            })
    }

    /// Release the launcher (its rank 0).
    pub fn release_launcher(&self) -> Result<(), Error> {
        let launcher = self.ctx.launcher();
        self.release(&Proc::new(launcher.nspace, Rank::Index(0)))
    }
}

impl<P: ProcessControl> ApplicationControl for Releaser<'_, P> {
    fn release_application(&self) -> Result<(), Error> {
        let application = self.ctx.application();
        self.release(&Proc::wildcard(application.nspace))
    }
}

/// Release every resource of a run: finalize the tool, remove the session directory
/// (never created in attach mode) and free the published process table.
///
/// Safe to call more than once.
pub fn teardown<P: ProcessControl>(
    lifecycle: &Lifecycle<P>,
    mode: Mode,
    session: Option<&SessionPaths>,
) {
    debug!(target: "shim", "teardown");
    weak_error!(lifecycle.finalize(), "finalize:");

    if mode != Mode::Attach {
        if let Some(session) = session.filter(|s| s.dir().exists()) {
            weak_error!(session.remove(), "session directory removal:");
        }
    }

    mpir::release_table();
}
