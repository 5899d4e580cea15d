//! Termination signals of a run.
//!
//! The first SIGHUP, SIGINT or SIGTERM trips the latch of the run context: every blocked wait
//! returns and the coordinator unwinds through its teardown. A second signal exits at once, for
//! the case when the coordinator is stuck inside a library call. That exit removes the session
//! directory but does not finalize the tool.

use crate::shim::condition::Trip;
use crate::shim::context::Context;
use crate::shim::error::Error;
use crate::weak_error;
use log::warn;
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fs;
use std::sync::Arc;
use std::thread;

/// Reaction to a received signal.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Shutdown,
    Exit,
}

fn on_signal(ctx: &Context, signal: Signal) -> Action {
    if matches!(ctx.conditions.latch().state(), Some(Trip::Interrupted(_))) {
        if let Some(dir) = ctx.session_dir() {
            weak_error!(fs::remove_dir_all(&dir), "session directory removal:");
        }
        return Action::Exit;
    }

    warn!(target: "shim", "received {signal}, shutting down");
    ctx.conditions.trip(Trip::Interrupted(signal));
    Action::Shutdown
}

/// Start the signal thread of a run.
pub fn install(ctx: Arc<Context>) -> Result<(), Error> {
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("shim-signals".to_string())
        .spawn(move || {
            for signo in signals.forever() {
                let Ok(signal) = Signal::try_from(signo) else {
                    continue;
                };
                if on_signal(&ctx, signal) == Action::Exit {
                    unsafe { nix::libc::_exit(1) }
                }
            }
        })?;

    Ok(())
}
