//! Event subscriptions of a shim run.

use crate::mpir;
use crate::shim::condition::{lock, Trip, Wake};
use crate::shim::context::{Context, LossVerdict, Party};
use crate::shim::error::Error;
use crate::shim::pmix::{
    EventAck, EventCode, EventHandler, HandlerId, Info, Key, Notification, OnRegistered,
    ProcessControl, Proc, Status, Value,
};
use crate::weak_error;
use log::debug;
use std::sync::{Arc, Mutex};
use strum_macros::Display;

/// Classes of events the shim subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum EventClass {
    /// Catch-all, watches for a lost server connection.
    Default,
    LauncherReady,
    LaunchComplete,
    /// Filtered to the launcher identity.
    LauncherTerminated,
    /// Filtered to the application identity.
    ApplicationTerminated,
}

impl EventClass {
    fn codes(self) -> Vec<EventCode> {
        match self {
            EventClass::Default => vec![],
            EventClass::LauncherReady => vec![EventCode::LauncherReady],
            EventClass::LaunchComplete => vec![EventCode::LaunchComplete],
            EventClass::LauncherTerminated | EventClass::ApplicationTerminated => {
                vec![EventCode::JobTerminated]
            }
        }
    }

    /// Registration attributes, `target` is the affected process of terminate classes.
    pub fn attributes(self, target: &Proc) -> Vec<Info> {
        match self {
            EventClass::Default => vec![],
            EventClass::LauncherReady => vec![Info::string(Key::EventHandlerName, "LAUNCHER-READY")],
            EventClass::LaunchComplete => {
                vec![Info::string(Key::EventHandlerName, "LAUNCHER-COMPLETE")]
            }
            EventClass::LauncherTerminated | EventClass::ApplicationTerminated => {
                vec![Info::new(Key::EventAffectedProc, Value::Proc(target.clone()))]
            }
        }
    }

    fn handler(self, ctx: Arc<Context>) -> EventHandler {
        match self {
            EventClass::Default => Arc::new(move |n, ack| on_default(&ctx, n, ack)),
            EventClass::LauncherReady => Arc::new(move |n, ack| on_launcher_ready(&ctx, n, ack)),
            EventClass::LaunchComplete => Arc::new(move |n, ack| on_launch_complete(&ctx, n, ack)),
            EventClass::LauncherTerminated => {
                Arc::new(move |n, ack| on_terminated(&ctx, Party::Launcher, n, ack))
            }
            EventClass::ApplicationTerminated => {
                Arc::new(move |n, ack| on_terminated(&ctx, Party::Application, n, ack))
            }
        }
    }
}

fn describe_source(n: &Notification) -> String {
    n.source
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "null".to_string())
}

fn on_default(ctx: &Context, n: Notification, ack: EventAck) {
    debug!(target: "shim", "event {:?} from {}", n.code, describe_source(&n));

    if n.code == EventCode::LostConnection {
        eprintln!(
            "Connection to application being debugged was lost. (sessions {})",
            ctx.open_sessions()
        );
        // non-proxy runs connect twice, the first loss is expected
        if ctx.lose_session() == LossVerdict::Fatal {
            ctx.conditions.trip(Trip::ConnectionLost);
            ctx.hook().on_connection_lost();
        }
    }

    ack.complete();
}

fn on_launcher_ready(ctx: &Context, n: Notification, ack: EventAck) {
    debug!(target: "shim", "launcher ready, source {}", describe_source(&n));
    ctx.conditions.ready.post();
    ack.complete();
}

fn on_launch_complete(ctx: &Context, n: Notification, ack: EventAck) {
    debug!(target: "shim", "launch complete, source {}", describe_source(&n));

    // the last namespace attribute wins
    let nspace = n
        .info
        .iter()
        .filter(|info| info.key == Key::Nspace)
        .filter_map(|info| info.value.as_str())
        .last();

    match nspace {
        Some(nspace) => {
            debug!(target: "shim", "application namespace is '{nspace}'");
            ctx.set_application(Proc::wildcard(nspace));
        }
        None => eprintln!("No application namespace found in notification."),
    }

    ctx.conditions.complete.post();
    ack.complete();
}

/// Exit code carried by a termination event, the last matching attribute wins.
pub fn exit_code(info: &[Info]) -> Option<i32> {
    info.iter()
        .filter_map(|info| match (&info.key, &info.value) {
            (Key::ExitCode, Value::Int(code)) => Some(*code),
            (Key::JobTermStatus, Value::Status(Status(code))) => Some(*code),
            (Key::JobTermStatus, Value::Int(code)) => Some(*code),
            _ => None,
        })
        .last()
}

fn on_terminated(ctx: &Context, party: Party, n: Notification, ack: EventAck) {
    let code = exit_code(&n.info);
    debug!(
        target: "shim",
        "{party:?} terminated, source {}, exit code {code:?}",
        describe_source(&n)
    );

    if let Some(Value::Proc(affected)) = crate::shim::pmix::find(&n.info, &Key::EventAffectedProc) {
        debug!(target: "shim", "notified job terminated, affected {affected}");
    }

    if let Some(code) = code.filter(|&code| code != 0) {
        let who = match party {
            Party::Launcher => "launcher",
            Party::Application => "application",
        };
        mpir::set_aborting(&format!("The {who} exited with return code {code}"));
    }

    ctx.record_termination(party, code);
    ctx.conditions.terminate.post();
    ctx.conditions.trip(Trip::LauncherTerminated);
    ack.complete();
}

/// Registered handlers of a run.
///
/// Each registration waits for its own completion result before returning, so registrations
/// issued by the coordinator never overlap.
pub struct Registry<P: ProcessControl> {
    pmix: Arc<P>,
    ctx: Arc<Context>,
    registered: Mutex<Vec<(EventClass, HandlerId)>>,
}

impl<P: ProcessControl> Registry<P> {
    pub fn new(pmix: Arc<P>, ctx: Arc<Context>) -> Self {
        Self {
            pmix,
            ctx,
            registered: Mutex::default(),
        }
    }

    /// Register a handler for `class` and wait for the registration result.
    ///
    /// Terminate classes are filtered to the launcher or application identity known to the
    /// context at the time of the call.
    pub fn register(&self, class: EventClass) -> Result<HandlerId, Error> {
        let target = match class {
            EventClass::LauncherTerminated => self.ctx.launcher(),
            EventClass::ApplicationTerminated => self.ctx.application(),
            _ => Proc::unresolved(),
        };
        debug!(target: "shim", "register {class} handler");

        let result: Arc<Mutex<Option<Result<HandlerId, Status>>>> = Arc::default();
        let on_registered: OnRegistered = {
            let result = result.clone();
            let ctx = self.ctx.clone();
            Box::new(move |res| {
                *lock(&result) = Some(res);
                ctx.conditions.registration.post();
            })
        };

        self.pmix.register_event_handler(
            &class.codes(),
            &class.attributes(&target),
            class.handler(self.ctx.clone()),
            on_registered,
        );

        let result = loop {
            let wake = self.ctx.conditions.registration.wait();
            if let Some(result) = lock(&result).take() {
                break result;
            }
            if let Wake::Released(trip) = wake {
                return Err(Error::from_trip(trip, "event handler registration"));
            }
        };

        match result {
            Ok(id) => {
                debug!(target: "shim", "{class} handler registered with id {}", id.0);
                lock(&self.registered).push((class, id));
                Ok(id)
            }
            Err(status) => {
                eprintln!(
                    "An error occurred registering {class} callback {}.",
                    self.pmix.error_string(status)
                );
                Err(Error::library(&*self.pmix, "PMIx_Register_event_handler", status))
            }
        }
    }

    /// Handlers registered so far, in registration order.
    pub fn registered(&self) -> Vec<(EventClass, HandlerId)> {
        lock(&self.registered).clone()
    }

    /// Deregister every handler without waiting for the library to confirm.
    pub fn deregister_all(&self) {
        let registered = std::mem::take(&mut *lock(&self.registered));
        for (class, id) in registered.into_iter().rev() {
            debug!(target: "shim", "deregister {class} handler {}", id.0);
            weak_error!(
                self.pmix
                    .deregister_event_handler(id)
                    .map_err(|status| Error::library(&*self.pmix, "PMIx_Deregister_event_handler", status)),
                "deregistration:"
            );
        }
    }
}
