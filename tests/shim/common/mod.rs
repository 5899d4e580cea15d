use mpir_shim::mpir::Snapshot;
use mpir_shim::shim::pmix::{
    find, App, DataArray, EventAck, EventCode, EventHandler, HandlerId, Info, Key, Notification,
    OnRegistered, ProcInfo, ProcessControl, Proc, Query, Rank, Status, Value,
};
use mpir_shim::shim::{ApplicationControl, ShimHook};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

pub const LAUNCHER_NSPACE: &str = "prte-node1-4242@0";
pub const APP_NSPACE: &str = "prte-node1-4242@1";
pub const APP_EXECUTABLE: &str = "/home/user/ring";

pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

pub fn launcher() -> Proc {
    Proc::new(LAUNCHER_NSPACE, Rank::Index(0))
}

pub fn application() -> Proc {
    Proc::wildcard(APP_NSPACE)
}

fn proc_info(rank: u32, host: &str, pid: i32) -> ProcInfo {
    ProcInfo {
        proc: Proc::new(APP_NSPACE, Rank::Index(rank)),
        hostname: host.to_string(),
        executable: APP_EXECUTABLE.to_string(),
        pid,
        exit_code: 0,
        state: 1,
    }
}

/// Behavior of the simulated launcher and its job.
#[derive(Clone, Debug)]
pub struct SimJob {
    /// Process table, in the order the server reports it.
    pub procs: Vec<ProcInfo>,
    pub launcher_exit_code: Option<i32>,
    pub app_exit_code: Option<i32>,
    /// Launch-complete notification carries the application namespace.
    pub publish_namespace: bool,
    /// Server connection drops instead of completing the launch.
    pub lose_connection_on_launch: bool,
    /// Launcher never declares itself ready.
    pub stall_ready: bool,
    /// Application terminates as soon as a handler watches it (already running job).
    pub app_exits_when_watched: bool,
    /// Registrations of this event fail.
    pub fail_registration_of: Option<EventCode>,
}

impl SimJob {
    /// Two ranks on node1, reported out of rank order.
    pub fn two_ranks() -> Self {
        Self {
            procs: vec![proc_info(1, "node1", 101), proc_info(0, "node1", 100)],
            launcher_exit_code: Some(0),
            app_exit_code: Some(0),
            publish_namespace: true,
            lose_connection_on_launch: false,
            stall_ready: false,
            app_exits_when_watched: false,
            fail_registration_of: None,
        }
    }
}

struct Registered {
    id: HandlerId,
    codes: Vec<EventCode>,
    affected: Option<Proc>,
    handler: EventHandler,
}

impl Registered {
    fn accepts(&self, n: &Notification) -> bool {
        if !self.codes.contains(&n.code) {
            return false;
        }
        match (&self.affected, find(&n.info, &Key::EventAffectedProc)) {
            (None, _) => true,
            (Some(want), Some(Value::Proc(got))) => {
                want.nspace == got.nspace && (want.rank == Rank::Wildcard || want.rank == got.rank)
            }
            (Some(_), _) => false,
        }
    }
}

#[derive(Default)]
pub struct SimState {
    pub calls: Vec<String>,
    pub tool_attrs: Vec<Info>,
    pub connect_attrs: Vec<Info>,
    pub job_attrs: Vec<Info>,
    pub apps: Vec<App>,
    pub notified: Vec<(EventCode, Vec<Info>)>,
    pub released: Vec<Proc>,
    pub finalize_calls: usize,
    pub delivered: usize,
    pub acked: usize,
    spawned: bool,
    next_id: usize,
    handlers: Vec<Registered>,
}

type Progress = Box<dyn FnOnce() + Send>;

/// Simulated process-control library.
///
/// Registration results and notifications are delivered in order from a background thread,
/// the way the real library delivers them from its progress thread.
pub struct SimPmix {
    job: SimJob,
    state: Arc<Mutex<SimState>>,
    progress: Mutex<mpsc::Sender<Progress>>,
}

impl SimPmix {
    pub fn new(job: SimJob) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Progress>();
        thread::spawn(move || {
            for step in rx {
                step();
            }
        });

        Arc::new(Self {
            job,
            state: Arc::default(),
            progress: Mutex::new(tx),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn call(&self, call: String) {
        self.state().calls.push(call);
    }

    fn schedule(&self, step: impl FnOnce() + Send + 'static) {
        self.progress.lock().unwrap().send(Box::new(step)).unwrap();
    }

    fn emit(&self, n: Notification) {
        let state = self.state.clone();
        self.schedule(move || deliver(&state, n));
    }

    fn emit_terminations(&self) {
        let mut info = vec![Info::new(Key::EventAffectedProc, Value::Proc(application()))];
        if let Some(code) = self.job.app_exit_code {
            info.push(Info::new(Key::ExitCode, Value::Int(code)));
        }
        self.emit(Notification {
            code: EventCode::JobTerminated,
            source: Some(launcher()),
            info,
        });

        let mut info = vec![Info::new(Key::EventAffectedProc, Value::Proc(launcher()))];
        if let Some(code) = self.job.launcher_exit_code {
            info.push(Info::new(Key::JobTermStatus, Value::Status(Status(code))));
        }
        self.emit(Notification {
            code: EventCode::JobTerminated,
            source: None,
            info,
        });
    }
}

fn deliver(state: &Mutex<SimState>, n: Notification) {
    let handlers = {
        let state = state.lock().unwrap();
        let mut handlers = state
            .handlers
            .iter()
            .filter(|h| h.accepts(&n))
            .map(|h| h.handler.clone())
            .collect::<Vec<_>>();
        if handlers.is_empty() {
            handlers = state
                .handlers
                .iter()
                .filter(|h| h.codes.is_empty())
                .map(|h| h.handler.clone())
                .collect();
        }
        handlers
    };

    for handler in handlers {
        state.lock().unwrap().delivered += 1;
        let acked = Arc::new(AtomicBool::new(false));
        let ack = {
            let acked = acked.clone();
            EventAck::new(move || acked.store(true, Ordering::SeqCst))
        };
        handler(n.clone(), ack);
        if acked.load(Ordering::SeqCst) {
            state.lock().unwrap().acked += 1;
        }
    }
}

impl ProcessControl for SimPmix {
    fn tool_init(&self, attrs: &[Info]) -> Result<Proc, Status> {
        self.call("tool_init".to_string());
        self.state().tool_attrs = attrs.to_vec();

        let nspace = match find(attrs, &Key::ToolNspace) {
            Some(Value::Str(nspace)) => nspace.clone(),
            _ => "mpir.sim".to_string(),
        };
        Ok(Proc::new(nspace, Rank::Index(0)))
    }

    fn tool_finalize(&self) -> Result<(), Status> {
        let mut state = self.state();
        state.calls.push("tool_finalize".to_string());
        state.finalize_calls += 1;
        Ok(())
    }

    fn connect_to_server(&self, _: &Proc, attrs: &[Info]) -> Result<(), Status> {
        self.call("connect".to_string());
        self.state().connect_attrs = attrs.to_vec();
        Ok(())
    }

    fn register_event_handler(
        &self,
        codes: &[EventCode],
        attrs: &[Info],
        handler: EventHandler,
        on_registered: OnRegistered,
    ) {
        self.call(format!("register {codes:?}"));

        if let Some(code) = self.job.fail_registration_of {
            if codes.contains(&code) {
                self.schedule(move || on_registered(Err(Status(-25))));
                return;
            }
        }

        let affected = match find(attrs, &Key::EventAffectedProc) {
            Some(Value::Proc(proc)) => Some(proc.clone()),
            _ => None,
        };
        let watches_app = affected.as_ref().map(|p| p.nspace.as_str()) == Some(APP_NSPACE);

        let (id, ready) = {
            let mut state = self.state();
            state.next_id += 1;
            let id = HandlerId(state.next_id);
            state.handlers.push(Registered {
                id,
                codes: codes.to_vec(),
                affected,
                handler,
            });
            let ready = state.spawned && codes.contains(&EventCode::LauncherReady);
            (id, ready)
        };

        self.schedule(move || on_registered(Ok(id)));

        if ready && !self.job.stall_ready {
            self.emit(Notification {
                code: EventCode::LauncherReady,
                source: Some(launcher()),
                info: vec![],
            });
        }
        if watches_app && self.job.app_exits_when_watched {
            self.emit_terminations();
        }
    }

    fn deregister_event_handler(&self, id: HandlerId) -> Result<(), Status> {
        let mut state = self.state();
        state.calls.push(format!("deregister {}", id.0));
        state.handlers.retain(|h| h.id != id);
        Ok(())
    }

    fn notify_event(&self, code: EventCode, attrs: &[Info]) -> Result<(), Status> {
        self.call(format!("notify {code:?}"));
        self.state().notified.push((code, attrs.to_vec()));

        match code {
            EventCode::LaunchDirective if self.job.lose_connection_on_launch => {
                self.emit(Notification {
                    code: EventCode::LostConnection,
                    source: None,
                    info: vec![],
                });
            }
            EventCode::LaunchDirective => {
                let mut info = vec![Info::string(Key::EventHandlerName, "prte")];
                if self.job.publish_namespace {
                    info.push(Info::string(Key::Nspace, APP_NSPACE));
                }
                self.emit(Notification {
                    code: EventCode::LaunchComplete,
                    source: Some(launcher()),
                    info,
                });
            }
            EventCode::DebuggerRelease => {
                let target = match find(attrs, &Key::EventCustomRange) {
                    Some(Value::Proc(target)) => target.clone(),
                    _ => return Err(Status(-27)),
                };
                let released_both = {
                    let mut state = self.state();
                    state.released.push(target);
                    state.released.contains(&launcher()) && state.released.contains(&application())
                };
                if released_both {
                    self.emit_terminations();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn query(&self, queries: &[Query]) -> Result<Vec<Info>, Status> {
        let key = queries
            .first()
            .and_then(|q| q.keys.first())
            .cloned()
            .ok_or(Status(-27))?;
        self.call(format!("query {key}"));

        match key {
            Key::QueryProcTable => Ok(vec![Info::new(
                Key::QueryProcTable,
                Value::DataArray(DataArray::ProcInfo(self.job.procs.clone())),
            )]),
            Key::QueryNamespaces => Ok(vec![Info::string(Key::QueryNamespaces, APP_NSPACE)]),
            _ => Err(Status(-46)),
        }
    }

    fn spawn(&self, job_attrs: &[Info], apps: &[App]) -> Result<String, Status> {
        self.call("spawn".to_string());
        let mut state = self.state();
        state.job_attrs = job_attrs.to_vec();
        state.apps = apps.to_vec();
        state.spawned = true;
        Ok(LAUNCHER_NSPACE.to_string())
    }

    fn get(&self, _: &Proc, key: &Key) -> Result<Value, Status> {
        self.call(format!("get {key}"));
        match key {
            Key::ServerNspace => Ok(Value::Str(LAUNCHER_NSPACE.to_string())),
            Key::ServerRank => Ok(Value::Rank(Rank::Index(0))),
            _ => Err(Status(-46)),
        }
    }

    fn error_string(&self, status: Status) -> String {
        format!("SIM_ERROR({status})")
    }
}

/// Records what the shim shows to the debugger.
#[derive(Default)]
pub struct TestHook {
    pub snapshots: Mutex<Vec<Snapshot>>,
    pub connection_lost: AtomicBool,
    /// Release the application from the breakpoint.
    pub release_on_breakpoint: bool,
}

impl TestHook {
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("breakpoint not reached")
    }
}

impl ShimHook for TestHook {
    fn on_breakpoint(&self, snapshot: &Snapshot, app: &dyn ApplicationControl) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        if self.release_on_breakpoint {
            app.release_application().unwrap();
        }
    }

    fn on_connection_lost(&self) {
        self.connection_lost.store(true, Ordering::SeqCst);
    }
}

/// Assert that every call appears in `calls`, in the given order.
#[macro_export]
macro_rules! assert_calls_in_order {
    ($calls:expr, [$($call:expr),+ $(,)?]) => {
        let calls: &[String] = &$calls;
        let mut from = 0;
        for expected in [$($call),+] {
            match calls[from..].iter().position(|c| c == expected) {
                Some(pos) => from += pos + 1,
                None => panic!("call '{expected}' not found in order in {calls:?}"),
            }
        }
    };
}
