use crate::shim::condition::{lock, Conditions};
use crate::shim::mode::Mode;
use crate::shim::pmix::Proc;
use crate::shim::ShimHook;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Termination record of the launcher or the application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Termination {
    pub terminated: bool,
    pub exit_code: i32,
    pub code_given: bool,
}

impl Termination {
    /// Exit code to report, 0 when none was given.
    pub fn reported_code(&self) -> i32 {
        if self.code_given {
            self.exit_code
        } else {
            0
        }
    }
}

/// Process whose termination is tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Party {
    Launcher,
    Application,
}

/// What to do with a lost server connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossVerdict {
    /// Another session is still open.
    Absorbed,
    /// The last session is gone.
    Fatal,
}

#[derive(Clone, Debug)]
struct Identities {
    tool: Proc,
    launcher: Proc,
    application: Proc,
}

/// State of a shim run shared by the coordinator and the event handlers.
///
/// Handlers write a field before posting the condition that announces it, the coordinator reads
/// it after waiting on that condition.
pub struct Context {
    mode: Mode,
    pub conditions: Conditions,
    identities: Mutex<Identities>,
    launcher: Mutex<Termination>,
    application: Mutex<Termination>,
    sessions: Mutex<i32>,
    session_dir: Mutex<Option<PathBuf>>,
    hook: Arc<dyn ShimHook>,
}

impl Context {
    pub fn new(mode: Mode, hook: Arc<dyn ShimHook>) -> Self {
        Self {
            mode,
            conditions: Conditions::new(),
            identities: Mutex::new(Identities {
                tool: Proc::unresolved(),
                launcher: Proc::unresolved(),
                application: Proc::unresolved(),
            }),
            launcher: Mutex::default(),
            application: Mutex::default(),
            sessions: Mutex::new(0),
            session_dir: Mutex::default(),
            hook,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn hook(&self) -> &dyn ShimHook {
        self.hook.as_ref()
    }

    pub fn tool(&self) -> Proc {
        lock(&self.identities).tool.clone()
    }

    pub fn set_tool(&self, tool: Proc) {
        lock(&self.identities).tool = tool;
    }

    pub fn launcher(&self) -> Proc {
        lock(&self.identities).launcher.clone()
    }

    pub fn set_launcher(&self, launcher: Proc) {
        lock(&self.identities).launcher = launcher;
    }

    pub fn application(&self) -> Proc {
        lock(&self.identities).application.clone()
    }

    pub fn set_application(&self, application: Proc) {
        lock(&self.identities).application = application;
    }

    pub fn record_termination(&self, party: Party, exit_code: Option<i32>) {
        let mut record = match party {
            Party::Launcher => lock(&self.launcher),
            Party::Application => lock(&self.application),
        };
        record.terminated = true;
        if let Some(code) = exit_code {
            record.exit_code = code;
            record.code_given = true;
        }
    }

    pub fn termination(&self, party: Party) -> Termination {
        match party {
            Party::Launcher => *lock(&self.launcher),
            Party::Application => *lock(&self.application),
        }
    }

    /// Exit code of the run: the launcher's, or the application's in attach mode.
    pub fn exit_code(&self) -> i32 {
        let party = match self.mode {
            Mode::Attach => Party::Application,
            _ => Party::Launcher,
        };
        self.termination(party).reported_code()
    }

    /// Remember the session directory of the run, for cleanup outside of the coordinator.
    pub fn set_session_dir(&self, dir: &Path) {
        *lock(&self.session_dir) = Some(dir.to_path_buf());
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        lock(&self.session_dir).clone()
    }

    /// Count a new connection to a server.
    pub fn add_session(&self) {
        *lock(&self.sessions) += 1;
    }

    pub fn open_sessions(&self) -> i32 {
        *lock(&self.sessions)
    }

    /// Account for a lost connection.
    pub fn lose_session(&self) -> LossVerdict {
        let mut sessions = lock(&self.sessions);
        if *sessions == 1 {
            return LossVerdict::Fatal;
        }
        *sessions = (*sessions - 1).max(0);
        LossVerdict::Absorbed
    }
}
