//! Typed model of the process-control (PMIx) tool interface consumed by the shim.
//!
//! The shim never talks to the library directly, it goes through [`ProcessControl`]. Values that
//! cross the seam are owned rust types: attribute keys are [`Key`], payloads are [`Value`],
//! notification callbacks are closures and every registration reports its own result.

#[cfg(feature = "pmix")]
mod ffi;
#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "pmix")]
pub mod native;

use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use strum_macros::{EnumString, IntoStaticStr};

/// Raw value of the wildcard rank.
pub const RANK_WILDCARD: u32 = u32::MAX - 1;

/// Index of a process inside its namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rank {
    Index(u32),
    /// All processes of a namespace.
    Wildcard,
}

impl Rank {
    pub fn from_raw(raw: u32) -> Self {
        if raw == RANK_WILDCARD {
            Rank::Wildcard
        } else {
            Rank::Index(raw)
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Rank::Index(idx) => idx,
            Rank::Wildcard => RANK_WILDCARD,
        }
    }
}

impl Display for Rank {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Index(idx) => write!(f, "{idx}"),
            Rank::Wildcard => f.write_str("*"),
        }
    }
}

/// Process identity: a namespace and a rank inside it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Proc {
    pub nspace: String,
    pub rank: Rank,
}

impl Proc {
    pub fn new(nspace: impl Into<String>, rank: Rank) -> Self {
        Self {
            nspace: nspace.into(),
            rank,
        }
    }

    /// Identity of all processes of `nspace`.
    pub fn wildcard(nspace: impl Into<String>) -> Self {
        Self::new(nspace, Rank::Wildcard)
    }

    /// Identity that is not yet known (empty namespace, wildcard rank).
    pub fn unresolved() -> Self {
        Self::wildcard("")
    }

    pub fn is_resolved(&self) -> bool {
        !self.nspace.is_empty()
    }
}

impl Display for Proc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nspace, self.rank)
    }
}

/// Status code returned by the library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute keys the shim produces or interprets.
///
/// String forms are the library's well-known attribute names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
pub enum Key {
    #[strum(serialize = "pmix.nspace")]
    Nspace,
    #[strum(serialize = "pmix.rank")]
    Rank,
    #[strum(serialize = "pmix.tool.nspace")]
    ToolNspace,
    #[strum(serialize = "pmix.tool.rank")]
    ToolRank,
    #[strum(serialize = "pmix.tool.nocon")]
    ToolDoNotConnect,
    #[strum(serialize = "pmix.tool.launcher")]
    Launcher,
    #[strum(serialize = "pmix.srvr.pidinfo")]
    ServerPidinfo,
    #[strum(serialize = "pmix.prefix")]
    Prefix,
    #[strum(serialize = "pmix.evname")]
    EventHandlerName,
    #[strum(serialize = "pmix.evproc")]
    EventAffectedProc,
    #[strum(serialize = "pmix.evrange")]
    EventCustomRange,
    #[strum(serialize = "pmix.evnondef")]
    EventNonDefault,
    #[strum(serialize = "pmix.dbg.jdirs")]
    DebugJobDirectives,
    #[strum(serialize = "pmix.dbg.init")]
    DebugStopInInit,
    #[strum(serialize = "pmix.note.lnch")]
    NotifyLaunch,
    #[strum(serialize = "pmix.mapby")]
    MapBy,
    #[strum(serialize = "pmix.fwd.stdout")]
    ForwardStdout,
    #[strum(serialize = "pmix.fwd.stderr")]
    ForwardStderr,
    #[strum(serialize = "pmix.notecomp")]
    NotifyCompletion,
    #[strum(serialize = "pmix.spwn.tool")]
    SpawnTool,
    #[strum(serialize = "pmix.envar.set")]
    SetEnvar,
    #[strum(serialize = "pmix.tool.attach")]
    ToolAttachmentFile,
    #[strum(serialize = "pmix.tool.mretries")]
    ConnectMaxRetries,
    #[strum(serialize = "pmix.tool.retry")]
    ConnectRetryDelay,
    #[strum(serialize = "pmix.cnct.sys.first")]
    ConnectSystemFirst,
    #[strum(serialize = "pmix.srv.nspace")]
    ServerNspace,
    #[strum(serialize = "pmix.srv.rank")]
    ServerRank,
    #[strum(serialize = "pmix.qry.ns")]
    QueryNamespaces,
    #[strum(serialize = "pmix.qry.ptable")]
    QueryProcTable,
    #[strum(serialize = "pmix.exit.code")]
    ExitCode,
    #[strum(serialize = "pmix.job.term.status")]
    JobTermStatus,
    /// Any key the shim does not interpret.
    #[strum(default)]
    Other(String),
}

impl Key {
    pub fn as_str(&self) -> &str {
        match self {
            Key::Other(name) => name.as_str(),
            key => key.into(),
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment variable directive attached to a spawn request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envar {
    pub name: String,
    pub value: String,
    pub separator: char,
}

/// Per-process entry of a process table query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcInfo {
    pub proc: Proc,
    pub hostname: String,
    pub executable: String,
    pub pid: i32,
    pub exit_code: i32,
    pub state: u8,
}

/// Payload of an aggregate value.
#[derive(Clone, Debug, PartialEq)]
pub enum DataArray {
    Info(Vec<Info>),
    ProcInfo(Vec<ProcInfo>),
    /// Array of a type the shim does not interpret, carries the library's type name.
    Other(String),
    /// Aggregate without an array behind it.
    Null,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Str(String),
    Int(i32),
    Uint32(u32),
    Pid(i32),
    Status(Status),
    Proc(Proc),
    Rank(Rank),
    Envar(Envar),
    DataArray(DataArray),
    /// Value of a type the shim does not interpret, carries the library's type name.
    Unsupported(String),
}

impl Value {
    pub fn type_name(&self) -> &str {
        match self {
            Value::Bool(_) => "PMIX_BOOL",
            Value::Str(_) => "PMIX_STRING",
            Value::Int(_) => "PMIX_INT",
            Value::Uint32(_) => "PMIX_UINT32",
            Value::Pid(_) => "PMIX_PID",
            Value::Status(_) => "PMIX_STATUS",
            Value::Proc(_) => "PMIX_PROC",
            Value::Rank(_) => "PMIX_PROC_RANK",
            Value::Envar(_) => "PMIX_ENVAR",
            Value::DataArray(_) => "PMIX_DATA_ARRAY",
            Value::Unsupported(name) => name,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Single attribute (key and value).
#[derive(Clone, Debug, PartialEq)]
pub struct Info {
    pub key: Key,
    pub value: Value,
}

impl Info {
    pub fn new(key: Key, value: Value) -> Self {
        Self { key, value }
    }

    /// Boolean attribute set to `true`.
    pub fn flag(key: Key) -> Self {
        Self::new(key, Value::Bool(true))
    }

    pub fn string(key: Key, value: impl Into<String>) -> Self {
        Self::new(key, Value::Str(value.into()))
    }
}

/// Find the value of the first attribute with a given key.
pub fn find<'a>(info: &'a [Info], key: &Key) -> Option<&'a Value> {
    info.iter().find(|i| &i.key == key).map(|i| &i.value)
}

/// Application (command) descriptor of a spawn request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct App {
    pub cmd: String,
    pub argv: Vec<String>,
    /// `NAME=value` entries.
    pub env: Vec<String>,
    pub cwd: String,
    pub maxprocs: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub keys: Vec<Key>,
    pub qualifiers: Vec<Info>,
}

/// Event codes the shim registers for, emits or receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCode {
    LauncherReady,
    LaunchComplete,
    JobTerminated,
    LostConnection,
    DebuggerRelease,
    LaunchDirective,
    Other(Status),
}

/// Registration handle returned by the library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub usize);

/// Event delivered to a registered handler.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub code: EventCode,
    pub source: Option<Proc>,
    pub info: Vec<Info>,
}

/// Acknowledgment of a delivered notification.
///
/// The library event pipeline stalls until every delivered notification is completed with
/// "action complete". [`EventAck::complete`] does it explicitly, dropping an unused ack does it
/// implicitly.
pub struct EventAck(Option<Box<dyn FnOnce() + Send>>);

impl EventAck {
    pub fn new(complete: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(complete)))
    }

    pub fn complete(mut self) {
        if let Some(complete) = self.0.take() {
            complete()
        }
    }
}

impl Drop for EventAck {
    fn drop(&mut self) {
        if let Some(complete) = self.0.take() {
            complete()
        }
    }
}

impl fmt::Debug for EventAck {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventAck")
            .field(&self.0.as_ref().map(|_| "pending"))
            .finish()
    }
}

/// Notification callback, called from the library's progress thread.
pub type EventHandler = Arc<dyn Fn(Notification, EventAck) + Send + Sync>;

/// Registration completion callback, called exactly once per registration.
pub type OnRegistered = Box<dyn FnOnce(Result<HandlerId, Status>) + Send>;

/// Calls the shim issues into the process-control library.
///
/// Blocking calls return when the library has completed the operation. Notification handlers
/// and registration callbacks may run on a library-owned thread in any order relative to the
/// caller.
pub trait ProcessControl: Send + Sync + 'static {
    /// Initialize as a tool, return the tool identity assigned by the library.
    fn tool_init(&self, attrs: &[Info]) -> Result<Proc, Status>;

    fn tool_finalize(&self) -> Result<(), Status>;

    /// Connect the already initialized tool to a server.
    fn connect_to_server(&self, tool: &Proc, attrs: &[Info]) -> Result<(), Status>;

    /// Register a notification handler. An empty `codes` registers a default handler.
    ///
    /// The call returns immediately, `on_registered` reports the result later.
    fn register_event_handler(
        &self,
        codes: &[EventCode],
        attrs: &[Info],
        handler: EventHandler,
        on_registered: OnRegistered,
    );

    fn deregister_event_handler(&self, id: HandlerId) -> Result<(), Status>;

    /// Emit an event with custom range, the target is carried by [`Key::EventCustomRange`].
    fn notify_event(&self, code: EventCode, attrs: &[Info]) -> Result<(), Status>;

    fn query(&self, queries: &[Query]) -> Result<Vec<Info>, Status>;

    /// Spawn a job, return its namespace.
    fn spawn(&self, job_attrs: &[Info], apps: &[App]) -> Result<String, Status>;

    /// Retrieve a single value published for `proc`.
    fn get(&self, proc: &Proc, key: &Key) -> Result<Value, Status>;

    /// Human-readable form of a status code.
    fn error_string(&self, status: Status) -> String;
}
