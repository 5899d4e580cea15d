use crate::shim::condition::Trip;
use crate::shim::pmix::{ProcessControl, Status};
use nix::sys::signal::Signal;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- configuration errors -------------------------------------
    #[error("Invalid connect pid {0}")]
    InvalidPid(i32),
    #[error("No MPI application invocation specified")]
    NoInvocation,
    #[error("invalid PMIx install prefix {0:?}: {1}")]
    InvalidPrefix(PathBuf, &'static str),

    // --------------------------------- environment errors ---------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("stat failed on the TMPDIR '{0}': {1}")]
    TmpDir(String, nix::Error),
    #[error("An error occured creating the session directory {0:?}: {1}")]
    SessionDir(PathBuf, std::io::Error),

    // --------------------------------- library errors -------------------------------------------
    #[error("{call}: {message} ({status})")]
    Library {
        call: &'static str,
        status: Status,
        message: String,
    },

    // --------------------------------- protocol violations --------------------------------------
    #[error("Launched application namespace wasn't returned in callback")]
    NoApplicationNamespace,
    #[error("The response to namespace query has wrong format")]
    NamespaceQueryFormat,
    #[error("launcher identity is not published by the server")]
    LauncherUnresolved,
    #[error("PMIx proc table info/ninfo is 0")]
    EmptyProcTable,
    #[error("PMIx proc table has incorrect data type: {0}")]
    ProcTableType(String),
    #[error("PMIx proc table data array is null")]
    ProcTableNull,
    #[error("PMIx proc table data array has incorrect type: {0}")]
    ProcTableElementType(String),
    #[error("PMIx proc table rank {rank} is out of range (size {size})")]
    RankOutOfRange { rank: u32, size: usize },
    #[error("PMIx proc table describes rank {0} twice")]
    DuplicateRank(u32),
    #[error("{0}")]
    Protocol(String),

    // --------------------------------- run interruption -----------------------------------------
    #[error("the launcher terminated while waiting for {0}")]
    LauncherTerminated(&'static str),
    #[error("Connection to application being debugged was lost")]
    ConnectionLost,
    #[error("interrupted by {0}")]
    Interrupted(Signal),
}

impl Error {
    /// Wrap a failed library call, resolving the status string through the library.
    pub fn library<P: ProcessControl + ?Sized>(pmix: &P, call: &'static str, status: Status) -> Self {
        Error::Library {
            call,
            status,
            message: pmix.error_string(status),
        }
    }

    /// Error for a wait released by a tripped latch.
    pub fn from_trip(trip: Trip, waiting_for: &'static str) -> Self {
        match trip {
            Trip::LauncherTerminated => Error::LauncherTerminated(waiting_for),
            Trip::ConnectionLost => Error::ConnectionLost,
            Trip::Interrupted(signal) => Error::Interrupted(signal),
        }
    }

    /// Return true if the error aborts the run with the fatal error banner.
    ///
    /// Launcher termination ends the run normally with the launcher exit code,
    /// connection loss and signals end it with status 1 without the banner.
    pub fn is_fatal(&self) -> bool {
        match self {
            // configuration errors
            Error::InvalidPid(_) => true,
            Error::NoInvocation => true,
            Error::InvalidPrefix(_, _) => true,

            // environment errors
            Error::IO(_) => true,
            Error::TmpDir(_, _) => true,
            Error::SessionDir(_, _) => true,

            // library errors
            Error::Library { .. } => true,

            // protocol violations
            Error::NoApplicationNamespace => true,
            Error::NamespaceQueryFormat => true,
            Error::LauncherUnresolved => true,
            Error::EmptyProcTable => true,
            Error::ProcTableType(_) => true,
            Error::ProcTableNull => true,
            Error::ProcTableElementType(_) => true,
            Error::RankOutOfRange { .. } => true,
            Error::DuplicateRank(_) => true,
            Error::Protocol(_) => true,

            // run interruption
            Error::LauncherTerminated(_) => false,
            Error::ConnectionLost => false,
            Error::Interrupted(_) => false,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "shim", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "shim", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}
