use crate::shim::error::Error;
use log::debug;
use nix::sys::stat::{stat, Mode, SFlag};
use nix::unistd::{getpid, geteuid};
use std::ffi::OsString;
use std::fs;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

const DEFAULT_TMP_DIR: &str = "/tmp";

/// Session directory and rendezvous file of a proxy run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPaths {
    dir: PathBuf,
    rendezvous: PathBuf,
}

impl SessionPaths {
    /// Derive session paths.
    ///
    /// # Arguments
    ///
    /// * `base`: temporary directory the session directory is created in
    /// * `tool`: tool name
    /// * `euid`: effective user id of the tool process
    /// * `pid`: tool process id
    pub fn new(base: &Path, tool: &str, euid: u32, pid: i32) -> Self {
        let dir = base.join(format!("{tool}.session.{euid}.{pid}"));
        let rendezvous = dir.join(format!("{tool}.rndz.{pid}"));
        Self { dir, rendezvous }
    }

    /// Session paths of the current process under the temporary directory (see [`tmp_dir`]).
    pub fn current(tool: &str) -> Result<Self, Error> {
        let base = tmp_dir(std::env::var_os("TMPDIR"))?;
        Ok(Self::new(
            &base,
            tool,
            geteuid().as_raw(),
            getpid().as_raw(),
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rendezvous_file(&self) -> &Path {
        &self.rendezvous
    }

    /// Create the session directory, accessible by the owner only.
    pub fn create(&self) -> Result<(), Error> {
        DirBuilder::new()
            .mode(0o700)
            .create(&self.dir)
            .map_err(|e| Error::SessionDir(self.dir.clone(), e))?;

        debug!(target: "shim", "session directory is {:?}", self.dir);
        debug!(target: "shim", "rendezvous file is {:?}", self.rendezvous);
        Ok(())
    }

    /// Remove the session directory with all its content.
    pub fn remove(&self) -> Result<(), Error> {
        debug!(target: "shim", "remove session directory {:?}", self.dir);
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

/// Choose the base directory for session directories.
///
/// `TMPDIR` is used when it names a directory its owner can read, write and search,
/// otherwise `/tmp`. A `TMPDIR` that cannot be stat'ed is an error.
pub fn tmp_dir(tmpdir: Option<OsString>) -> Result<PathBuf, Error> {
    let Some(tmpdir) = tmpdir else {
        return Ok(PathBuf::from(DEFAULT_TMP_DIR));
    };

    let path = PathBuf::from(tmpdir);
    let st = stat(&path).map_err(|e| Error::TmpDir(path.to_string_lossy().into_owned(), e))?;

    let file_type = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
    let owner_rwx = Mode::from_bits_truncate(st.st_mode) & Mode::S_IRWXU == Mode::S_IRWXU;
    if file_type == SFlag::S_IFDIR && owner_rwx {
        Ok(path)
    } else {
        Ok(PathBuf::from(DEFAULT_TMP_DIR))
    }
}
