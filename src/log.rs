use env_logger::Builder;
use log::{debug, LevelFilter};

/// Log targets of the shim.
pub const TARGETS: [&str; 3] = ["shim", "pmix", "mpir"];

/// Install the process logger.
///
/// Filters come from `RUST_LOG`, `debug` raises every shim target to debug level on top of them.
/// Calling it again is a no-op.
pub fn init(debug: bool) {
    let mut builder = Builder::from_default_env();
    if debug {
        for target in TARGETS {
            builder.filter_module(target, LevelFilter::Debug);
        }
    }
    _ = builder.try_init();
}

/// Logs entering a step of a run when created and leaving it when dropped.
pub struct Scope {
    name: &'static str,
}

impl Scope {
    pub fn enter(name: &'static str) -> Self {
        debug!(target: "shim", "enter {name}");
        Self { name }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        debug!(target: "shim", "leave {}", self.name);
    }
}
