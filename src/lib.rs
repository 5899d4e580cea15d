//! PMIx to MPIR shim.
//!
//! Starts (or attaches to) an MPI job through a PMIx launcher, holds the application processes
//! at startup and exposes them to a debugger through the MPIR process acquisition interface.

pub mod log;
pub mod mpir;
pub mod shim;
