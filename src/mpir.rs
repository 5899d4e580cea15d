//! Legacy debugger process-acquisition interface (MPIR).
//!
//! A debugger finds these symbols by name in the symbol table of the running shim, reads the
//! process table after hitting a breakpoint on [`MPIR_Breakpoint`] and attaches to the listed
//! processes. Names, types and layout are fixed by the MPIR process acquisition interface.
#![allow(non_upper_case_globals, non_camel_case_types, non_snake_case)]

use crate::shim::condition::lock;
use log::debug;
use nix::libc::{c_char, c_int};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString, NulError};
use std::ptr;
use std::ptr::{addr_of, addr_of_mut};
use std::sync::Mutex;

pub const MPIR_NULL: c_int = 0;
pub const MPIR_DEBUG_SPAWNED: c_int = 1;
pub const MPIR_DEBUG_ABORTING: c_int = 2;

/// Process descriptor, one per rank.
#[repr(C)]
#[derive(Debug)]
pub struct MPIR_PROCDESC {
    pub host_name: *mut c_char,
    pub executable_name: *mut c_char,
    pub pid: c_int,
}

/// Set by the debugger when it is attached to the starter.
#[no_mangle]
pub static mut MPIR_being_debugged: c_int = 0;
#[no_mangle]
pub static mut MPIR_proctable: *mut MPIR_PROCDESC = ptr::null_mut();
#[no_mangle]
pub static mut MPIR_proctable_size: c_int = 0;
#[no_mangle]
pub static mut MPIR_debug_state: c_int = MPIR_NULL;
#[no_mangle]
pub static mut MPIR_debug_abort_string: *mut c_char = ptr::null_mut();

// presence markers, the debugger only checks that the symbols exist
#[no_mangle]
#[used]
pub static MPIR_i_am_starter: c_int = 0;
#[no_mangle]
#[used]
pub static MPIR_force_to_main: c_int = 0;
#[no_mangle]
#[used]
pub static MPIR_partial_attach_ok: c_int = 0;
#[no_mangle]
#[used]
pub static MPIR_ignore_queues: c_int = 0;

/// The debugger sets a breakpoint here, it fires after the process table is published.
#[no_mangle]
#[inline(never)]
pub extern "C" fn MPIR_Breakpoint() {
    std::hint::black_box(());
}

/// Process table in the MPIR layout.
///
/// Owns the descriptor array and the strings the descriptors point to. Equal host and
/// executable names share one string.
#[derive(Debug)]
pub struct ProcTable {
    descriptors: Vec<MPIR_PROCDESC>,
    strings: BTreeSet<CString>,
}

// descriptors only point into `strings`, which moves with the table
unsafe impl Send for ProcTable {}

impl ProcTable {
    /// Table of `size` empty descriptors.
    pub fn with_size(size: usize) -> Self {
        let descriptors = (0..size)
            .map(|_| MPIR_PROCDESC {
                host_name: ptr::null_mut(),
                executable_name: ptr::null_mut(),
                pid: 0,
            })
            .collect();
        Self {
            descriptors,
            strings: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Return true if descriptor `idx` was filled.
    pub fn is_set(&self, idx: usize) -> bool {
        self.descriptors
            .get(idx)
            .map(|d| !d.host_name.is_null())
            .unwrap_or(false)
    }

    /// Fill descriptor `idx`. Panics if `idx` is out of range.
    pub fn set(&mut self, idx: usize, host: &str, executable: &str, pid: i32) -> Result<(), NulError> {
        let host_name = self.intern(host)?;
        let executable_name = self.intern(executable)?;
        self.descriptors[idx] = MPIR_PROCDESC {
            host_name,
            executable_name,
            pid,
        };
        Ok(())
    }

    fn intern(&mut self, s: &str) -> Result<*mut c_char, NulError> {
        let s = CString::new(s)?;
        if let Some(existing) = self.strings.get(s.as_c_str()) {
            return Ok(existing.as_ptr() as *mut c_char);
        }
        // the heap buffer of a CString does not move when the CString moves into the set
        let ptr = s.as_ptr() as *mut c_char;
        self.strings.insert(s);
        Ok(ptr)
    }

    /// Number of distinct strings owned by the table.
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }
}

static PUBLISHED: Mutex<Option<ProcTable>> = Mutex::new(None);
static ABORT_STRING: Mutex<Option<CString>> = Mutex::new(None);

/// Publish a process table through `MPIR_proctable`/`MPIR_proctable_size` and mark the job as
/// spawned. A previously published table is freed.
pub fn publish(table: ProcTable) {
    let mut published = lock(&PUBLISHED);
    let old = published.take();
    let table = published.insert(table);

    debug!(target: "mpir", "publish process table of {} entries", table.len());
    unsafe {
        ptr::write_volatile(addr_of_mut!(MPIR_proctable_size), table.len() as c_int);
        ptr::write_volatile(addr_of_mut!(MPIR_proctable), table.descriptors.as_mut_ptr());
        ptr::write_volatile(addr_of_mut!(MPIR_debug_state), MPIR_DEBUG_SPAWNED);
    }
    drop(old);
}

/// Notify the debugger, see [`MPIR_Breakpoint`].
pub fn breakpoint() {
    debug!(target: "mpir", "MPIR_Breakpoint");
    MPIR_Breakpoint();
}

/// Mark the job as aborting. The first reason is kept.
pub fn set_aborting(reason: &str) {
    let mut abort = lock(&ABORT_STRING);
    unsafe {
        ptr::write_volatile(addr_of_mut!(MPIR_debug_state), MPIR_DEBUG_ABORTING);
    }
    if abort.is_some() {
        return;
    }
    let Ok(reason) = CString::new(reason) else {
        return;
    };
    let reason = abort.insert(reason);
    unsafe {
        ptr::write_volatile(
            addr_of_mut!(MPIR_debug_abort_string),
            reason.as_ptr() as *mut c_char,
        );
    }
}

/// Withdraw and free the published process table.
pub fn release_table() {
    let mut published = lock(&PUBLISHED);
    unsafe {
        ptr::write_volatile(addr_of_mut!(MPIR_proctable), ptr::null_mut());
        ptr::write_volatile(addr_of_mut!(MPIR_proctable_size), 0);
    }
    if published.take().is_some() {
        debug!(target: "mpir", "process table released");
    }
}

/// Restore the initial state of every MPIR symbol.
pub fn reset() {
    release_table();
    let mut abort = lock(&ABORT_STRING);
    unsafe {
        ptr::write_volatile(addr_of_mut!(MPIR_debug_abort_string), ptr::null_mut());
        ptr::write_volatile(addr_of_mut!(MPIR_debug_state), MPIR_NULL);
    }
    abort.take();
}

/// Published descriptor, as the debugger sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub host_name: String,
    pub executable_name: String,
    pub pid: i32,
    pub host_name_ptr: usize,
    pub executable_name_ptr: usize,
}

/// Copy of the MPIR symbols state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub proctable_size: i32,
    pub proctable: Vec<Entry>,
    pub debug_state: i32,
    pub abort_string: Option<String>,
}

unsafe fn string_at(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Read the MPIR symbols.
pub fn snapshot() -> Snapshot {
    let _published = lock(&PUBLISHED);
    let _abort = lock(&ABORT_STRING);

    unsafe {
        let size = ptr::read_volatile(addr_of!(MPIR_proctable_size));
        let table = ptr::read_volatile(addr_of!(MPIR_proctable));
        let proctable = if table.is_null() {
            vec![]
        } else {
            (0..size.max(0) as usize)
                .map(|idx| {
                    let desc = &*table.add(idx);
                    Entry {
                        host_name: string_at(desc.host_name),
                        executable_name: string_at(desc.executable_name),
                        pid: desc.pid,
                        host_name_ptr: desc.host_name as usize,
                        executable_name_ptr: desc.executable_name as usize,
                    }
                })
                .collect()
        };

        let abort = ptr::read_volatile(addr_of!(MPIR_debug_abort_string));
        Snapshot {
            proctable_size: size,
            proctable,
            debug_state: ptr::read_volatile(addr_of!(MPIR_debug_state)),
            abort_string: (!abort.is_null()).then(|| string_at(abort)),
        }
    }
}
