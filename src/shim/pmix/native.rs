//! [`ProcessControl`] over libpmix.
//!
//! Outgoing attributes are built with the library's own loaders and freed with its own
//! destructors. Notifications reach their closure through the event "return object" attribute the
//! library hands back to the handler. Registration results reach their callback through the
//! callback data pointer.

use super::ffi;
use super::*;
use log::{debug, error, warn};
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::str::FromStr;
use std::sync::Mutex;

type RawStatus = ffi::pmix_status_t;
type RawType = ffi::pmix_data_type_t;

const SUCCESS: RawStatus = ffi::PMIX_SUCCESS as RawStatus;
const OPERATION_SUCCEEDED: RawStatus = ffi::PMIX_OPERATION_SUCCEEDED as RawStatus;
const ERR_BAD_PARAM: RawStatus = ffi::PMIX_ERR_BAD_PARAM as RawStatus;
const ERR_NOT_SUPPORTED: RawStatus = ffi::PMIX_ERR_NOT_SUPPORTED as RawStatus;
const EVENT_ACTION_COMPLETE: RawStatus = ffi::PMIX_EVENT_ACTION_COMPLETE as RawStatus;

const T_BOOL: RawType = ffi::PMIX_BOOL as RawType;
const T_STRING: RawType = ffi::PMIX_STRING as RawType;
const T_INT: RawType = ffi::PMIX_INT as RawType;
const T_UINT32: RawType = ffi::PMIX_UINT32 as RawType;
const T_PID: RawType = ffi::PMIX_PID as RawType;
const T_STATUS: RawType = ffi::PMIX_STATUS as RawType;
const T_PROC: RawType = ffi::PMIX_PROC as RawType;
const T_PROC_RANK: RawType = ffi::PMIX_PROC_RANK as RawType;
const T_ENVAR: RawType = ffi::PMIX_ENVAR as RawType;
const T_DATA_ARRAY: RawType = ffi::PMIX_DATA_ARRAY as RawType;
const T_INFO: RawType = ffi::PMIX_INFO as RawType;
const T_PROC_INFO: RawType = ffi::PMIX_PROC_INFO as RawType;
const T_POINTER: RawType = ffi::PMIX_POINTER as RawType;

/// Key of the attribute carrying the handler closure.
const RETURN_OBJECT: &CStr = c"pmix.evobj";

/// Event codes and their library values.
const EVENT_CODES: [(EventCode, RawStatus); 6] = [
    (EventCode::LauncherReady, ffi::PMIX_LAUNCHER_READY as RawStatus),
    (EventCode::LaunchComplete, ffi::PMIX_LAUNCH_COMPLETE as RawStatus),
    (EventCode::JobTerminated, ffi::PMIX_ERR_JOB_TERMINATED as RawStatus),
    (EventCode::LostConnection, ffi::PMIX_ERR_LOST_CONNECTION as RawStatus),
    (EventCode::DebuggerRelease, ffi::PMIX_DEBUGGER_RELEASE as RawStatus),
    (EventCode::LaunchDirective, ffi::PMIX_LAUNCH_DIRECTIVE as RawStatus),
];

fn raw_code(code: EventCode) -> RawStatus {
    match code {
        EventCode::Other(Status(raw)) => raw,
        code => EVENT_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, raw)| *raw)
            .unwrap_or(ERR_NOT_SUPPORTED),
    }
}

fn event_code(raw: RawStatus) -> EventCode {
    EVENT_CODES
        .iter()
        .find(|(_, r)| *r == raw)
        .map(|(code, _)| *code)
        .unwrap_or(EventCode::Other(Status(raw)))
}

fn check(rc: RawStatus) -> Result<(), Status> {
    if rc == SUCCESS || rc == OPERATION_SUCCEEDED {
        Ok(())
    } else {
        Err(Status(rc))
    }
}

fn c_string(s: &str) -> Result<CString, Status> {
    CString::new(s).map_err(|_| {
        warn!(target: "pmix", "string {s:?} contains an interior nul byte");
        Status(ERR_BAD_PARAM)
    })
}

unsafe fn string_from(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

fn type_name(t: RawType) -> String {
    unsafe { string_from(ffi::PMIx_Data_type_string(t)) }
}

fn raw_proc(proc: &Proc) -> Result<ffi::pmix_proc_t, Status> {
    let mut raw = ffi::pmix_proc_t::default();
    let nspace = proc.nspace.as_bytes();
    if nspace.len() >= raw.nspace.len() || nspace.contains(&0) {
        return Err(Status(ERR_BAD_PARAM));
    }
    for (dst, src) in raw.nspace.iter_mut().zip(nspace) {
        *dst = *src as c_char;
    }
    raw.rank = proc.rank.raw();
    Ok(raw)
}

unsafe fn proc_from(raw: &ffi::pmix_proc_t) -> Proc {
    Proc::new(string_from(raw.nspace.as_ptr()), Rank::from_raw(raw.rank))
}

/// Attribute array allocated by the library.
struct InfoArray {
    ptr: *mut ffi::pmix_info_t,
    len: usize,
}

impl InfoArray {
    fn with_len(len: usize) -> Self {
        let ptr = if len == 0 {
            ptr::null_mut()
        } else {
            unsafe { ffi::PMIx_Info_create(len) }
        };
        Self { ptr, len }
    }

    fn load(info: &[Info]) -> Result<Self, Status> {
        let array = Self::with_len(info.len());
        for (idx, info) in info.iter().enumerate() {
            let key = c_string(info.key.as_str())?;
            unsafe { load_value(array.ptr.add(idx), &key, &info.value)? };
        }
        Ok(array)
    }

    /// Append the handler closure pointer.
    fn load_with_return_object(info: &[Info], object: *const c_void) -> Result<Self, Status> {
        let array = Self::with_len(info.len() + 1);
        for (idx, info) in info.iter().enumerate() {
            let key = c_string(info.key.as_str())?;
            unsafe { load_value(array.ptr.add(idx), &key, &info.value)? };
        }
        unsafe {
            check(ffi::PMIx_Info_load(
                array.ptr.add(info.len()),
                RETURN_OBJECT.as_ptr(),
                object,
                T_POINTER,
            ))?;
        }
        Ok(array)
    }
}

impl Drop for InfoArray {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { ffi::PMIx_Info_free(self.ptr, self.len) };
        }
    }
}

/// Load `value` into the attribute at `dst`. The library copies the payload.
unsafe fn load_value(dst: *mut ffi::pmix_info_t, key: &CStr, value: &Value) -> Result<(), Status> {
    let key = key.as_ptr();
    let rc = match value {
        Value::Bool(flag) => ffi::PMIx_Info_load(dst, key, flag as *const bool as _, T_BOOL),
        Value::Str(s) => {
            let s = c_string(s)?;
            ffi::PMIx_Info_load(dst, key, s.as_ptr() as _, T_STRING)
        }
        Value::Int(i) => ffi::PMIx_Info_load(dst, key, i as *const i32 as _, T_INT),
        Value::Uint32(u) => ffi::PMIx_Info_load(dst, key, u as *const u32 as _, T_UINT32),
        Value::Pid(pid) => ffi::PMIx_Info_load(dst, key, pid as *const i32 as _, T_PID),
        Value::Status(Status(s)) => ffi::PMIx_Info_load(dst, key, s as *const i32 as _, T_STATUS),
        Value::Proc(proc) => {
            let raw = raw_proc(proc)?;
            ffi::PMIx_Info_load(dst, key, &raw as *const ffi::pmix_proc_t as _, T_PROC)
        }
        Value::Rank(rank) => {
            let raw = rank.raw();
            ffi::PMIx_Info_load(dst, key, &raw as *const u32 as _, T_PROC_RANK)
        }
        Value::Envar(envar) => {
            let name = c_string(&envar.name)?;
            let value = c_string(&envar.value)?;
            let raw = ffi::pmix_envar_t {
                envar: name.as_ptr() as *mut c_char,
                value: value.as_ptr() as *mut c_char,
                separator: envar.separator as c_char,
            };
            ffi::PMIx_Info_load(dst, key, &raw as *const ffi::pmix_envar_t as _, T_ENVAR)
        }
        Value::DataArray(DataArray::Info(info)) => {
            let nested = InfoArray::load(info)?;
            let raw = ffi::pmix_data_array_t {
                type_: T_INFO,
                size: nested.len,
                array: nested.ptr as *mut c_void,
            };
            ffi::PMIx_Info_load(dst, key, &raw as *const ffi::pmix_data_array_t as _, T_DATA_ARRAY)
        }
        other => {
            warn!(target: "pmix", "cannot send a value of type {}", other.type_name());
            ERR_NOT_SUPPORTED
        }
    };
    check(rc)
}

unsafe fn value_from(raw: &ffi::pmix_value_t) -> Value {
    match raw.type_ {
        T_BOOL => Value::Bool(raw.data.flag),
        T_STRING => Value::Str(string_from(raw.data.string)),
        T_INT => Value::Int(raw.data.integer),
        T_UINT32 => Value::Uint32(raw.data.uint32),
        T_PID => Value::Pid(raw.data.pid),
        T_STATUS => Value::Status(Status(raw.data.status)),
        T_PROC if !raw.data.proc_.is_null() => Value::Proc(proc_from(&*raw.data.proc_)),
        T_PROC_RANK => Value::Rank(Rank::from_raw(raw.data.rank)),
        T_DATA_ARRAY => Value::DataArray(data_array_from(raw.data.darray)),
        t => Value::Unsupported(type_name(t)),
    }
}

unsafe fn data_array_from(darray: *const ffi::pmix_data_array_t) -> DataArray {
    let Some(darray) = darray.as_ref() else {
        return DataArray::Null;
    };
    if darray.array.is_null() {
        return DataArray::Null;
    }

    match darray.type_ {
        T_INFO => DataArray::Info(infos_from(darray.array as *const ffi::pmix_info_t, darray.size)),
        T_PROC_INFO => {
            let procs = std::slice::from_raw_parts(
                darray.array as *const ffi::pmix_proc_info_t,
                darray.size,
            );
            DataArray::ProcInfo(
                procs
                    .iter()
                    .map(|p| ProcInfo {
                        proc: proc_from(&p.proc_),
                        hostname: string_from(p.hostname),
                        executable: string_from(p.executable_name),
                        pid: p.pid,
                        exit_code: p.exit_code,
                        state: p.state,
                    })
                    .collect(),
            )
        }
        t => DataArray::Other(type_name(t)),
    }
}

unsafe fn infos_from(info: *const ffi::pmix_info_t, len: usize) -> Vec<Info> {
    if info.is_null() {
        return vec![];
    }
    std::slice::from_raw_parts(info, len)
        .iter()
        .filter_map(|info| {
            let name = CStr::from_ptr(info.key.as_ptr());
            if name == RETURN_OBJECT {
                return None;
            }
            let name = name.to_string_lossy();
            let key = Key::from_str(&name).unwrap_or_else(|_| Key::Other(name.into_owned()));
            Some(Info::new(key, value_from(&info.value)))
        })
        .collect()
}

unsafe fn return_object(info: *const ffi::pmix_info_t, len: usize) -> Option<*const EventHandler> {
    if info.is_null() {
        return None;
    }
    std::slice::from_raw_parts(info, len)
        .iter()
        .find(|info| {
            CStr::from_ptr(info.key.as_ptr()) == RETURN_OBJECT && info.value.type_ == T_POINTER
        })
        .map(|info| info.value.data.ptr as *const EventHandler)
}

/// Notification completion handle passed back to the library.
struct Completion {
    cbfunc: ffi::pmix_event_notification_cbfunc_fn_t,
    cbdata: *mut c_void,
}

// the library accepts the completion from any thread
unsafe impl Send for Completion {}

impl Completion {
    fn complete(self) {
        if let Some(cbfunc) = self.cbfunc {
            unsafe {
                cbfunc(
                    EVENT_ACTION_COMPLETE,
                    ptr::null_mut(),
                    0,
                    None,
                    ptr::null_mut(),
                    self.cbdata,
                )
            };
        }
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn on_notification(
    _id: usize,
    status: RawStatus,
    source: *const ffi::pmix_proc_t,
    info: *mut ffi::pmix_info_t,
    ninfo: usize,
    _results: *mut ffi::pmix_info_t,
    _nresults: usize,
    cbfunc: ffi::pmix_event_notification_cbfunc_fn_t,
    cbdata: *mut c_void,
) {
    let completion = Completion { cbfunc, cbdata };
    let ack = EventAck::new(move || completion.complete());

    let Some(handler) = return_object(info, ninfo) else {
        debug!(target: "pmix", "notification {status} without a handler object");
        return;
    };
    let handler = (*handler).clone();

    let notification = Notification {
        code: event_code(status),
        source: source.as_ref().map(|s| proc_from(s)),
        info: infos_from(info, ninfo),
    };

    if catch_unwind(AssertUnwindSafe(move || handler(notification, ack))).is_err() {
        error!(target: "pmix", "event handler panicked on notification {status}");
    }
}

/// Pending handler registration.
///
/// The library reads the codes and attributes of a registration from its progress thread,
/// both stay alive until the registration result is delivered.
struct Registration {
    on_registered: OnRegistered,
    codes: Vec<RawStatus>,
    info: InfoArray,
}

impl Registration {
    /// Deliver the result, then release the codes and attributes.
    fn finish(self, result: Result<HandlerId, Status>) {
        let Registration {
            on_registered,
            codes,
            info,
        } = self;
        if catch_unwind(AssertUnwindSafe(move || on_registered(result))).is_err() {
            error!(target: "pmix", "registration callback panicked");
        }
        drop(info);
        drop(codes);
    }
}

unsafe extern "C" fn on_registration(status: RawStatus, refid: usize, cbdata: *mut c_void) {
    let registration = Box::from_raw(cbdata as *mut Registration);
    let result = match check(status) {
        Ok(()) => Ok(HandlerId(refid)),
        Err(status) => Err(status),
    };
    registration.finish(result);
}

fn intern(s: &str, strings: &mut Vec<CString>) -> Result<*mut c_char, Status> {
    let s = c_string(s)?;
    let ptr = s.as_ptr() as *mut c_char;
    strings.push(s);
    Ok(ptr)
}

/// Command descriptors that live as long as the spawn call.
struct RawApps {
    _strings: Vec<CString>,
    _argvs: Vec<Vec<*mut c_char>>,
    apps: Vec<ffi::pmix_app_t>,
}

impl RawApps {
    fn new(apps: &[App]) -> Result<Self, Status> {
        let mut strings = vec![];
        let mut argvs = vec![];
        let mut raw_apps = vec![];

        for app in apps {
            let mut argv = app
                .argv
                .iter()
                .map(|a| intern(a, &mut strings))
                .collect::<Result<Vec<_>, _>>()?;
            argv.push(ptr::null_mut());
            let mut env = app
                .env
                .iter()
                .map(|e| intern(e, &mut strings))
                .collect::<Result<Vec<_>, _>>()?;
            env.push(ptr::null_mut());

            let mut raw = ffi::pmix_app_t::default();
            raw.cmd = intern(&app.cmd, &mut strings)?;
            raw.cwd = if app.cwd.is_empty() {
                ptr::null_mut()
            } else {
                intern(&app.cwd, &mut strings)?
            };
            raw.maxprocs = app.maxprocs;
            raw.argv = argv.as_mut_ptr();
            raw.env = env.as_mut_ptr();
            argvs.push(argv);
            argvs.push(env);
            raw_apps.push(raw);
        }

        Ok(Self {
            _strings: strings,
            _argvs: argvs,
            apps: raw_apps,
        })
    }
}

/// PMIx library client.
#[derive(Default)]
pub struct NativePmix {
    /// Closures referenced by registered handlers, alive until the client is dropped.
    handlers: Mutex<Vec<Box<EventHandler>>>,
}

impl NativePmix {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessControl for NativePmix {
    fn tool_init(&self, attrs: &[Info]) -> Result<Proc, Status> {
        let info = InfoArray::load(attrs)?;
        let mut tool = ffi::pmix_proc_t::default();
        check(unsafe { ffi::PMIx_tool_init(&mut tool, info.ptr, info.len) })?;
        Ok(unsafe { proc_from(&tool) })
    }

    fn tool_finalize(&self) -> Result<(), Status> {
        check(unsafe { ffi::PMIx_tool_finalize() })
    }

    fn connect_to_server(&self, tool: &Proc, attrs: &[Info]) -> Result<(), Status> {
        let info = InfoArray::load(attrs)?;
        let mut tool = raw_proc(tool)?;
        check(unsafe { ffi::PMIx_tool_connect_to_server(&mut tool, info.ptr, info.len) })
    }

    fn register_event_handler(
        &self,
        codes: &[EventCode],
        attrs: &[Info],
        handler: EventHandler,
        on_registered: OnRegistered,
    ) {
        let object = {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            let boxed = Box::new(handler);
            let object = &*boxed as *const EventHandler as *const c_void;
            handlers.push(boxed);
            object
        };

        let info = match InfoArray::load_with_return_object(attrs, object) {
            Ok(info) => info,
            Err(status) => return on_registered(Err(status)),
        };
        let mut registration = Box::new(Registration {
            on_registered,
            codes: codes.iter().map(|&c| raw_code(c)).collect(),
            info,
        });
        let codes_ptr = if registration.codes.is_empty() {
            ptr::null_mut()
        } else {
            registration.codes.as_mut_ptr()
        };
        let ncodes = registration.codes.len();
        let (info_ptr, ninfo) = (registration.info.ptr, registration.info.len);

        let cbdata = Box::into_raw(registration) as *mut c_void;
        let rc = unsafe {
            ffi::PMIx_Register_event_handler(
                codes_ptr,
                ncodes,
                info_ptr,
                ninfo,
                Some(on_notification),
                Some(on_registration),
                cbdata,
            )
        };

        // the callback fires only when the request was accepted
        if rc != SUCCESS {
            let registration = unsafe { Box::from_raw(cbdata as *mut Registration) };
            registration.finish(Err(Status(rc)));
        }
    }

    fn deregister_event_handler(&self, id: HandlerId) -> Result<(), Status> {
        check(unsafe { ffi::PMIx_Deregister_event_handler(id.0, None, ptr::null_mut()) })
    }

    fn notify_event(&self, code: EventCode, attrs: &[Info]) -> Result<(), Status> {
        let info = InfoArray::load(attrs)?;
        check(unsafe {
            ffi::PMIx_Notify_event(
                raw_code(code),
                ptr::null(),
                ffi::PMIX_RANGE_CUSTOM as ffi::pmix_data_range_t,
                info.ptr,
                info.len,
                None,
                ptr::null_mut(),
            )
        })
    }

    fn query(&self, queries: &[Query]) -> Result<Vec<Info>, Status> {
        let mut keys = vec![];
        let mut qualifiers = vec![];
        let mut raw = vec![];
        for query in queries {
            let names = query
                .keys
                .iter()
                .map(|k| c_string(k.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            let mut argv = names
                .iter()
                .map(|k| k.as_ptr() as *mut c_char)
                .collect::<Vec<_>>();
            argv.push(ptr::null_mut());
            let qual = InfoArray::load(&query.qualifiers)?;

            let mut q = ffi::pmix_query_t::default();
            q.keys = argv.as_mut_ptr();
            q.qualifiers = qual.ptr;
            q.nqual = qual.len;
            raw.push(q);
            keys.push((names, argv));
            qualifiers.push(qual);
        }

        let mut results: *mut ffi::pmix_info_t = ptr::null_mut();
        let mut nresults = 0;
        check(unsafe {
            ffi::PMIx_Query_info(raw.as_mut_ptr(), raw.len(), &mut results, &mut nresults)
        })?;

        let response = unsafe { infos_from(results, nresults) };
        if !results.is_null() {
            unsafe { ffi::PMIx_Info_free(results, nresults) };
        }
        Ok(response)
    }

    fn spawn(&self, job_attrs: &[Info], apps: &[App]) -> Result<String, Status> {
        let info = InfoArray::load(job_attrs)?;
        let apps = RawApps::new(apps)?;
        let mut nspace = ffi::pmix_proc_t::default().nspace;

        check(unsafe {
            ffi::PMIx_Spawn(
                info.ptr,
                info.len,
                apps.apps.as_ptr(),
                apps.apps.len(),
                nspace.as_mut_ptr(),
            )
        })?;
        Ok(unsafe { string_from(nspace.as_ptr()) })
    }

    fn get(&self, proc: &Proc, key: &Key) -> Result<Value, Status> {
        let proc = raw_proc(proc)?;
        let key = c_string(key.as_str())?;
        let mut value: *mut ffi::pmix_value_t = ptr::null_mut();

        check(unsafe { ffi::PMIx_Get(&proc, key.as_ptr(), ptr::null(), 0, &mut value) })?;
        if value.is_null() {
            return Err(Status(ffi::PMIX_ERR_NOT_FOUND as RawStatus));
        }
        let result = unsafe { value_from(&*value) };
        unsafe { ffi::PMIx_Value_free(value, 1) };
        Ok(result)
    }

    fn error_string(&self, status: Status) -> String {
        unsafe { string_from(ffi::PMIx_Error_string(status.0)) }
    }
}
