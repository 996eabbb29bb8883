//! C ABI for applications linking haggle-client as a static library.
//! Functions return the daemon status codes (0 = success, negative = error).

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::ptr;

use haggle_core::status;
use haggle_core::{Attribute, DataObject, DataObjectId, PROTOCOL_VERSION};

use crate::config;
use crate::error::Result;
use crate::event_loop::LoopHook;
use crate::session::{self, Session};
use crate::subscription::Event;
use crate::supervisor::{DaemonStatus, Supervisor};

/// Event callback. `dobj` is null for daemon-shutdown and only valid during the call.
pub type HaggleEventCallback = extern "C" fn(dobj: *const c_void, arg: *mut c_void);

/// Event loop start/stop hook, called on the loop thread.
pub type HaggleLoopHook = extern "C" fn(arg: *mut c_void);

/// Opaque caller context handed back to the callback on the event loop thread.
#[derive(Clone, Copy)]
struct CallbackArg(*mut c_void);

// The caller vouches for its context being usable from the event loop thread.
unsafe impl Send for CallbackArg {}

impl CallbackArg {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

fn code(r: Result<()>) -> c_int {
    match r {
        Ok(()) => status::NO_ERROR,
        Err(e) => e.status().code(),
    }
}

/// Borrow a C string. None if null or not UTF-8.
unsafe fn str_arg<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

unsafe fn session_ref<'a>(h: *mut c_void) -> Option<&'a Session> {
    (h as *const Session).as_ref()
}

unsafe fn id_arg(p: *const u8) -> Option<DataObjectId> {
    if p.is_null() {
        return None;
    }
    let mut bytes = [0u8; 32];
    ptr::copy_nonoverlapping(p, bytes.as_mut_ptr(), bytes.len());
    Some(DataObjectId::from_bytes(bytes))
}

unsafe fn data_object<'a>(d: *const c_void) -> Option<&'a DataObject> {
    (d as *const DataObject).as_ref()
}

/// Protocol version this library speaks.
#[no_mangle]
pub extern "C" fn haggle_version() -> u8 {
    PROTOCOL_VERSION
}

/// Register `name` with the daemon. On success stores an opaque handle in `out` and returns 0;
/// returns -5 if the name is held by another live session.
#[no_mangle]
pub extern "C" fn haggle_handle_get(name: *const c_char, out: *mut *mut c_void) -> c_int {
    if out.is_null() {
        return status::PARAM_ERROR;
    }
    let Some(name) = (unsafe { str_arg(name) }) else {
        return status::PARAM_ERROR;
    };
    match Session::register(&config::load(), name) {
        Ok(s) => {
            unsafe { *out = Box::into_raw(Box::new(s)) as *mut c_void };
            status::NO_ERROR
        }
        Err(e) => e.status().code(),
    }
}

/// Release a handle from `haggle_handle_get`. Returns -2 if h is null.
#[no_mangle]
pub extern "C" fn haggle_handle_free(h: *mut c_void) -> c_int {
    if h.is_null() {
        return status::PARAM_ERROR;
    }
    let s = unsafe { *Box::from_raw(h as *mut Session) };
    s.close();
    status::NO_ERROR
}

/// Drop whatever registration holds `name`, e.g. one left behind by a crashed process.
#[no_mangle]
pub extern "C" fn haggle_unregister(name: *const c_char) -> c_int {
    let Some(name) = (unsafe { str_arg(name) }) else {
        return status::PARAM_ERROR;
    };
    code(session::unregister(&config::load(), name))
}

/// Daemon-assigned session id, or -1 if h is null.
#[no_mangle]
pub extern "C" fn haggle_handle_get_session_id(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => s.session_id() as c_int,
        None => status::ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_ipc_publish_dataobject(h: *mut c_void, dobj: *const c_void) -> c_int {
    match unsafe { (session_ref(h), data_object(dobj)) } {
        (Some(s), Some(d)) => code(s.publish(d)),
        _ => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_ipc_add_application_interest(
    h: *mut c_void,
    name: *const c_char,
    value: *const c_char,
) -> c_int {
    add_interest(h, name, value, None)
}

#[no_mangle]
pub extern "C" fn haggle_ipc_add_application_interest_weighted(
    h: *mut c_void,
    name: *const c_char,
    value: *const c_char,
    weight: u32,
) -> c_int {
    add_interest(h, name, value, Some(weight))
}

fn add_interest(
    h: *mut c_void,
    name: *const c_char,
    value: *const c_char,
    weight: Option<u32>,
) -> c_int {
    match unsafe { (session_ref(h), str_arg(name), str_arg(value)) } {
        (Some(s), Some(n), Some(v)) => code(s.add_interest(n, v, weight)),
        _ => status::PARAM_ERROR,
    }
}

/// Add every attribute of `dobj` as an interest, weights included.
#[no_mangle]
pub extern "C" fn haggle_ipc_add_application_interests(
    h: *mut c_void,
    dobj: *const c_void,
) -> c_int {
    match unsafe { (session_ref(h), data_object(dobj)) } {
        (Some(s), Some(d)) => code(s.add_interests(&d.interests())),
        _ => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_ipc_remove_application_interests(
    h: *mut c_void,
    dobj: *const c_void,
) -> c_int {
    match unsafe { (session_ref(h), data_object(dobj)) } {
        (Some(s), Some(d)) => code(s.delete_interests(&d.interests())),
        _ => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_ipc_remove_application_interest(
    h: *mut c_void,
    name: *const c_char,
    value: *const c_char,
) -> c_int {
    match unsafe { (session_ref(h), str_arg(name), str_arg(value)) } {
        (Some(s), Some(n), Some(v)) => code(s.delete_interest(n, v)),
        _ => status::PARAM_ERROR,
    }
}

/// The answer arrives as an interest-list event.
#[no_mangle]
pub extern "C" fn haggle_ipc_get_application_interests_async(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => code(s.request_interests()),
        None => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_ipc_get_data_objects_async(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => code(s.request_data_objects()),
        None => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_ipc_delete_data_object(h: *mut c_void, dobj: *const c_void) -> c_int {
    match unsafe { (session_ref(h), data_object(dobj)) } {
        (Some(s), Some(d)) => code(s.delete_data_object(d)),
        _ => status::PARAM_ERROR,
    }
}

/// `id` points at the 32 id bytes, as filled in by `haggle_dataobject_get_id`.
#[no_mangle]
pub extern "C" fn haggle_ipc_delete_data_object_by_id(h: *mut c_void, id: *const u8) -> c_int {
    let Some(s) = (unsafe { session_ref(h) }) else {
        return status::PARAM_ERROR;
    };
    match unsafe { id_arg(id) } {
        Some(id) => code(s.delete_data_object_by_id(id)),
        None => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_ipc_shutdown(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => code(s.shutdown()),
        None => status::PARAM_ERROR,
    }
}

/// Subscribe `callback` to event category `event` (0..=3). Interest lists are passed as a data
/// object whose attributes are the interests.
#[no_mangle]
pub extern "C" fn haggle_ipc_register_event_interest(
    h: *mut c_void,
    event: c_int,
    callback: Option<HaggleEventCallback>,
    arg: *mut c_void,
) -> c_int {
    let (Some(s), Some(callback)) = (unsafe { session_ref(h) }, callback) else {
        return status::PARAM_ERROR;
    };
    let arg = CallbackArg(arg);
    let subscribed = s.subscribe_code(event, move |event: Event| {
        let dobj = match event {
            Event::DaemonShutdown => None,
            Event::NeighborUpdate(d) | Event::NewDataObject(d) => Some(d),
            Event::InterestList(interests) => Some(DataObject::from_interests(&interests)),
        };
        let ptr = dobj
            .as_ref()
            .map_or(ptr::null(), |d| d as *const DataObject as *const c_void);
        callback(ptr, arg.get());
    });
    code(subscribed.map(|_| ()))
}

/// Run the event loop on the calling thread until stopped.
#[no_mangle]
pub extern "C" fn haggle_event_loop_run(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => code(s.run_blocking()),
        None => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_event_loop_run_async(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => code(s.run_detached()),
        None => status::PARAM_ERROR,
    }
}

#[no_mangle]
pub extern "C" fn haggle_event_loop_stop(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => code(s.stop()),
        None => status::PARAM_ERROR,
    }
}

/// 1 if the event loop is running, 0 if not, -1 if h is null.
#[no_mangle]
pub extern "C" fn haggle_event_loop_is_running(h: *mut c_void) -> c_int {
    match unsafe { session_ref(h) } {
        Some(s) => s.is_running() as c_int,
        None => status::ERROR,
    }
}

/// Hooks called on the loop thread when a loop starts and when it ends, with `arg`.
/// Either may be null, not both. A hook already set cannot be replaced.
#[no_mangle]
pub extern "C" fn haggle_event_loop_register_callbacks(
    h: *mut c_void,
    start: Option<HaggleLoopHook>,
    stop: Option<HaggleLoopHook>,
    arg: *mut c_void,
) -> c_int {
    let Some(s) = (unsafe { session_ref(h) }) else {
        return status::PARAM_ERROR;
    };
    if start.is_none() && stop.is_none() {
        return status::PARAM_ERROR;
    }
    let arg = CallbackArg(arg);
    let wrap = |hook: HaggleLoopHook| -> LoopHook { Box::new(move || hook(arg.get())) };
    code(s.set_loop_hooks(start.map(wrap), stop.map(wrap)))
}

/// Daemon liveness: 0 not running, 1 running, 2 stale pid file, -1 error.
/// The pid (0 if none) is written to `out_pid` when it is not null.
#[no_mangle]
pub extern "C" fn haggle_daemon_pid(out_pid: *mut u32) -> c_int {
    let (rc, pid) = match Supervisor::new(&config::load()).daemon_status() {
        Ok(DaemonStatus::NotRunning) => (0, 0),
        Ok(DaemonStatus::Running(pid)) => (1, pid),
        Ok(DaemonStatus::Crashed(pid)) => (2, pid),
        Err(_) => (status::ERROR, 0),
    };
    if !out_pid.is_null() {
        unsafe { *out_pid = pid };
    }
    rc
}

/// Start the daemon unless running. `path` may be null to use the configured locations.
#[no_mangle]
pub extern "C" fn haggle_daemon_spawn(path: *const c_char) -> c_int {
    let path = if path.is_null() {
        None
    } else {
        match unsafe { str_arg(path) } {
            Some(p) => Some(Path::new(p)),
            None => return status::PARAM_ERROR,
        }
    };
    match Supervisor::new(&config::load()).spawn(path) {
        Ok(_) => status::NO_ERROR,
        Err(_) => status::ERROR,
    }
}

/// New empty data object. Free with `haggle_dataobject_free`.
#[no_mangle]
pub extern "C" fn haggle_dataobject_new() -> *mut c_void {
    Box::into_raw(Box::new(DataObject::new())) as *mut c_void
}

/// Returns 0 if added, 1 if the pair was already present, -2 on bad arguments.
#[no_mangle]
pub extern "C" fn haggle_dataobject_add_attribute(
    d: *mut c_void,
    name: *const c_char,
    value: *const c_char,
) -> c_int {
    let dobj = unsafe { (d as *mut DataObject).as_mut() };
    match (dobj, unsafe { str_arg(name) }, unsafe { str_arg(value) }) {
        (Some(d), Some(n), Some(v)) => {
            if d.add_attribute(n, v) {
                0
            } else {
                1
            }
        }
        _ => status::PARAM_ERROR,
    }
}

/// Add an attribute carrying an interest weight. Same returns as `haggle_dataobject_add_attribute`.
#[no_mangle]
pub extern "C" fn haggle_dataobject_add_attribute_weighted(
    d: *mut c_void,
    name: *const c_char,
    value: *const c_char,
    weight: u32,
) -> c_int {
    let dobj = unsafe { (d as *mut DataObject).as_mut() };
    match (dobj, unsafe { str_arg(name) }, unsafe { str_arg(value) }) {
        (Some(d), Some(n), Some(v)) => {
            if d.add(Attribute::weighted(n, v, weight)) {
                0
            } else {
                1
            }
        }
        _ => status::PARAM_ERROR,
    }
}

/// Copy the 32-byte content id of `d` into `out`.
#[no_mangle]
pub extern "C" fn haggle_dataobject_get_id(d: *const c_void, out: *mut u8) -> c_int {
    let Some(d) = (unsafe { data_object(d) }) else {
        return status::PARAM_ERROR;
    };
    if out.is_null() {
        return status::PARAM_ERROR;
    }
    let id = d.id();
    unsafe { ptr::copy_nonoverlapping(id.as_bytes().as_ptr(), out, 32) };
    status::NO_ERROR
}

/// Destroy a data object. No-op if d is null.
#[no_mangle]
pub extern "C" fn haggle_dataobject_free(d: *mut c_void) {
    if d.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(d as *mut DataObject) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::daemon;
    use std::ffi::CString;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn null_arguments_rejected() {
        assert_eq!(haggle_handle_get(ptr::null(), ptr::null_mut()), status::PARAM_ERROR);
        assert_eq!(haggle_handle_free(ptr::null_mut()), status::PARAM_ERROR);
        assert_eq!(haggle_handle_get_session_id(ptr::null_mut()), -1);
        assert_eq!(haggle_ipc_shutdown(ptr::null_mut()), status::PARAM_ERROR);
        assert_eq!(
            haggle_ipc_register_event_interest(ptr::null_mut(), 2, None, ptr::null_mut()),
            status::PARAM_ERROR
        );
        assert_eq!(haggle_event_loop_is_running(ptr::null_mut()), -1);
        assert_eq!(
            haggle_event_loop_register_callbacks(ptr::null_mut(), Some(hook), None, ptr::null_mut()),
            status::PARAM_ERROR
        );
        assert_eq!(
            haggle_ipc_delete_data_object_by_id(ptr::null_mut(), ptr::null()),
            status::PARAM_ERROR
        );
        assert_eq!(haggle_dataobject_get_id(ptr::null(), ptr::null_mut()), status::PARAM_ERROR);
        haggle_dataobject_free(ptr::null_mut());
    }

    #[test]
    fn dataobject_lifecycle() {
        let d = haggle_dataobject_new();
        let name = CString::new("Picture").unwrap();
        let value = CString::new("cat").unwrap();
        assert_eq!(haggle_dataobject_add_attribute(d, name.as_ptr(), value.as_ptr()), 0);
        assert_eq!(haggle_dataobject_add_attribute(d, name.as_ptr(), value.as_ptr()), 1);
        assert_eq!(
            unsafe { data_object(d) }.map(|d| d.attributes().len()),
            Some(1)
        );
        let owner = CString::new("Owner").unwrap();
        assert_eq!(
            haggle_dataobject_add_attribute_weighted(d, owner.as_ptr(), value.as_ptr(), 9),
            0
        );
        assert_eq!(
            unsafe { data_object(d) }.and_then(|d| d.attribute("Owner")).map(|a| a.weight),
            Some(9)
        );
        let mut id = [0u8; 32];
        assert_eq!(haggle_dataobject_get_id(d, id.as_mut_ptr()), 0);
        assert_eq!(Some(&id), unsafe { data_object(d) }.map(|d| *d.id().as_bytes()).as_ref());
        haggle_dataobject_free(d);
    }

    extern "C" fn forward(dobj: *const c_void, arg: *mut c_void) {
        let tx = unsafe { &*(arg as *const mpsc::Sender<Option<DataObject>>) };
        let _ = tx.send(unsafe { data_object(dobj) }.cloned());
    }

    extern "C" fn hook(arg: *mut c_void) {
        let tx = unsafe { &*(arg as *const mpsc::Sender<Option<DataObject>>) };
        let _ = tx.send(None);
    }

    fn handle_for(cfg: &crate::ClientConfig, name: &str) -> *mut c_void {
        Box::into_raw(Box::new(Session::register(cfg, name).unwrap())) as *mut c_void
    }

    #[test]
    fn loop_hooks_and_running_state() {
        let (_bg, cfg) = daemon();
        let h = handle_for(&cfg, "hooked-app");
        let (tx, rx) = mpsc::channel::<Option<DataObject>>();
        let arg = &tx as *const mpsc::Sender<Option<DataObject>> as *mut c_void;

        assert_eq!(
            haggle_event_loop_register_callbacks(h, None, None, arg),
            status::PARAM_ERROR
        );
        assert_eq!(haggle_event_loop_register_callbacks(h, Some(hook), Some(hook), arg), 0);
        assert_eq!(
            haggle_event_loop_register_callbacks(h, Some(hook), None, arg),
            status::ERROR
        );
        assert_eq!(haggle_ipc_register_event_interest(h, 2, Some(forward), arg), 0);
        assert_eq!(haggle_event_loop_is_running(h), 0);
        assert_eq!(haggle_event_loop_run_async(h), 0);
        assert_eq!(haggle_event_loop_is_running(h), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
        assert_eq!(haggle_event_loop_stop(h), 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
        assert_eq!(haggle_event_loop_is_running(h), 0);
        assert_eq!(haggle_handle_free(h), 0);
    }

    #[test]
    fn interest_lists_and_delete_by_id() {
        let (_bg, cfg) = daemon();
        let h = handle_for(&cfg, "list-app");
        let (tx, rx) = mpsc::channel::<Option<DataObject>>();
        let arg = &tx as *const mpsc::Sender<Option<DataObject>> as *mut c_void;
        assert_eq!(haggle_ipc_register_event_interest(h, 3, Some(forward), arg), 0);
        assert_eq!(haggle_event_loop_run_async(h), 0);

        let interests = DataObject::new()
            .with_attribute("Picture", "cat")
            .with_attribute("Owner", "bob");
        let d = &interests as *const DataObject as *const c_void;
        assert_eq!(haggle_ipc_add_application_interests(h, d), 0);
        let only_owner = DataObject::new().with_attribute("Owner", "bob");
        let o = &only_owner as *const DataObject as *const c_void;
        assert_eq!(haggle_ipc_remove_application_interests(h, o), 0);
        assert_eq!(haggle_ipc_get_application_interests_async(h), 0);
        let listed = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(listed.attribute("Picture").is_some());
        assert!(listed.attribute("Owner").is_none());
        assert_eq!(haggle_event_loop_stop(h), 0);

        let object = DataObject::new().with_attribute("Picture", "dog");
        let p = &object as *const DataObject as *const c_void;
        assert_eq!(haggle_ipc_publish_dataobject(h, p), 0);
        let mut id = [0u8; 32];
        assert_eq!(haggle_dataobject_get_id(p, id.as_mut_ptr()), 0);
        assert_eq!(haggle_ipc_delete_data_object_by_id(h, id.as_ptr()), 0);
        assert_eq!(
            haggle_ipc_delete_data_object_by_id(h, id.as_ptr()),
            status::NOT_FOUND
        );
        assert_eq!(haggle_handle_free(h), 0);
    }

    #[test]
    fn callbacks_through_c_abi() {
        let (_bg, cfg) = daemon();
        let session = Box::new(Session::register(&cfg, "c-app").unwrap());
        let h = Box::into_raw(session) as *mut c_void;
        let (tx, rx) = mpsc::channel::<Option<DataObject>>();
        let arg = &tx as *const mpsc::Sender<Option<DataObject>> as *mut c_void;

        assert_eq!(
            haggle_ipc_register_event_interest(h, 7, Some(forward), arg),
            status::PARAM_ERROR
        );
        assert_eq!(haggle_ipc_register_event_interest(h, 3, Some(forward), arg), 0);
        assert!(haggle_handle_get_session_id(h) > 0);
        let name = CString::new("Picture").unwrap();
        let value = CString::new("cat").unwrap();
        assert_eq!(
            haggle_ipc_add_application_interest_weighted(h, name.as_ptr(), value.as_ptr(), 4),
            0
        );
        assert_eq!(haggle_event_loop_run_async(h), 0);
        assert_eq!(haggle_ipc_get_application_interests_async(h), 0);
        let dobj = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(dobj.attribute("Picture").map(|a| a.weight), Some(4));
        assert_eq!(haggle_event_loop_stop(h), 0);
        assert_eq!(haggle_event_loop_stop(h), status::ERROR);
        assert_eq!(haggle_handle_free(h), 0);
    }
}
