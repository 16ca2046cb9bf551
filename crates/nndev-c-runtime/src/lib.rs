use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

use nndev::backend::registry::create_device;
use nndev::{
    status_of, DeviceResult, NnDevice, PrerunParams, Subgraph, SubgraphDesc, SubgraphId,
    STATUS_FAILED, STATUS_FOREIGN_HANDLE, STATUS_INVALID_ARGUMENT, STATUS_INVALID_STATE,
    STATUS_LIVE_SUBGRAPHS, STATUS_OK, STATUS_SLOT_EMPTY, STATUS_SLOT_OCCUPIED,
};

/// Opaque device handle owned by the C host.
pub struct NnDeviceHandle {
    device: Box<dyn NnDevice>,
}

/// Opaque subgraph handle owned by the C host.
pub struct NnSubgraphHandle {
    subgraph: Subgraph,
}

/// JSON-encoded `SubgraphDesc`, not NUL-terminated.
#[repr(C)]
pub struct NnSubgraphJson {
    pub json: *const c_char,
    pub json_len: usize,
}

pub type NnDeviceInitFn = unsafe extern "C" fn(dev: *mut NnDeviceHandle) -> c_int;
pub type NnDevicePrerunFn = unsafe extern "C" fn(
    dev: *mut NnDeviceHandle,
    subgraph: *mut NnSubgraphHandle,
    num_thread: c_int,
    cpu_affinity: c_int,
    mode: c_int,
) -> c_int;
pub type NnDeviceRunFn =
    unsafe extern "C" fn(dev: *mut NnDeviceHandle, subgraph: *mut NnSubgraphHandle) -> c_int;
pub type NnDevicePostrunFn =
    unsafe extern "C" fn(dev: *mut NnDeviceHandle, subgraph: *mut NnSubgraphHandle) -> c_int;
pub type NnDeviceReleaseFn = unsafe extern "C" fn(dev: *mut NnDeviceHandle) -> c_int;

/// Dispatch table of the five lifecycle calls, for hosts that expect function pointers.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NnDeviceOps {
    pub init: NnDeviceInitFn,
    pub prerun: NnDevicePrerunFn,
    pub run: NnDeviceRunFn,
    pub postrun: NnDevicePostrunFn,
    pub release: NnDeviceReleaseFn,
}

#[no_mangle]
pub extern "C" fn nndev_device_ops() -> NnDeviceOps {
    NnDeviceOps {
        init: nndev_device_init,
        prerun: nndev_device_prerun,
        run: nndev_device_run,
        postrun: nndev_device_postrun,
        release: nndev_device_release,
    }
}

fn report(op: &str, result: DeviceResult<()>) -> c_int {
    if let Err(err) = &result {
        tracing::debug!(op, status = err.status(), "lifecycle call failed: {err}");
    }
    status_of(&result)
}

fn invalid(op: &str, what: &str) -> c_int {
    tracing::warn!(op, "{what}");
    STATUS_INVALID_ARGUMENT
}

#[no_mangle]
/// Creates a device registered under `name`. Returns null for unknown names.
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string.
pub unsafe extern "C" fn nndev_device_create(name: *const c_char) -> *mut NnDeviceHandle {
    if name.is_null() {
        return std::ptr::null_mut();
    }
    let name = match unsafe { CStr::from_ptr(name) }.to_str() {
        Ok(value) => value,
        Err(_) => return std::ptr::null_mut(),
    };
    nndev_backend_ref::register_ref_device();
    match create_device(name) {
        Some(device) => Box::into_raw(Box::new(NnDeviceHandle { device })),
        None => {
            tracing::warn!(device = name, "no device registered under this name");
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
/// Frees a device. Refuses with the live-subgraphs status while any subgraph still
/// holds one of its engines, since those could no longer be postrun.
///
/// # Safety
/// `dev` must be null or a pointer returned by [`nndev_device_create`] that has not
/// been destroyed.
pub unsafe extern "C" fn nndev_device_destroy(dev: *mut NnDeviceHandle) -> c_int {
    let Some(handle) = (unsafe { dev.as_ref() }) else {
        return STATUS_OK;
    };
    let live = handle.device.live_subgraphs();
    if live > 0 {
        tracing::warn!(
            device = handle.device.device_name(),
            live,
            "refusing to destroy device with bound subgraphs"
        );
        return STATUS_LIVE_SUBGRAPHS;
    }
    drop(unsafe { Box::from_raw(dev) });
    STATUS_OK
}

#[no_mangle]
/// Builds a subgraph from a JSON `SubgraphDesc`. Returns null on malformed input.
///
/// # Safety
/// `desc` must be null or point to a descriptor whose `json` is readable for
/// `json_len` bytes.
pub unsafe extern "C" fn nndev_subgraph_create(
    id: u32,
    desc: *const NnSubgraphJson,
) -> *mut NnSubgraphHandle {
    if desc.is_null() {
        return std::ptr::null_mut();
    }
    let desc = unsafe { &*desc };
    if desc.json.is_null() {
        return std::ptr::null_mut();
    }
    let bytes = unsafe { std::slice::from_raw_parts(desc.json as *const u8, desc.json_len) };
    let json_str = match std::str::from_utf8(bytes) {
        Ok(value) => value,
        Err(_) => return std::ptr::null_mut(),
    };
    let desc = match SubgraphDesc::from_json_str(json_str) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(subgraph = id, "malformed subgraph json: {err}");
            return std::ptr::null_mut();
        }
    };
    let subgraph = Subgraph::new(SubgraphId(id), desc);
    Box::into_raw(Box::new(NnSubgraphHandle { subgraph }))
}

#[no_mangle]
/// Frees a subgraph. Refuses while an engine is still bound, since dropping it here
/// would skip the engine's release.
///
/// # Safety
/// `subgraph` must be null or a pointer returned by [`nndev_subgraph_create`] that
/// has not been destroyed.
pub unsafe extern "C" fn nndev_subgraph_destroy(subgraph: *mut NnSubgraphHandle) -> c_int {
    if subgraph.is_null() {
        return STATUS_OK;
    }
    if unsafe { &*subgraph }.subgraph.is_bound() {
        return STATUS_INVALID_ARGUMENT;
    }
    drop(unsafe { Box::from_raw(subgraph) });
    STATUS_OK
}

#[no_mangle]
/// Returns 1 while an engine is bound to the subgraph, 0 otherwise or for null.
///
/// # Safety
/// `subgraph` must be null or a live pointer returned by [`nndev_subgraph_create`].
pub unsafe extern "C" fn nndev_subgraph_is_bound(subgraph: *const NnSubgraphHandle) -> c_int {
    if subgraph.is_null() {
        return 0;
    }
    c_int::from(unsafe { &*subgraph }.subgraph.is_bound())
}

#[no_mangle]
/// # Safety
/// `dev` must be null or a live pointer returned by [`nndev_device_create`].
pub unsafe extern "C" fn nndev_device_init(dev: *mut NnDeviceHandle) -> c_int {
    let Some(handle) = (unsafe { dev.as_ref() }) else {
        return invalid("init", "null device");
    };
    report("init", handle.device.init())
}

#[no_mangle]
/// # Safety
/// `dev` and `subgraph` must be null or live pointers from the matching create calls,
/// and no other thread may use `subgraph` for the duration of the call.
pub unsafe extern "C" fn nndev_device_prerun(
    dev: *mut NnDeviceHandle,
    subgraph: *mut NnSubgraphHandle,
    num_thread: c_int,
    cpu_affinity: c_int,
    mode: c_int,
) -> c_int {
    let (Some(handle), Some(sg)) = (unsafe { dev.as_ref() }, unsafe { subgraph.as_mut() }) else {
        return invalid("prerun", "null device or subgraph");
    };
    let params = PrerunParams::from_raw(num_thread, cpu_affinity, mode);
    report("prerun", handle.device.prerun(&mut sg.subgraph, params))
}

#[no_mangle]
/// # Safety
/// Same contract as [`nndev_device_prerun`].
pub unsafe extern "C" fn nndev_device_run(
    dev: *mut NnDeviceHandle,
    subgraph: *mut NnSubgraphHandle,
) -> c_int {
    let (Some(handle), Some(sg)) = (unsafe { dev.as_ref() }, unsafe { subgraph.as_mut() }) else {
        return invalid("run", "null device or subgraph");
    };
    report("run", handle.device.run(&mut sg.subgraph))
}

#[no_mangle]
/// Engine release failures are logged and do not change the returned status.
///
/// # Safety
/// Same contract as [`nndev_device_prerun`].
pub unsafe extern "C" fn nndev_device_postrun(
    dev: *mut NnDeviceHandle,
    subgraph: *mut NnSubgraphHandle,
) -> c_int {
    let (Some(handle), Some(sg)) = (unsafe { dev.as_ref() }, unsafe { subgraph.as_mut() }) else {
        return invalid("postrun", "null device or subgraph");
    };
    let result = handle
        .device
        .postrun(&mut sg.subgraph)
        .map(|teardown| {
            if let Some(err) = teardown.release_error() {
                tracing::info!(
                    subgraph = %sg.subgraph.id(),
                    code = err.code(),
                    "engine release reported failure"
                );
            }
        });
    report("postrun", result)
}

#[no_mangle]
/// # Safety
/// `dev` must be null or a live pointer returned by [`nndev_device_create`].
pub unsafe extern "C" fn nndev_device_release(dev: *mut NnDeviceHandle) -> c_int {
    let Some(handle) = (unsafe { dev.as_ref() }) else {
        return invalid("release", "null device");
    };
    report("release", handle.device.release())
}

/// Human-readable message for a status returned by this library.
pub fn describe_status(status: c_int) -> &'static str {
    match status {
        STATUS_OK => "ok",
        STATUS_FAILED => "failed",
        STATUS_INVALID_ARGUMENT => "invalid argument",
        STATUS_INVALID_STATE => "device in wrong state",
        STATUS_SLOT_OCCUPIED => "subgraph already prepared",
        STATUS_SLOT_EMPTY => "subgraph not prepared",
        STATUS_FOREIGN_HANDLE => "subgraph prepared by another device",
        STATUS_LIVE_SUBGRAPHS => "device still has prepared subgraphs",
        _ => "engine-specific failure",
    }
}
