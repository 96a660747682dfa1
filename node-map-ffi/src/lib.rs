use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;
use std::sync::Arc;

use node_map::{GrpcCoordinator, Options, Storage};
use serde_json::Value;

type NodeMapHandle = *mut c_void;

#[repr(C)]
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    NullPointer = 1,
    InvalidUtf8 = 2,
    ConnectError = 3,
    CoordinatorError = 4,
    ConflictError = 5,
    DecodeError = 6,
    InternalError = 99,
}

impl From<node_map::Error> for ErrorCode {
    fn from(err: node_map::Error) -> Self {
        if err.is_connectivity() {
            return ErrorCode::ConnectError;
        }
        match err {
            node_map::Error::Coordinator(_) => ErrorCode::CoordinatorError,
            node_map::Error::Conflict(_) => ErrorCode::ConflictError,
            node_map::Error::Decode(_) => ErrorCode::DecodeError,
            _ => ErrorCode::InternalError,
        }
    }
}

struct NodeMapWrapper {
    storage: Storage,
    rt: tokio::runtime::Runtime,
}

fn read_str<'a>(s: *const c_char) -> Result<&'a str, ErrorCode> {
    if s.is_null() {
        return Err(ErrorCode::NullPointer);
    }
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map_err(|_| ErrorCode::InvalidUtf8)
}

fn wrapper<'a>(handle: NodeMapHandle) -> Option<&'a NodeMapWrapper> {
    if handle.is_null() {
        return None;
    }
    Some(unsafe { &*(handle as *const NodeMapWrapper) })
}

/// Connects to the coordination server at `addr` and binds a map to `path`.
#[unsafe(no_mangle)]
pub extern "C" fn nodemap_open(
    addr: *const c_char,
    path: *const c_char,
    handle_out: *mut NodeMapHandle,
) -> ErrorCode {
    if handle_out.is_null() {
        return ErrorCode::NullPointer;
    }
    let addr = match read_str(addr) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let path = match read_str(path) {
        Ok(s) => s.to_string(),
        Err(code) => return code,
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(_) => return ErrorCode::InternalError,
    };
    let storage = rt.block_on(async {
        let zk = GrpcCoordinator::connect(addr).await?;
        Storage::new(Arc::new(zk), path, Options::default()).await
    });

    let storage = match storage {
        Ok(s) => s,
        Err(e) => return ErrorCode::from(e),
    };

    let boxed = Box::new(NodeMapWrapper { storage, rt });
    unsafe { *handle_out = Box::into_raw(boxed) as *mut c_void };

    ErrorCode::Success
}

#[unsafe(no_mangle)]
pub extern "C" fn nodemap_free(handle: NodeMapHandle) -> ErrorCode {
    if handle.is_null() {
        return ErrorCode::NullPointer;
    }

    unsafe {
        let _ = Box::from_raw(handle as *mut NodeMapWrapper);
    }

    ErrorCode::Success
}

/// Writes the cached value for `key` to `value_out`, or null when absent.
/// The returned string must be released with [`nodemap_string_free`].
#[unsafe(no_mangle)]
pub extern "C" fn nodemap_get(
    handle: NodeMapHandle,
    key: *const c_char,
    value_out: *mut *mut c_char,
) -> ErrorCode {
    let Some(wrapper) = wrapper(handle) else {
        return ErrorCode::NullPointer;
    };
    if value_out.is_null() {
        return ErrorCode::NullPointer;
    }
    let key = match read_str(key) {
        Ok(s) => s,
        Err(code) => return code,
    };

    match wrapper.storage.get(key) {
        Some(value) => {
            let c_value = match CString::new(value) {
                Ok(s) => s.into_raw(),
                Err(_) => return ErrorCode::InvalidUtf8,
            };
            unsafe { *value_out = c_value };
        }
        None => unsafe { *value_out = ptr::null_mut() },
    }
    ErrorCode::Success
}

#[unsafe(no_mangle)]
pub extern "C" fn nodemap_set(
    handle: NodeMapHandle,
    key: *const c_char,
    value: *const c_char,
) -> ErrorCode {
    let Some(wrapper) = wrapper(handle) else {
        return ErrorCode::NullPointer;
    };
    let (key, value) = match (read_str(key), read_str(value)) {
        (Ok(k), Ok(v)) => (k.to_string(), v.to_string()),
        (Err(code), _) | (_, Err(code)) => return code,
    };

    let map = wrapper.storage.hashtable();
    let result = wrapper.rt.block_on(map.try_update(|m| {
        m.insert(key.clone(), Value::String(value.clone()))
    }));

    match result {
        Ok(_) => ErrorCode::Success,
        Err(e) => ErrorCode::from(e),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn nodemap_delete(handle: NodeMapHandle, key: *const c_char) -> ErrorCode {
    let Some(wrapper) = wrapper(handle) else {
        return ErrorCode::NullPointer;
    };
    let key = match read_str(key) {
        Ok(s) => s,
        Err(code) => return code,
    };

    let map = wrapper.storage.hashtable();
    match wrapper.rt.block_on(map.try_update(|m| m.remove(key))) {
        Ok(_) => ErrorCode::Success,
        Err(e) => ErrorCode::from(e),
    }
}

/// 1 if `key` is in the cache, 0 otherwise or on bad arguments.
#[unsafe(no_mangle)]
pub extern "C" fn nodemap_has_key(handle: NodeMapHandle, key: *const c_char) -> i32 {
    let Some(wrapper) = wrapper(handle) else {
        return 0;
    };
    match read_str(key) {
        Ok(key) if wrapper.storage.hashtable().has_key(key) => 1,
        _ => 0,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn nodemap_len(handle: NodeMapHandle) -> usize {
    match wrapper(handle) {
        Some(wrapper) => wrapper.storage.hashtable().len(),
        None => 0,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn nodemap_string_free(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            let _ = CString::from_raw(s);
        }
    }
}
