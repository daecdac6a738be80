//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! The host registers an `FfiScriptHost` vtable once; the pump talks to it
//! through the core `ScriptHost` trait. Callback arguments are passed as a
//! borrowed array of `FfiCallbackArg` that is only valid for the duration of
//! the `invoke` call. String helpers for reading host arguments and writing
//! into host-owned buffers live here to keep `lib.rs` focused on the
//! `extern "C"` surface.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use requests_core::{CallbackArg, CallbackIndex, InstanceId, ScriptHost};

/// Resolve a callback by name. Returns a negative value if it does not exist.
pub type FfiFindCallback =
    extern "C" fn(user_data: *mut c_void, instance: u64, name: *const c_char) -> i32;

/// Invoke a resolved callback with `len` arguments in push order.
pub type FfiInvoke = extern "C" fn(
    user_data: *mut c_void,
    instance: u64,
    callback: i32,
    args: *const FfiCallbackArg,
    len: u32,
) -> i32;

/// The host's callback table, registered with `requests_set_host`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FfiScriptHost {
    pub user_data: *mut c_void,
    pub find_callback: Option<FfiFindCallback>,
    pub invoke: Option<FfiInvoke>,
}

// SAFETY: the table is only ever used from the thread that calls
// `requests_process_tick`; the host owns whatever `user_data` points to.
unsafe impl Send for FfiScriptHost {}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiArgKind {
    Int = 0,
    Bytes = 1,
}

/// One callback argument. For `Bytes`, `data` points to `len` bytes followed
/// by a NUL terminator.
#[repr(C)]
#[derive(Debug)]
pub struct FfiCallbackArg {
    pub kind: FfiArgKind,
    pub int_value: i32,
    pub data: *const c_char,
    pub len: u32,
}

impl ScriptHost for FfiScriptHost {
    fn find_callback(&mut self, instance: InstanceId, name: &str) -> Option<CallbackIndex> {
        let find = self.find_callback?;
        let name = CString::new(name).ok()?;
        let index = find(self.user_data, instance.0, name.as_ptr());
        (index >= 0).then_some(index)
    }

    fn invoke(&mut self, instance: InstanceId, callback: CallbackIndex, args: &[CallbackArg]) -> i32 {
        let Some(invoke) = self.invoke else {
            return 0;
        };
        let buffers: Vec<Vec<u8>> = args
            .iter()
            .map(|arg| match arg {
                CallbackArg::Bytes(bytes) => {
                    let mut buffer = Vec::with_capacity(bytes.len() + 1);
                    buffer.extend_from_slice(bytes);
                    buffer.push(0);
                    buffer
                }
                CallbackArg::Int(_) => Vec::new(),
            })
            .collect();
        let ffi_args: Vec<FfiCallbackArg> = args
            .iter()
            .zip(&buffers)
            .map(|(arg, buffer)| match arg {
                CallbackArg::Int(value) => FfiCallbackArg {
                    kind: FfiArgKind::Int,
                    int_value: *value,
                    data: std::ptr::null(),
                    len: 0,
                },
                CallbackArg::Bytes(bytes) => FfiCallbackArg {
                    kind: FfiArgKind::Bytes,
                    int_value: 0,
                    data: buffer.as_ptr().cast(),
                    len: u32::try_from(bytes.len()).unwrap_or(u32::MAX),
                },
            })
            .collect();
        let len = u32::try_from(ffi_args.len()).unwrap_or(u32::MAX);
        invoke(self.user_data, instance.0, callback, ffi_args.as_ptr(), len)
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Borrow a C string argument. Null or non-UTF-8 input yields `None`.
pub(crate) fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Borrow the raw bytes of a C string argument. Null yields an empty slice.
pub(crate) fn bytes_arg<'a>(ptr: *const c_char) -> &'a [u8] {
    if ptr.is_null() {
        return &[];
    }
    unsafe { CStr::from_ptr(ptr) }.to_bytes()
}

/// Borrow a host array. A null pointer is only accepted for an empty array.
pub(crate) fn slice_arg<'a, T>(ptr: *const T, len: u32) -> Option<&'a [T]> {
    if len == 0 {
        return Some(&[]);
    }
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { std::slice::from_raw_parts(ptr, len as usize) })
}

/// Copy `value` into a host buffer of `capacity` bytes, truncating if needed.
/// The result is always NUL-terminated. Returns false for a null or empty
/// buffer.
pub(crate) fn write_str(value: &str, out: *mut c_char, capacity: u32) -> bool {
    if out.is_null() || capacity == 0 {
        return false;
    }
    let len = value.len().min(capacity as usize - 1);
    unsafe {
        std::ptr::copy_nonoverlapping(value.as_ptr().cast::<c_char>(), out, len);
        *out.add(len) = 0;
    }
    true
}
