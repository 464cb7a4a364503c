//! The entry-point contract between the supervisor and a dynamically loaded artifact.
//!
//! A library artifact exports one static, [`ENTRYPOINT_SYMBOL`], of type
//! [`Entrypoint`]. The symbol name carries the major version and the struct
//! repeats it in `abi_version`, so a library built against another contract
//! fails to load with a contract error instead of being called with the wrong
//! signature.
//!
//! Response bodies are copied out through a host-supplied write callback, so
//! no allocation ever crosses the library boundary.
//!
//! ```ignore
//! use hotswap::contract::{PluginRequest, PluginResponse};
//!
//! fn handle(req: &PluginRequest<'_>) -> PluginResponse {
//!     PluginResponse::new(200, format!("hello from {}\n", req.uri))
//! }
//!
//! hotswap::export_handler!(handle);
//! ```
use std::ffi::c_void;
use std::panic::AssertUnwindSafe;

/// Version of the layout of [`Entrypoint`] and [`RawRequest`].
pub const ABI_VERSION: u32 = 1;

/// NUL-terminated name of the exported [`Entrypoint`] static.
pub const ENTRYPOINT_SYMBOL: &[u8] = b"HOTSWAP_ENTRYPOINT_V1\0";

/// Borrowed request as it crosses the boundary.
#[repr(C)]
pub struct RawRequest {
    pub method: *const u8,
    pub method_len: usize,
    pub uri: *const u8,
    pub uri_len: usize,
    pub body: *const u8,
    pub body_len: usize,
}

/// Appends `len` bytes at `data` to the response body behind `sink`.
pub type WriteFn = unsafe extern "C" fn(sink: *mut c_void, data: *const u8, len: usize);

/// Handles one request, writes the body through `write` and returns the status code.
pub type HandleFn =
    unsafe extern "C" fn(request: *const RawRequest, sink: *mut c_void, write: WriteFn) -> u16;

/// The exported entry point.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Entrypoint {
    pub abi_version: u32,
    pub handle: HandleFn,
}

impl std::fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entrypoint")
            .field("abi_version", &self.abi_version)
            .finish_non_exhaustive()
    }
}

/// A request as seen by handler code.
#[derive(Debug, Clone, Copy)]
pub struct PluginRequest<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub body: &'a [u8],
}

/// What a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl PluginResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

impl RawRequest {
    fn borrow(req: &PluginRequest<'_>) -> Self {
        Self {
            method: req.method.as_ptr(),
            method_len: req.method.len(),
            uri: req.uri.as_ptr(),
            uri_len: req.uri.len(),
            body: req.body.as_ptr(),
            body_len: req.body.len(),
        }
    }

    /// # Safety
    /// Every pointer must be valid for its length for the lifetime `'a`.
    unsafe fn as_request<'a>(&self) -> PluginRequest<'a> {
        unsafe {
            PluginRequest {
                method: std::str::from_utf8(raw_slice(self.method, self.method_len))
                    .unwrap_or(""),
                uri: std::str::from_utf8(raw_slice(self.uri, self.uri_len)).unwrap_or(""),
                body: raw_slice(self.body, self.body_len),
            }
        }
    }
}

unsafe fn raw_slice<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

unsafe extern "C" fn collect_into_vec(sink: *mut c_void, data: *const u8, len: usize) {
    if sink.is_null() {
        return;
    }
    let buf = unsafe { &mut *(sink as *mut Vec<u8>) };
    buf.extend_from_slice(unsafe { raw_slice(data, len) });
}

/// Calls `entry` from the host side.
///
/// # Safety
/// `entry.handle` must point to code that is still mapped, which holds while
/// the library it came from is loaded.
pub(crate) unsafe fn invoke(entry: &Entrypoint, req: &PluginRequest<'_>) -> PluginResponse {
    let raw = RawRequest::borrow(req);
    let mut body: Vec<u8> = Vec::new();
    let status = unsafe {
        (entry.handle)(
            &raw,
            &mut body as *mut Vec<u8> as *mut c_void,
            collect_into_vec,
        )
    };
    PluginResponse { status, body }
}

/// Plugin-side glue used by [`export_handler!`].
///
/// # Safety
/// `request` must be null or point to a valid [`RawRequest`]; `write` must be
/// safe to call with `sink`.
#[doc(hidden)]
pub unsafe fn dispatch<F>(
    request: *const RawRequest,
    sink: *mut c_void,
    write: WriteFn,
    handler: F,
) -> u16
where
    F: Fn(&PluginRequest<'_>) -> PluginResponse,
{
    let Some(raw) = (unsafe { request.as_ref() }) else {
        return 400;
    };
    let req = unsafe { raw.as_request() };
    // Unwinding across extern "C" aborts the host.
    let response = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&req)))
        .unwrap_or_else(|_| PluginResponse::new(500, "handler panicked\n"));
    unsafe { write(sink, response.body.as_ptr(), response.body.len()) };
    response.status
}

/// Exports `handler: fn(&PluginRequest) -> PluginResponse` as the artifact entry point.
#[macro_export]
macro_rules! export_handler {
    ($handler:path) => {
        #[unsafe(no_mangle)]
        pub static HOTSWAP_ENTRYPOINT_V1: $crate::contract::Entrypoint =
            $crate::contract::Entrypoint {
                abi_version: $crate::contract::ABI_VERSION,
                handle: {
                    unsafe extern "C" fn __hotswap_handle(
                        request: *const $crate::contract::RawRequest,
                        sink: *mut ::std::ffi::c_void,
                        write: $crate::contract::WriteFn,
                    ) -> u16 {
                        unsafe { $crate::contract::dispatch(request, sink, write, $handler) }
                    }
                    __hotswap_handle
                },
            };
    };
}
