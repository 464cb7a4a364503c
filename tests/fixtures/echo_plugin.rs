//! Library artifact used by the library backend tests.
//!
//! Built on the fly as a cdylib with plain `rustc`, so it spells out the entry
//! point layout itself instead of linking against hotswap. Answers every
//! request with `<FIXTURE_REPLY> <uri>`. `--cfg abi_v2` exports the same
//! symbol with an ABI version the host does not speak.
use std::ffi::c_void;

#[allow(dead_code)]
#[repr(C)]
pub struct RawRequest {
    method: *const u8,
    method_len: usize,
    uri: *const u8,
    uri_len: usize,
    body: *const u8,
    body_len: usize,
}

type WriteFn = unsafe extern "C" fn(sink: *mut c_void, data: *const u8, len: usize);

#[repr(C)]
pub struct Entrypoint {
    abi_version: u32,
    handle: unsafe extern "C" fn(*const RawRequest, *mut c_void, WriteFn) -> u16,
}

#[cfg(not(abi_v2))]
const ABI_VERSION: u32 = 1;
#[cfg(abi_v2)]
const ABI_VERSION: u32 = 2;

const REPLY: &str = match option_env!("FIXTURE_REPLY") {
    Some(reply) => reply,
    None => "plugin",
};

unsafe extern "C" fn handle(request: *const RawRequest, sink: *mut c_void, write: WriteFn) -> u16 {
    let Some(request) = (unsafe { request.as_ref() }) else {
        return 400;
    };
    let uri: &[u8] = if request.uri.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(request.uri, request.uri_len) }
    };
    unsafe {
        write(sink, REPLY.as_ptr(), REPLY.len());
        write(sink, b" ".as_ptr(), 1);
        write(sink, uri.as_ptr(), uri.len());
        write(sink, b"\n".as_ptr(), 1);
    }
    200
}

#[unsafe(no_mangle)]
pub static HOTSWAP_ENTRYPOINT_V1: Entrypoint = Entrypoint {
    abi_version: ABI_VERSION,
    handle,
};
