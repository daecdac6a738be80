//! C-ABI surface of the request bridge.
//!
//! # Overview
//! Exposes every bridge operation through `extern "C"` functions taking only
//! integers, floats and C strings, so a scripting host with nothing but a
//! fixed-signature native call mechanism can issue HTTP and WebSocket
//! operations and build or inspect JSON values.
//!
//! # Design
//! - One process-wide `Bridge`, created by `requests_init` and dropped by
//!   `requests_shutdown`. Calls made before `requests_init` fail with the
//!   operation's error code.
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Handles and request ids are returned directly; negative values are
//!   errors. JSON operations return a status code and write results through
//!   out-pointers or into caller-owned string buffers.
//! - For status-returning JSON operations, a null or non-UTF-8 string
//!   argument is reported as code 1.
//! - Results reach the host from `requests_process_tick`, which invokes the
//!   callbacks registered with `requests_set_host`.

pub mod types;

use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Once, PoisonError, RwLock};

use requests_core::{
    Bridge, BridgeConfig, BridgeError, ExecutionMode, Handle, InstanceId, JsonArena, JsonError, PayloadKind,
    RequestTarget,
};
use tracing_subscriber::EnvFilter;

use types::*;

static BRIDGE: RwLock<Option<Arc<Bridge>>> = RwLock::new(None);
static HOST: Mutex<Option<FfiScriptHost>> = Mutex::new(None);

/// Returned by `requests_init` when the bridge itself panicked.
const INIT_PANIC: i32 = -3;
/// Status code for a rejected JSON argument.
const BAD_ARGUMENT: i32 = 1;

fn install_logging() {
    static LOGGING: Once = Once::new();
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed by the embedding process.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn current_bridge() -> Option<Arc<Bridge>> {
    BRIDGE.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Run `body` against the live bridge. Returns `fallback` if the bridge is
/// not initialized or `body` panics.
fn with_bridge<R: Copy>(fallback: R, body: impl FnOnce(&Bridge) -> R) -> R {
    catch_unwind(AssertUnwindSafe(|| match current_bridge() {
        Some(bridge) => body(&bridge),
        None => {
            tracing::warn!("bridge is not initialized");
            fallback
        }
    }))
    .unwrap_or_else(|_| {
        tracing::error!("panic caught at FFI boundary");
        fallback
    })
}

fn with_json<R: Copy>(fallback: R, body: impl FnOnce(&mut JsonArena) -> R) -> R {
    with_bridge(fallback, |bridge| body(&mut bridge.json()))
}

fn handle_or_code(result: Result<Handle, BridgeError>) -> i32 {
    result.unwrap_or_else(|e| e.code())
}

fn status_or_code(result: Result<(), BridgeError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

fn json_code(error: JsonError) -> i32 {
    tracing::debug!(error = %error, "json operation failed");
    error.code()
}

fn json_status(result: Result<(), JsonError>) -> i32 {
    result.map_or_else(json_code, |()| 0)
}

fn json_handle(result: Result<Handle, JsonError>) -> i32 {
    result.unwrap_or_else(|e| {
        tracing::debug!(error = %e, "json constructor failed");
        e.handle_code()
    })
}

/// Read a value out of the arena into `out`.
fn read_into<T>(out: *mut T, read: impl FnOnce(&mut JsonArena) -> Result<T, i32>) -> i32 {
    if out.is_null() {
        return BAD_ARGUMENT;
    }
    with_json(BAD_ARGUMENT, |json| match read(json) {
        Ok(value) => {
            unsafe { out.write(value) };
            0
        }
        Err(code) => code,
    })
}

/// Read a string out of the arena into a caller buffer of `capacity` bytes.
fn read_string(out: *mut c_char, capacity: u32, read: impl FnOnce(&mut JsonArena) -> Result<String, i32>) -> i32 {
    if out.is_null() || capacity == 0 {
        return BAD_ARGUMENT;
    }
    with_json(BAD_ARGUMENT, |json| match read(json) {
        Ok(value) => {
            write_str(&value, out, capacity);
            0
        }
        Err(code) => code,
    })
}

/// Node getters report every failure as code 1.
fn node_code(error: JsonError) -> i32 {
    json_code(error);
    1
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create the process-wide bridge.
///
/// `config_json` may be null or empty for defaults; `REQUESTS_*` environment
/// variables override it. Returns 0 on success (including when already
/// initialized), -1 for an invalid configuration, or -2 if the worker pool
/// could not start.
#[unsafe(no_mangle)]
pub extern "C" fn requests_init(config_json: *const c_char) -> i32 {
    catch_unwind(|| {
        install_logging();
        let mut slot = BRIDGE.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            tracing::debug!("bridge already initialized");
            return 0;
        }
        let text = if config_json.is_null() {
            ""
        } else {
            match str_arg(config_json) {
                Some(text) => text,
                None => {
                    tracing::error!("configuration is not valid UTF-8");
                    return -1;
                }
            }
        };
        let config = match BridgeConfig::from_json(text) {
            Ok(config) => config.from_env(),
            Err(e) => {
                tracing::error!(error = %e, "invalid bridge configuration");
                return -1;
            }
        };
        match Bridge::new(config) {
            Ok(bridge) => {
                *slot = Some(Arc::new(bridge));
                0
            }
            Err(e) => {
                tracing::error!(error = %e, "bridge failed to start");
                e.code()
            }
        }
    })
    .unwrap_or(INIT_PANIC)
}

/// Stop the worker pool, close every WebSocket and drop the bridge. Every
/// handle issued so far becomes invalid. Safe to call when not initialized.
#[unsafe(no_mangle)]
pub extern "C" fn requests_shutdown() {
    let _ = catch_unwind(|| {
        let bridge = BRIDGE.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(bridge) = bridge {
            bridge.shutdown();
        }
    });
}

/// Register the host's callback table. Returns -1 if either function
/// pointer is null.
#[unsafe(no_mangle)]
pub extern "C" fn requests_set_host(host: FfiScriptHost) -> i32 {
    if host.find_callback.is_none() || host.invoke.is_none() {
        tracing::error!("host table is missing a callback function");
        return -1;
    }
    *HOST.lock().unwrap_or_else(PoisonError::into_inner) = Some(host);
    0
}

/// Mark a script instance as loaded; responses addressed to it are delivered.
#[unsafe(no_mangle)]
pub extern "C" fn requests_load_instance(instance: u64) {
    with_bridge((), |bridge| bridge.load_instance(InstanceId(instance)));
}

/// Mark a script instance as unloaded; pending responses for it are dropped.
#[unsafe(no_mangle)]
pub extern "C" fn requests_unload_instance(instance: u64) {
    with_bridge((), |bridge| bridge.unload_instance(InstanceId(instance)));
}

/// Deliver completed responses to the host. Call once per host tick.
///
/// Returns the number of callbacks invoked, or -1 if the bridge or the host
/// table is missing.
#[unsafe(no_mangle)]
pub extern "C" fn requests_process_tick() -> i32 {
    let host = *HOST.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(mut host) = host else {
        tracing::warn!("process tick without a registered host");
        return -1;
    };
    with_bridge(-1, |bridge| {
        let report = bridge.process_tick(&mut host);
        i32::try_from(report.delivered).unwrap_or(i32::MAX)
    })
}

// ---------------------------------------------------------------------------
// Header sets and clients
// ---------------------------------------------------------------------------

/// Create a header set from `len` strings alternating name and value.
/// Returns the handle, or -1 for a null string or an odd count.
#[unsafe(no_mangle)]
pub extern "C" fn requests_headers(pairs: *const *const c_char, len: u32) -> i32 {
    with_bridge(-1, |bridge| {
        let Some(strings) = slice_arg(pairs, len) else {
            tracing::error!(len, "header list pointer is null");
            return -1;
        };
        if strings.len() % 2 != 0 {
            tracing::error!(len, "header list has a name without a value");
            return -1;
        }
        let mut headers = Vec::with_capacity(strings.len() / 2);
        for pair in strings.chunks_exact(2) {
            let (Some(name), Some(value)) = (str_arg(pair[0]), str_arg(pair[1])) else {
                tracing::error!("header name or value is not a valid string");
                return -1;
            };
            headers.push((name.to_string(), value.to_string()));
        }
        bridge.create_header_set(headers)
    })
}

/// Release a header set. Clients created from it keep their copy.
#[unsafe(no_mangle)]
pub extern "C" fn requests_release_headers(headers: i32) -> i32 {
    with_bridge(-1, |bridge| if bridge.release_header_set(headers) { 0 } else { -1 })
}

/// Create a client for `endpoint` with the default headers in `headers`
/// (an unknown handle means none). Returns the handle or -1.
#[unsafe(no_mangle)]
pub extern "C" fn requests_client(endpoint: *const c_char, headers: i32) -> i32 {
    with_bridge(-1, |bridge| {
        let Some(endpoint) = str_arg(endpoint) else {
            tracing::error!("client endpoint is not a valid string");
            return -1;
        };
        handle_or_code(bridge.create_client(endpoint, headers))
    })
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

struct RequestArgs {
    instance: u64,
    client: i32,
    path: *const c_char,
    method: i32,
    callback: *const c_char,
    headers: i32,
}

impl RequestArgs {
    fn target(&self) -> Option<RequestTarget<'_>> {
        Some(RequestTarget {
            instance: InstanceId(self.instance),
            client: self.client,
            path: str_arg(self.path)?,
            method: self.method,
            callback: str_arg(self.callback)?,
            header_set: self.headers,
        })
    }
}

fn request_string(args: RequestArgs, body: *const c_char, mode: ExecutionMode) -> i32 {
    with_bridge(-1, |bridge| {
        let Some(target) = args.target() else {
            tracing::error!("request path or callback is not a valid string");
            return -1;
        };
        handle_or_code(bridge.request(target, bytes_arg(body), mode))
    })
}

fn request_json(args: RequestArgs, node: i32, mode: ExecutionMode) -> i32 {
    with_bridge(-1, |bridge| {
        let Some(target) = args.target() else {
            tracing::error!("request path or callback is not a valid string");
            return -1;
        };
        handle_or_code(bridge.request_json(target, node, mode))
    })
}

/// Issue a request with a string body (null for none) on a worker thread.
///
/// `method` is 0..=8 for GET, HEAD, POST, PUT, DELETE, CONNECT, OPTIONS,
/// TRACE, PATCH. The response is delivered to `callback` on a later tick as
/// `(requestId, status, body[], length)`. Returns the request id, -1 for an
/// unknown client, -2 if the worker pool is gone, or -3 for a bad method.
#[unsafe(no_mangle)]
pub extern "C" fn requests_request(
    instance: u64,
    client: i32,
    path: *const c_char,
    method: i32,
    callback: *const c_char,
    body: *const c_char,
    headers: i32,
) -> i32 {
    let args = RequestArgs { instance, client, path, method, callback, headers };
    request_string(args, body, ExecutionMode::Background)
}

/// Like `requests_request`, with the JSON node `node` as body. The node is
/// consumed. The response is delivered as `(requestId, status, node)`;
/// returns -4 if `node` is invalid.
#[unsafe(no_mangle)]
pub extern "C" fn requests_request_json(
    instance: u64,
    client: i32,
    path: *const c_char,
    method: i32,
    callback: *const c_char,
    node: i32,
    headers: i32,
) -> i32 {
    let args = RequestArgs { instance, client, path, method, callback, headers };
    request_json(args, node, ExecutionMode::Background)
}

/// `requests_request`, executed on the calling thread. The response is still
/// delivered through the next tick.
#[unsafe(no_mangle)]
pub extern "C" fn requests_request_sync(
    instance: u64,
    client: i32,
    path: *const c_char,
    method: i32,
    callback: *const c_char,
    body: *const c_char,
    headers: i32,
) -> i32 {
    let args = RequestArgs { instance, client, path, method, callback, headers };
    request_string(args, body, ExecutionMode::Inline)
}

/// `requests_request_json`, executed on the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn requests_request_json_sync(
    instance: u64,
    client: i32,
    path: *const c_char,
    method: i32,
    callback: *const c_char,
    node: i32,
    headers: i32,
) -> i32 {
    let args = RequestArgs { instance, client, path, method, callback, headers };
    request_json(args, node, ExecutionMode::Inline)
}

// ---------------------------------------------------------------------------
// WebSockets
// ---------------------------------------------------------------------------

fn ws_connect(instance: u64, address: *const c_char, callback: *const c_char, kind: PayloadKind) -> i32 {
    with_bridge(-1, |bridge| {
        let (Some(address), Some(callback)) = (str_arg(address), str_arg(callback)) else {
            tracing::error!("websocket address or callback is not a valid string");
            return -1;
        };
        handle_or_code(bridge.connect(InstanceId(instance), address, callback, kind))
    })
}

/// Open a text WebSocket session. Blocks until the handshake completes.
/// Messages are delivered as `(sessionId, body[], length)`. Returns the
/// session handle or -1.
#[unsafe(no_mangle)]
pub extern "C" fn requests_ws_connect(instance: u64, address: *const c_char, callback: *const c_char) -> i32 {
    ws_connect(instance, address, callback, PayloadKind::Text)
}

/// Open a JSON WebSocket session. Messages are delivered as
/// `(sessionId, node)`.
#[unsafe(no_mangle)]
pub extern "C" fn requests_ws_connect_json(instance: u64, address: *const c_char, callback: *const c_char) -> i32 {
    ws_connect(instance, address, callback, PayloadKind::Json)
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_ws_send(session: i32, payload: *const c_char) -> i32 {
    with_bridge(-1, |bridge| {
        let Some(payload) = str_arg(payload) else {
            tracing::error!(session, "websocket payload is not a valid string");
            return -1;
        };
        status_or_code(bridge.ws_send(session, payload))
    })
}

/// Send the serialized JSON node `node`, consuming it.
#[unsafe(no_mangle)]
pub extern "C" fn requests_ws_send_json(session: i32, node: i32) -> i32 {
    with_bridge(-1, |bridge| status_or_code(bridge.ws_send_json(session, node)))
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_ws_close(session: i32) -> i32 {
    with_bridge(-1, |bridge| status_or_code(bridge.ws_close(session)))
}

/// 0 connecting, 1 open, 2 closed, -1 unknown session.
#[unsafe(no_mangle)]
pub extern "C" fn requests_ws_state(session: i32) -> i32 {
    with_bridge(-1, |bridge| match bridge.ws_state(session) {
        Ok(state) => state as i32,
        Err(e) => e.code(),
    })
}

// ---------------------------------------------------------------------------
// JSON: parsing and construction
// ---------------------------------------------------------------------------

/// Parse `text` into a new node written to `out`. Returns 0, or 1 if the
/// text is not valid JSON.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_parse(text: *const c_char, out: *mut i32) -> i32 {
    read_into(out, |json| {
        let text = str_arg(text).ok_or(BAD_ARGUMENT)?;
        json.parse(text).map_err(json_code)
    })
}

/// Serialize a node into `out` without consuming it.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_stringify(node: i32, out: *mut c_char, capacity: u32) -> i32 {
    read_string(out, capacity, |json| json.stringify(node).map_err(json_code))
}

/// Number=0 Boolean=1 String=2 Object=3 Array=4 Null=5, or -1.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_node_type(node: i32) -> i32 {
    with_json(-1, |json| match json.node_type(node) {
        Ok(kind) => kind.code(),
        Err(e) => {
            json_code(e);
            -1
        }
    })
}

/// Build an object from `len` keys and child nodes. Children are consumed.
/// Returns the node, -1 for an empty or null key, or -2 for a bad child.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_object(keys: *const *const c_char, nodes: *const i32, len: u32) -> i32 {
    with_json(-1, |json| {
        let (Some(keys), Some(nodes)) = (slice_arg(keys, len), slice_arg(nodes, len)) else {
            tracing::error!(len, "object keys or nodes pointer is null");
            return -1;
        };
        let mut fields = Vec::with_capacity(keys.len());
        for (&key, &node) in keys.iter().zip(nodes) {
            let Some(key) = str_arg(key) else {
                tracing::error!("object key is not a valid string");
                return -1;
            };
            fields.push((key.to_string(), node));
        }
        json_handle(json.object(&fields))
    })
}

/// Build an array from `len` child nodes, consuming them. Returns -2 for a
/// bad child.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_array(nodes: *const i32, len: u32) -> i32 {
    with_json(-1, |json| match slice_arg(nodes, len) {
        Some(nodes) => json_handle(json.array(nodes)),
        None => {
            tracing::error!(len, "array nodes pointer is null");
            -1
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_int(value: i32) -> i32 {
    with_json(-1, |json| json.int(value))
}

/// Returns -1 for NaN or infinity.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_float(value: f32) -> i32 {
    with_json(-1, |json| json_handle(json.float(value)))
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_bool(value: bool) -> i32 {
    with_json(-1, |json| json.bool(value))
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_string(value: *const c_char) -> i32 {
    with_json(-1, |json| match str_arg(value) {
        Some(value) => json.string(value),
        None => {
            tracing::error!("string value is not a valid string");
            -1
        }
    })
}

/// Concatenate two objects or two arrays. `left` is kept, `right` is
/// consumed. Returns the new node or -1.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_append(left: i32, right: i32) -> i32 {
    with_json(-1, |json| {
        json.append(left, right).unwrap_or_else(|e| {
            json_code(e);
            -1
        })
    })
}

// ---------------------------------------------------------------------------
// JSON: setters
// ---------------------------------------------------------------------------

/// Setters return 0, 1 for an invalid node, 2 if the node is not an object,
/// or 3 for an invalid value.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_set_object(node: i32, key: *const c_char, value: i32) -> i32 {
    with_json(BAD_ARGUMENT, |json| match str_arg(key) {
        Some(key) => json_status(json.set_object(node, key, value)),
        None => BAD_ARGUMENT,
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_set_int(node: i32, key: *const c_char, value: i32) -> i32 {
    with_json(BAD_ARGUMENT, |json| match str_arg(key) {
        Some(key) => json_status(json.set_int(node, key, value)),
        None => BAD_ARGUMENT,
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_set_float(node: i32, key: *const c_char, value: f32) -> i32 {
    with_json(BAD_ARGUMENT, |json| match str_arg(key) {
        Some(key) => json_status(json.set_float(node, key, value)),
        None => BAD_ARGUMENT,
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_set_bool(node: i32, key: *const c_char, value: bool) -> i32 {
    with_json(BAD_ARGUMENT, |json| match str_arg(key) {
        Some(key) => json_status(json.set_bool(node, key, value)),
        None => BAD_ARGUMENT,
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_set_string(node: i32, key: *const c_char, value: *const c_char) -> i32 {
    with_json(BAD_ARGUMENT, |json| match (str_arg(key), str_arg(value)) {
        (Some(key), Some(value)) => json_status(json.set_string(node, key, value)),
        (Some(_), None) => 3,
        (None, _) => BAD_ARGUMENT,
    })
}

// ---------------------------------------------------------------------------
// JSON: field getters
// ---------------------------------------------------------------------------

/// Field getters return 0, 1 for an invalid node, 2 for a missing key, or 3
/// for a value of the wrong type. This one consumes `node`.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_object(node: i32, key: *const c_char, out: *mut i32) -> i32 {
    read_into(out, |json| {
        let key = str_arg(key).ok_or(BAD_ARGUMENT)?;
        json.get_object(node, key).map_err(json_code)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_int(node: i32, key: *const c_char, out: *mut i32) -> i32 {
    read_into(out, |json| {
        let key = str_arg(key).ok_or(BAD_ARGUMENT)?;
        json.get_int(node, key).map_err(json_code)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_float(node: i32, key: *const c_char, out: *mut f32) -> i32 {
    read_into(out, |json| {
        let key = str_arg(key).ok_or(BAD_ARGUMENT)?;
        json.get_float(node, key).map_err(json_code)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_bool(node: i32, key: *const c_char, out: *mut bool) -> i32 {
    read_into(out, |json| {
        let key = str_arg(key).ok_or(BAD_ARGUMENT)?;
        json.get_bool(node, key).map_err(json_code)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_string(node: i32, key: *const c_char, out: *mut c_char, capacity: u32) -> i32 {
    read_string(out, capacity, |json| {
        let key = str_arg(key).ok_or(BAD_ARGUMENT)?;
        json.get_string(node, key).map_err(json_code)
    })
}

/// Copy the array at `key` into a new node written to `out`.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_array(node: i32, key: *const c_char, out: *mut i32) -> i32 {
    read_into(out, |json| {
        let key = str_arg(key).ok_or(BAD_ARGUMENT)?;
        json.get_array(node, key).map_err(json_code)
    })
}

// ---------------------------------------------------------------------------
// JSON: arrays and node getters
// ---------------------------------------------------------------------------

/// Returns 0, or 1 if `node` is invalid or not an array.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_array_length(node: i32, out: *mut i32) -> i32 {
    read_into(out, |json| {
        let len = json.array_length(node).map_err(json_code)?;
        Ok(i32::try_from(len).unwrap_or(i32::MAX))
    })
}

/// Copy element `index` into a new node. Returns 2 if out of range.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_array_object(node: i32, index: i32, out: *mut i32) -> i32 {
    read_into(out, |json| json.array_object(node, index).map_err(json_code))
}

/// Node getters consume `node` and return 1 if it is invalid or holds a
/// different type.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_node_int(node: i32, out: *mut i32) -> i32 {
    read_into(out, |json| json.get_node_int(node).map_err(node_code))
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_node_float(node: i32, out: *mut f32) -> i32 {
    read_into(out, |json| json.get_node_float(node).map_err(node_code))
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_node_bool(node: i32, out: *mut bool) -> i32 {
    read_into(out, |json| json.get_node_bool(node).map_err(node_code))
}

#[unsafe(no_mangle)]
pub extern "C" fn requests_json_get_node_string(node: i32, out: *mut c_char, capacity: u32) -> i32 {
    read_string(out, capacity, |json| json.get_node_string(node).map_err(node_code))
}

// ---------------------------------------------------------------------------
// JSON: lifetime
// ---------------------------------------------------------------------------

/// `auto = true` restores release-on-read, `false` makes the node persistent.
/// Returns 1 for an unknown node.
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_toggle_gc(node: i32, auto: bool) -> i32 {
    with_json(BAD_ARGUMENT, |json| json_status(json.toggle_gc(node, auto)))
}

/// Release a node. With `auto` set, unknown nodes are not logged and
/// persistent nodes are left alone (returns 2).
#[unsafe(no_mangle)]
pub extern "C" fn requests_json_cleanup(node: i32, auto: bool) -> i32 {
    with_json(BAD_ARGUMENT, |json| match json.cleanup(node, auto) {
        Ok(()) => 0,
        Err(e) => e.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::ffi::{c_void, CStr, CString};
    use std::os::raw::c_char;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use crate::types::{FfiArgKind, FfiCallbackArg, FfiScriptHost};

    /// The bridge is process-global; tests touching it run one at a time.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn fresh_bridge() -> MutexGuard<'static, ()> {
        let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        requests_shutdown();
        assert_eq!(requests_init(std::ptr::null()), 0);
        guard
    }

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn start_mock_server() -> String {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        std_listener.set_nonblocking(true).unwrap();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
                mock_server::run(listener).await
            })
            .unwrap();
        });
        format!("http://{addr}")
    }

    /// A host that records every invocation and reads JSON nodes back
    /// through the FFI while the callback runs.
    #[derive(Default)]
    struct Recorder {
        names: HashMap<String, i32>,
        calls: Vec<(String, Vec<Arg>)>,
        json_x: Option<i32>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Arg {
        Int(i32),
        Bytes(String),
    }

    extern "C" fn find(user_data: *mut c_void, _instance: u64, name: *const c_char) -> i32 {
        let recorder = unsafe { &*(user_data as *const Recorder) };
        let name = unsafe { CStr::from_ptr(name) }.to_str().unwrap();
        recorder.names.get(name).copied().unwrap_or(-1)
    }

    extern "C" fn invoke(user_data: *mut c_void, _instance: u64, callback: i32, args: *const FfiCallbackArg, len: u32) -> i32 {
        let recorder = unsafe { &mut *(user_data as *mut Recorder) };
        let args = unsafe { std::slice::from_raw_parts(args, len as usize) };
        let args: Vec<Arg> = args
            .iter()
            .map(|arg| match arg.kind {
                FfiArgKind::Int => Arg::Int(arg.int_value),
                FfiArgKind::Bytes => Arg::Bytes(unsafe { CStr::from_ptr(arg.data) }.to_str().unwrap().to_string()),
            })
            .collect();
        let name = recorder
            .names
            .iter()
            .find(|(_, idx)| **idx == callback)
            .map(|(name, _)| name.clone())
            .unwrap();
        if name == "OnJson" {
            if let Arg::Int(node) = args[0] {
                let mut x = 0;
                let key = c("x");
                if requests_json_get_int(node, key.as_ptr(), &mut x) == 0 {
                    recorder.json_x = Some(x);
                }
            }
        }
        recorder.calls.push((name, args));
        0
    }

    fn register(recorder: *mut Recorder) {
        let host = FfiScriptHost {
            user_data: recorder.cast(),
            find_callback: Some(find),
            invoke: Some(invoke),
        };
        assert_eq!(requests_set_host(host), 0);
    }

    #[test]
    fn calls_before_init_fail() {
        let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        requests_shutdown();
        assert_eq!(requests_json_int(1), -1);
        assert_eq!(requests_headers(std::ptr::null(), 0), -1);
        assert_eq!(requests_ws_state(0), -1);
        let mut out = 0;
        assert_eq!(requests_json_get_node_int(0, &mut out), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        requests_shutdown();
        let config = c("{ not json");
        assert_eq!(requests_init(config.as_ptr()), -1);
        let config = c(r#"{"max_workers": 4, "delivery_order": "fifo"}"#);
        assert_eq!(requests_init(config.as_ptr()), 0);
        assert_eq!(requests_init(std::ptr::null()), 0);
        requests_shutdown();
    }

    #[test]
    fn set_host_requires_both_functions() {
        let host = FfiScriptHost {
            user_data: std::ptr::null_mut(),
            find_callback: None,
            invoke: Some(invoke),
        };
        assert_eq!(requests_set_host(host), -1);
    }

    #[test]
    fn header_and_client_handles() {
        let _guard = fresh_bridge();
        let strings = [c("Authorization"), c("token"), c("X-Trace"), c("1")];
        let ptrs: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        let headers = requests_headers(ptrs.as_ptr(), 4);
        assert!(headers >= 0);
        assert_eq!(requests_headers(ptrs.as_ptr(), 3), -1);

        let endpoint = c("http://127.0.0.1:9");
        let client = requests_client(endpoint.as_ptr(), headers);
        assert!(client >= 0);
        assert_eq!(requests_release_headers(headers), 0);
        assert_eq!(requests_release_headers(headers), -1);

        let bad = c("::not a url::");
        assert_eq!(requests_client(bad.as_ptr(), -1), -1);
        assert_eq!(requests_client(std::ptr::null(), -1), -1);
    }

    #[test]
    fn request_argument_errors() {
        let _guard = fresh_bridge();
        let endpoint = c("http://127.0.0.1:9");
        let client = requests_client(endpoint.as_ptr(), -1);
        let path = c("/");
        let callback = c("OnOK");

        assert_eq!(requests_request(1, client + 100, path.as_ptr(), 0, callback.as_ptr(), std::ptr::null(), -1), -1);
        assert_eq!(requests_request(1, client, path.as_ptr(), 42, callback.as_ptr(), std::ptr::null(), -1), -3);
        assert_eq!(requests_request(1, client, std::ptr::null(), 0, callback.as_ptr(), std::ptr::null(), -1), -1);
        assert_eq!(requests_request_json(1, client, path.as_ptr(), 2, callback.as_ptr(), 999, -1), -4);
    }

    #[test]
    fn json_build_and_read_back() {
        let _guard = fresh_bridge();
        let keys = [c("name"), c("count"), c("ok")];
        let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
        let name = c("widget");
        let nodes = [requests_json_string(name.as_ptr()), requests_json_int(3), requests_json_bool(true)];
        let object = requests_json_object(key_ptrs.as_ptr(), nodes.as_ptr(), 3);
        assert!(object >= 0);
        assert_eq!(requests_json_node_type(object), 3);

        let mut buffer = [0 as c_char; 64];
        assert_eq!(requests_json_stringify(object, buffer.as_mut_ptr(), 64), 0);
        let text = unsafe { CStr::from_ptr(buffer.as_ptr()) }.to_str().unwrap();
        assert_eq!(text, r#"{"name":"widget","count":3,"ok":true}"#);

        let mut count = 0;
        assert_eq!(requests_json_get_int(object, keys[1].as_ptr(), &mut count), 0);
        assert_eq!(count, 3);
        let missing = c("missing");
        assert_eq!(requests_json_get_int(object, missing.as_ptr(), &mut count), 2);
        assert_eq!(requests_json_get_int(object, keys[0].as_ptr(), &mut count), 3);
        assert_eq!(requests_json_set_float(object, missing.as_ptr(), 1.5), 0);
        let mut value = 0.0f32;
        assert_eq!(requests_json_get_float(object, missing.as_ptr(), &mut value), 0);
        assert_eq!(value, 1.5);

        assert_eq!(requests_json_cleanup(object, false), 0);
        assert_eq!(requests_json_node_type(object), -1);
        assert_eq!(requests_json_cleanup(object, true), 1);
    }

    #[test]
    fn json_arrays_and_node_getters() {
        let _guard = fresh_bridge();
        let text = c(r#"[10, "b", 2.5]"#);
        let mut array = -1;
        assert_eq!(requests_json_parse(text.as_ptr(), &mut array), 0);
        let mut len = 0;
        assert_eq!(requests_json_array_length(array, &mut len), 0);
        assert_eq!(len, 3);

        let mut element = -1;
        assert_eq!(requests_json_array_object(array, 0, &mut element), 0);
        let mut value = 0;
        assert_eq!(requests_json_get_node_int(element, &mut value), 0);
        assert_eq!(value, 10);
        assert_eq!(requests_json_get_node_int(element, &mut value), 1);

        assert_eq!(requests_json_array_object(array, 1, &mut element), 0);
        assert_eq!(requests_json_get_node_int(element, &mut value), 1);

        assert_eq!(requests_json_array_object(array, 3, &mut element), 2);
        let bad = c("{oops");
        assert_eq!(requests_json_parse(bad.as_ptr(), &mut array), 1);
        assert_eq!(requests_json_float(f32::NAN), -1);
    }

    #[test]
    fn json_persistence_controls_cleanup() {
        let _guard = fresh_bridge();
        let node = requests_json_int(7);
        assert_eq!(requests_json_toggle_gc(node, false), 0);
        assert_eq!(requests_json_cleanup(node, true), 2);
        let mut value = 0;
        assert_eq!(requests_json_get_node_int(node, &mut value), 0);
        assert_eq!(requests_json_get_node_int(node, &mut value), 0);
        assert_eq!(requests_json_cleanup(node, false), 0);
        assert_eq!(requests_json_toggle_gc(node, true), 1);
    }

    #[test]
    fn json_append_consumes_right_only() {
        let _guard = fresh_bridge();
        let (a, b) = (c("[1]"), c("[2]"));
        let (mut left, mut right) = (-1, -1);
        requests_json_parse(a.as_ptr(), &mut left);
        requests_json_parse(b.as_ptr(), &mut right);
        let joined = requests_json_append(left, right);
        assert!(joined >= 0);
        assert_eq!(requests_json_node_type(left), 4);
        assert_eq!(requests_json_node_type(right), -1);

        let object = c("{}");
        let mut obj = -1;
        requests_json_parse(object.as_ptr(), &mut obj);
        assert_eq!(requests_json_append(joined, obj), -1);
    }

    #[test]
    fn tick_delivers_to_registered_host() {
        let _guard = fresh_bridge();
        let base = start_mock_server();
        let endpoint = c(&base);
        let client = requests_client(endpoint.as_ptr(), -1);
        assert!(client >= 0);

        let mut recorder = Recorder::default();
        recorder.names.insert("OnJson".to_string(), 0);
        recorder.names.insert("OnText".to_string(), 1);
        let recorder = Box::into_raw(Box::new(recorder));
        register(recorder);
        requests_load_instance(1);

        let json_path = c("/json");
        let text_path = c("/text");
        let on_json = c("OnJson");
        let on_text = c("OnText");
        let first = requests_request_sync(1, client, json_path.as_ptr(), 0, on_json.as_ptr(), std::ptr::null(), -1);
        let second = requests_request_sync(1, client, text_path.as_ptr(), 0, on_text.as_ptr(), std::ptr::null(), -1);
        assert!(second > first);

        assert_eq!(requests_process_tick(), 2);
        let recorder = unsafe { Box::from_raw(recorder) };
        assert_eq!(recorder.json_x, Some(1));

        let text_call = recorder.calls.iter().find(|(name, _)| name == "OnText").unwrap();
        assert_eq!(
            text_call.1,
            [Arg::Int(5), Arg::Bytes("hello".to_string()), Arg::Int(200), Arg::Int(second)]
        );
        let json_call = recorder.calls.iter().find(|(name, _)| name == "OnJson").unwrap();
        assert_eq!(json_call.1[1..], [Arg::Int(200), Arg::Int(first)]);

        // The node handed to the callback is gone once it returns.
        if let Arg::Int(node) = json_call.1[0] {
            assert_eq!(requests_json_node_type(node), -1);
        }

        requests_unload_instance(1);
        requests_shutdown();
    }

    #[test]
    fn string_body_is_sent_as_raw_bytes() {
        let _guard = fresh_bridge();
        let base = start_mock_server();
        let endpoint = c(&base);
        let client = requests_client(endpoint.as_ptr(), -1);

        let mut recorder = Recorder::default();
        recorder.names.insert("OnEcho".to_string(), 0);
        let recorder = Box::into_raw(Box::new(recorder));
        register(recorder);
        requests_load_instance(1);

        let path = c("/echo");
        let callback = c("OnEcho");
        let body = CString::new(b"ab\xffcd".to_vec()).unwrap();
        let id = requests_request_sync(1, client, path.as_ptr(), 2, callback.as_ptr(), body.as_ptr(), -1);
        assert!(id >= 0);

        assert_eq!(requests_process_tick(), 1);
        let recorder = unsafe { Box::from_raw(recorder) };
        let (_, args) = &recorder.calls[0];
        let Arg::Bytes(echo) = &args[1] else {
            panic!("expected a body argument, got {:?}", args[1]);
        };
        assert!(echo.contains("\"body\":\"ab\u{fffd}cd\""), "{echo}");

        requests_unload_instance(1);
        requests_shutdown();
    }

    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn lines(&self) -> usize {
            self.0.lock().unwrap().iter().filter(|b| **b == b'\n').count()
        }
    }

    #[test]
    fn rejected_arguments_are_logged() {
        let _guard = fresh_bridge();
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let checks: [(&str, Box<dyn Fn() -> i32>); 7] = [
                ("headers", Box::new(|| requests_headers(std::ptr::null(), 2))),
                ("client", Box::new(|| requests_client(std::ptr::null(), -1))),
                ("ws_connect", Box::new(|| requests_ws_connect(1, std::ptr::null(), std::ptr::null()))),
                ("ws_send", Box::new(|| requests_ws_send(0, std::ptr::null()))),
                ("json_string", Box::new(|| requests_json_string(std::ptr::null()))),
                ("json_array", Box::new(|| requests_json_array(std::ptr::null(), 3))),
                ("node_type", Box::new(|| requests_json_node_type(12345))),
            ];
            for (name, call) in checks {
                let before = capture.lines();
                assert_eq!(call(), -1, "{name}");
                assert!(capture.lines() > before, "{name} returned -1 without logging");
            }

            let before = capture.lines();
            let host = FfiScriptHost {
                user_data: std::ptr::null_mut(),
                find_callback: Some(find),
                invoke: None,
            };
            assert_eq!(requests_set_host(host), -1);
            assert!(capture.lines() > before);
        });
        requests_shutdown();
    }
}
