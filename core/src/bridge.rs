//! The process-scoped bridge state.
//!
//! # Design
//! `Bridge` owns one of every component and is shared between the host's
//! tick thread and the FFI entry points. Each component sits behind its own
//! mutex and every method takes `&self`, so a callback running inside
//! `process_tick` can call back into any operation (reading its JSON node,
//! dispatching a follow-up request) without deadlocking. Workers and
//! WebSocket readers only ever touch the response queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::arena::JsonArena;
use crate::client::{RequestBody, RequestClient};
use crate::config::BridgeConfig;
use crate::dispatch::{Dispatcher, ExecutionMode, RequestDescriptor};
use crate::error::BridgeError;
use crate::http::{BodyKind, HttpMethod};
use crate::pump::{self, ScriptHost, TickReport};
use crate::queue::{InstanceId, ResponseQueue};
use crate::registry::{HeaderList, HeaderSets, Handle, Registry};
use crate::websocket::{ConnectionState, PayloadKind, SessionManager};

/// Where a request goes and who hears about it.
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    pub instance: InstanceId,
    pub client: Handle,
    pub path: &'a str,
    /// Method code, 0..=8 (see `HttpMethod::from_code`).
    pub method: i32,
    pub callback: &'a str,
    /// Request-specific headers; an unknown handle contributes none.
    pub header_set: Handle,
}

pub struct Bridge {
    config: BridgeConfig,
    queue: Arc<ResponseQueue>,
    header_sets: Mutex<HeaderSets>,
    clients: Mutex<Registry<Arc<RequestClient>>>,
    dispatcher: Mutex<Dispatcher>,
    sessions: Mutex<SessionManager>,
    arena: Mutex<JsonArena>,
    instances: Mutex<HashSet<InstanceId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let queue = Arc::new(ResponseQueue::new(config.delivery_order));
        let dispatcher = Dispatcher::new(&config, Arc::clone(&queue))?;
        tracing::info!(
            max_workers = config.max_workers,
            timeout_ms = config.timeout_ms,
            order = ?config.delivery_order,
            "bridge started"
        );
        Ok(Self {
            sessions: Mutex::new(SessionManager::new(Arc::clone(&queue))),
            dispatcher: Mutex::new(dispatcher),
            header_sets: Mutex::new(HeaderSets::default()),
            clients: Mutex::new(Registry::new()),
            arena: Mutex::new(JsonArena::new()),
            instances: Mutex::new(HashSet::new()),
            queue,
            config,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // ---- header sets and clients ----

    pub fn create_header_set(&self, pairs: HeaderList) -> Handle {
        lock(&self.header_sets).create(pairs)
    }

    pub fn release_header_set(&self, handle: Handle) -> bool {
        let released = lock(&self.header_sets).release(handle);
        if !released {
            tracing::warn!(header_set = handle, "release of unknown header set");
        }
        released
    }

    /// Create a client whose default headers are a copy of `header_set`.
    pub fn create_client(&self, endpoint: &str, header_set: Handle) -> Result<Handle, BridgeError> {
        let headers = lock(&self.header_sets).resolve(header_set);
        let client = RequestClient::new(endpoint, headers, &self.config)
            .inspect_err(|e| tracing::error!(endpoint, error = %e, "client creation failed"))?;
        Ok(self.register_client(client))
    }

    /// Register a client built elsewhere, e.g. around a custom transport.
    pub fn register_client(&self, client: RequestClient) -> Handle {
        let endpoint = client.endpoint().to_string();
        let handle = lock(&self.clients).insert(Arc::new(client));
        tracing::debug!(client = handle, endpoint, "client created");
        handle
    }

    // ---- requests ----

    /// Issue a request with a raw string body. The response reaches the
    /// callback as `(requestId, status, body, length)`.
    pub fn request(&self, target: RequestTarget<'_>, body: &[u8], mode: ExecutionMode) -> Result<Handle, BridgeError> {
        let body = if body.is_empty() {
            RequestBody::None
        } else {
            RequestBody::Text(body.to_vec())
        };
        self.dispatch(target, mode, BodyKind::String, |_| Ok(body))
    }

    /// Issue a request whose body is the JSON node `node`. The node is
    /// consumed only once the request has been accepted; a rejected request
    /// leaves it alive. The response reaches the callback as
    /// `(requestId, status, node)`.
    pub fn request_json(&self, target: RequestTarget<'_>, node: Handle, mode: ExecutionMode) -> Result<Handle, BridgeError> {
        let request_id = self.dispatch(target, mode, BodyKind::Json, |arena| {
            Ok(RequestBody::Json(arena.get(node, false)?))
        })?;
        // Consuming read; a persistent node stays resident.
        let _ = lock(&self.arena).take(node);
        Ok(request_id)
    }

    fn dispatch(
        &self,
        target: RequestTarget<'_>,
        mode: ExecutionMode,
        response_kind: BodyKind,
        body: impl FnOnce(&mut JsonArena) -> Result<RequestBody, BridgeError>,
    ) -> Result<Handle, BridgeError> {
        let result = (|| {
            let method = HttpMethod::from_code(target.method).ok_or(BridgeError::InvalidMethod(target.method))?;
            let client = lock(&self.clients)
                .get(target.client)
                .cloned()
                .ok_or(BridgeError::InvalidHandle {
                    kind: "client",
                    handle: target.client,
                })?;
            let body = body(&mut lock(&self.arena))?;
            let descriptor = RequestDescriptor {
                instance: target.instance,
                callback: target.callback.to_string(),
                path: target.path.to_string(),
                method,
                body,
                headers: lock(&self.header_sets).resolve(target.header_set),
                response_kind,
            };
            lock(&self.dispatcher).dispatch(&client, descriptor, mode)
        })();
        result.inspect_err(|e| {
            tracing::error!(client = target.client, path = target.path, error = %e, "request not dispatched");
        })
    }

    // ---- websockets ----

    pub fn connect(&self, instance: InstanceId, address: &str, callback: &str, kind: PayloadKind) -> Result<Handle, BridgeError> {
        lock(&self.sessions)
            .connect(instance, address, callback, kind)
            .inspect_err(|e| tracing::error!(address, error = %e, "websocket connect failed"))
    }

    pub fn ws_send(&self, session: Handle, payload: &str) -> Result<(), BridgeError> {
        lock(&self.sessions)
            .send(session, payload)
            .inspect_err(|e| tracing::warn!(session, error = %e, "websocket send rejected"))
    }

    /// Send the serialized JSON node `node`, consuming it. An unknown
    /// session leaves the node untouched.
    pub fn ws_send_json(&self, session: Handle, node: Handle) -> Result<(), BridgeError> {
        let sessions = lock(&self.sessions);
        let result = sessions.state(session).and_then(|_| {
            let value = lock(&self.arena).take(node)?;
            sessions.send_json(session, &value)
        });
        result.inspect_err(|e| tracing::warn!(session, node, error = %e, "websocket send rejected"))
    }

    pub fn ws_close(&self, session: Handle) -> Result<(), BridgeError> {
        lock(&self.sessions)
            .close(session)
            .inspect_err(|e| tracing::warn!(session, error = %e, "websocket close rejected"))
    }

    pub fn ws_state(&self, session: Handle) -> Result<ConnectionState, BridgeError> {
        lock(&self.sessions)
            .state(session)
            .inspect_err(|e| tracing::debug!(session, error = %e, "websocket state query rejected"))
    }

    // ---- delivery ----

    pub fn load_instance(&self, instance: InstanceId) {
        lock(&self.instances).insert(instance);
        tracing::debug!(instance = instance.0, "script instance loaded");
    }

    pub fn unload_instance(&self, instance: InstanceId) {
        lock(&self.instances).remove(&instance);
        tracing::debug!(instance = instance.0, "script instance unloaded");
    }

    pub fn is_loaded(&self, instance: InstanceId) -> bool {
        lock(&self.instances).contains(&instance)
    }

    /// Deliver every completed response to `host`. Call once per host tick.
    pub fn process_tick(&self, host: &mut dyn ScriptHost) -> TickReport {
        let report = pump::run_tick(&self.queue, &self.instances, &self.arena, host);
        if report != TickReport::default() {
            tracing::trace!(?report, "tick processed");
        }
        report
    }

    /// Records completed but not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The JSON arena. Do not hold the guard across `process_tick`.
    pub fn json(&self) -> MutexGuard<'_, JsonArena> {
        lock(&self.arena)
    }

    /// Stop the worker pool and close every WebSocket. Later dispatches
    /// fail with `DispatchFailure`.
    pub fn shutdown(&self) {
        lock(&self.dispatcher).shutdown();
        lock(&self.sessions).close_all();
        tracing::info!(pending = self.queue.len(), "bridge shut down");
    }
}
