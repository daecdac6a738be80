//! Request dispatch and execution.
//!
//! # Design
//! `dispatch` resolves everything it needs on the calling thread (merged
//! headers, encoded body, a handle to the client's transport), reserves the
//! request id, and hands a self-contained `Job` to a worker. The worker runs
//! the transport call to completion and always pushes exactly one record:
//! the response on success, or a failure record aimed at the configured
//! failure callback. Workers are blocking tasks on a tokio runtime capped at
//! `max_workers`; excess jobs wait in the runtime's queue.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::client::{RequestBody, RequestClient};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, TransportError};
use crate::http::{BodyKind, HttpMethod, HttpRequest, HttpResponse};
use crate::queue::{InstanceId, ResponseQueue, ResponseRecord};
use crate::registry::{HeaderList, Handle};
use crate::transport::Transport;

/// Everything needed to issue one request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub instance: InstanceId,
    pub callback: String,
    pub path: String,
    pub method: HttpMethod,
    pub body: RequestBody,
    /// Request-specific headers, applied after the client's defaults.
    pub headers: HeaderList,
    /// How the pump should hand the response body to the script.
    pub response_kind: BodyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run on a pool worker; `dispatch` returns immediately.
    Background,
    /// Run on the calling thread; the record is queued before `dispatch` returns.
    Inline,
}

/// Routing data carried from dispatch to the finished record.
#[derive(Debug, Clone)]
struct Ticket {
    request_id: Handle,
    instance: InstanceId,
    callback: String,
    response_kind: BodyKind,
}

impl Ticket {
    fn into_record(self, outcome: Result<HttpResponse, TransportError>, failure_callback: &str) -> ResponseRecord {
        match outcome {
            Ok(response) => {
                tracing::debug!(request_id = self.request_id, status = response.status, "request completed");
                ResponseRecord {
                    request_id: self.request_id,
                    instance: self.instance,
                    callback: self.callback,
                    status: i32::from(response.status),
                    body_kind: self.response_kind,
                    body: response.body,
                    is_websocket: false,
                }
            }
            Err(err) => {
                let class = err.failure_class();
                tracing::error!(request_id = self.request_id, class, error = %err, "request failed");
                let mut message = err.to_string();
                if message.is_empty() {
                    message = "request failed".to_string();
                }
                ResponseRecord {
                    request_id: self.request_id,
                    instance: self.instance,
                    callback: failure_callback.to_string(),
                    status: class,
                    body_kind: BodyKind::String,
                    body: message.into_bytes(),
                    is_websocket: false,
                }
            }
        }
    }
}

struct Job {
    ticket: Ticket,
    request: HttpRequest,
    transport: Arc<dyn Transport>,
    queue: Arc<ResponseQueue>,
    failure_callback: Arc<str>,
}

impl Job {
    fn run(self) {
        let transport = &self.transport;
        let request = &self.request;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| transport.execute(request)))
            .unwrap_or_else(|payload| Err(TransportError::Unknown(panic_message(payload.as_ref()))));
        let record = self.ticket.into_record(outcome, &self.failure_callback);
        self.queue.push(record);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

pub struct Dispatcher {
    runtime: Option<Runtime>,
    queue: Arc<ResponseQueue>,
    failure_callback: Arc<str>,
    /// `None` once every non-negative id has been issued. Ids never repeat.
    next_id: Option<Handle>,
}

impl Dispatcher {
    pub fn new(config: &BridgeConfig, queue: Arc<ResponseQueue>) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_workers.max(1))
            .thread_name("requests-worker")
            .build()
            .map_err(|e| BridgeError::DispatchFailure(format!("failed to start worker pool: {e}")))?;
        Ok(Self {
            runtime: Some(runtime),
            queue,
            failure_callback: Arc::from(config.failure_callback.as_str()),
            next_id: Some(0),
        })
    }

    /// Issue a request through `client` and return its id. The id is fixed
    /// before the job starts, so it is valid even if the job finishes first.
    pub fn dispatch(
        &mut self,
        client: &RequestClient,
        descriptor: RequestDescriptor,
        mode: ExecutionMode,
    ) -> Result<Handle, BridgeError> {
        let request_id = self
            .next_id
            .ok_or_else(|| BridgeError::DispatchFailure("request ids exhausted".to_string()))?;
        let request = client.build_request(
            descriptor.method,
            &descriptor.path,
            descriptor.headers,
            descriptor.body,
        )?;
        let job = Job {
            ticket: Ticket {
                request_id,
                instance: descriptor.instance,
                callback: descriptor.callback,
                response_kind: descriptor.response_kind,
            },
            request,
            transport: client.transport(),
            queue: Arc::clone(&self.queue),
            failure_callback: Arc::clone(&self.failure_callback),
        };

        tracing::debug!(
            request_id,
            method = job.request.method.as_str(),
            url = %job.request.url,
            ?mode,
            "dispatching request"
        );
        match mode {
            ExecutionMode::Inline => job.run(),
            ExecutionMode::Background => {
                let runtime = self.runtime.as_ref().ok_or_else(|| {
                    BridgeError::DispatchFailure("worker pool has been shut down".to_string())
                })?;
                // Detached: completion is observed through the queue.
                drop(runtime.spawn_blocking(move || job.run()));
            }
        }

        self.next_id = request_id.checked_add(1);
        Ok(request_id)
    }

    /// Stop accepting background work. Jobs already running finish on their
    /// own threads; their records are still queued.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
