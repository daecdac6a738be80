//! Per-tick callback delivery.
//!
//! # Design
//! The pump is the only place host callbacks run. It drains the queue once,
//! then handles records one at a time: resolve the instance, resolve the
//! callback, marshal arguments, invoke, clean up. No lock is held across an
//! invocation, so callbacks may call back into the bridge (most commonly to
//! read the JSON node they were just handed).

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::arena::JsonArena;
use crate::http::BodyKind;
use crate::queue::{InstanceId, ResponseQueue, ResponseRecord};
use crate::registry::Handle;

/// Host-side index of a resolved callback.
pub type CallbackIndex = i32;

/// One argument pushed onto the host's call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackArg {
    Int(i32),
    Bytes(Vec<u8>),
}

/// The scripting host, as seen by the pump.
///
/// Argument lists passed to `invoke` are in push order, which is the reverse
/// of the order the script declares them in.
pub trait ScriptHost {
    fn find_callback(&mut self, instance: InstanceId, name: &str) -> Option<CallbackIndex>;

    /// Run a callback to completion. The return value is ignored by the pump.
    fn invoke(&mut self, instance: InstanceId, callback: CallbackIndex, args: &[CallbackArg]) -> i32;
}

/// What happened to the records drained in one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Callbacks invoked.
    pub delivered: usize,
    /// Records whose instance is no longer loaded.
    pub dropped: usize,
    /// Records skipped for a missing callback or an unparseable JSON body.
    pub skipped: usize,
}

enum Payload {
    Raw(Vec<u8>),
    Node(Handle),
}

/// Drain `queue` and deliver every record to `host`.
pub fn run_tick(
    queue: &ResponseQueue,
    instances: &Mutex<HashSet<InstanceId>>,
    arena: &Mutex<JsonArena>,
    host: &mut dyn ScriptHost,
) -> TickReport {
    let mut report = TickReport::default();
    for record in queue.drain() {
        let loaded = instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&record.instance);
        if !loaded {
            tracing::debug!(request_id = record.request_id, instance = record.instance.0, "instance unloaded, dropping record");
            report.dropped += 1;
            continue;
        }
        if deliver(record, arena, host) {
            report.delivered += 1;
        } else {
            report.skipped += 1;
        }
    }
    report
}

fn deliver(record: ResponseRecord, arena: &Mutex<JsonArena>, host: &mut dyn ScriptHost) -> bool {
    let Some(callback) = host.find_callback(record.instance, &record.callback) else {
        tracing::warn!(
            request_id = record.request_id,
            instance = record.instance.0,
            callback = %record.callback,
            "callback not found, skipping record"
        );
        return false;
    };

    let payload = match record.body_kind {
        BodyKind::Empty | BodyKind::String => Payload::Raw(record.body),
        BodyKind::Json => {
            let parsed = lock(arena).parse_slice(&record.body);
            match parsed {
                Ok(node) => Payload::Node(node),
                Err(e) => {
                    tracing::warn!(
                        request_id = record.request_id,
                        callback = %record.callback,
                        error = %e,
                        "response body is not valid JSON, skipping record"
                    );
                    return false;
                }
            }
        }
    };

    let node = match payload {
        Payload::Node(node) => Some(node),
        Payload::Raw(_) => None,
    };
    let args = marshal(record.request_id, record.status, record.is_websocket, payload);
    host.invoke(record.instance, callback, &args);

    if let Some(node) = node {
        lock(arena).discard(node);
    }
    true
}

/// Arguments in push order for each record shape.
fn marshal(request_id: Handle, status: i32, is_websocket: bool, payload: Payload) -> Vec<CallbackArg> {
    let mut args = Vec::with_capacity(4);
    match payload {
        Payload::Raw(body) => {
            args.push(CallbackArg::Int(i32::try_from(body.len()).unwrap_or(i32::MAX)));
            args.push(CallbackArg::Bytes(body));
        }
        Payload::Node(node) => args.push(CallbackArg::Int(node)),
    }
    if !is_websocket {
        args.push(CallbackArg::Int(status));
    }
    args.push(CallbackArg::Int(request_id));
    args
}

fn lock(arena: &Mutex<JsonArena>) -> std::sync::MutexGuard<'_, JsonArena> {
    arena.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::DeliveryOrder;

    #[derive(Default)]
    struct RecordingHost {
        callbacks: HashMap<(u64, String), CallbackIndex>,
        calls: Vec<(u64, CallbackIndex, Vec<CallbackArg>)>,
        seen_json: Vec<String>,
        arena: Option<&'static Mutex<JsonArena>>,
    }

    impl RecordingHost {
        fn with(callbacks: &[(u64, &str, CallbackIndex)]) -> Self {
            Self {
                callbacks: callbacks
                    .iter()
                    .map(|(i, name, idx)| ((*i, name.to_string()), *idx))
                    .collect(),
                ..Self::default()
            }
        }
    }

    impl ScriptHost for RecordingHost {
        fn find_callback(&mut self, instance: InstanceId, name: &str) -> Option<CallbackIndex> {
            self.callbacks.get(&(instance.0, name.to_string())).copied()
        }

        fn invoke(&mut self, instance: InstanceId, callback: CallbackIndex, args: &[CallbackArg]) -> i32 {
            if let (Some(arena), Some(CallbackArg::Int(node))) = (self.arena, args.first()) {
                if let Ok(text) = arena.lock().unwrap().stringify(*node) {
                    self.seen_json.push(text);
                }
            }
            self.calls.push((instance.0, callback, args.to_vec()));
            0
        }
    }

    fn record(id: Handle, instance: u64, callback: &str, status: i32, kind: BodyKind, body: &str, ws: bool) -> ResponseRecord {
        ResponseRecord {
            request_id: id,
            instance: InstanceId(instance),
            callback: callback.to_string(),
            status,
            body_kind: kind,
            body: body.as_bytes().to_vec(),
            is_websocket: ws,
        }
    }

    fn loaded(ids: &[u64]) -> Mutex<HashSet<InstanceId>> {
        Mutex::new(ids.iter().map(|id| InstanceId(*id)).collect())
    }

    fn leak_arena() -> &'static Mutex<JsonArena> {
        Box::leak(Box::new(Mutex::new(JsonArena::new())))
    }

    #[test]
    fn string_records_push_length_before_body() {
        let queue = ResponseQueue::new(DeliveryOrder::Fifo);
        queue.push(record(4, 1, "OnText", 200, BodyKind::String, "hello", false));
        let mut host = RecordingHost::with(&[(1, "OnText", 10)]);

        let report = run_tick(&queue, &loaded(&[1]), &Mutex::new(JsonArena::new()), &mut host);

        assert_eq!(report, TickReport { delivered: 1, dropped: 0, skipped: 0 });
        assert_eq!(
            host.calls,
            [(1, 10, vec![
                CallbackArg::Int(5),
                CallbackArg::Bytes(b"hello".to_vec()),
                CallbackArg::Int(200),
                CallbackArg::Int(4),
            ])]
        );
    }

    #[test]
    fn empty_records_marshal_like_strings() {
        let queue = ResponseQueue::new(DeliveryOrder::Fifo);
        queue.push(record(0, 1, "OnDone", 204, BodyKind::Empty, "", false));
        let mut host = RecordingHost::with(&[(1, "OnDone", 3)]);
        run_tick(&queue, &loaded(&[1]), &Mutex::new(JsonArena::new()), &mut host);
        assert_eq!(
            host.calls[0].2,
            [CallbackArg::Int(0), CallbackArg::Bytes(Vec::new()), CallbackArg::Int(204), CallbackArg::Int(0)]
        );
    }

    #[test]
    fn json_records_get_a_node_released_after_the_call() {
        let arena = leak_arena();
        let queue = ResponseQueue::new(DeliveryOrder::Fifo);
        queue.push(record(2, 1, "OnOK", 200, BodyKind::Json, r#"{"x":1}"#, false));
        let mut host = RecordingHost::with(&[(1, "OnOK", 0)]);
        host.arena = Some(arena);

        run_tick(&queue, &loaded(&[1]), arena, &mut host);

        assert_eq!(host.seen_json, [r#"{"x":1}"#]);
        let (_, _, args) = &host.calls[0];
        assert_eq!(args.len(), 3);
        assert_eq!(&args[1..], [CallbackArg::Int(200), CallbackArg::Int(2)]);
        assert!(arena.lock().unwrap().is_empty());
    }

    #[test]
    fn persisted_json_node_is_still_released() {
        struct Persisting(&'static Mutex<JsonArena>);
        impl ScriptHost for Persisting {
            fn find_callback(&mut self, _: InstanceId, _: &str) -> Option<CallbackIndex> {
                Some(0)
            }
            fn invoke(&mut self, _: InstanceId, _: CallbackIndex, args: &[CallbackArg]) -> i32 {
                if let Some(CallbackArg::Int(node)) = args.first() {
                    self.0.lock().unwrap().toggle_gc(*node, false).unwrap();
                }
                0
            }
        }

        let arena = leak_arena();
        let queue = ResponseQueue::new(DeliveryOrder::Fifo);
        queue.push(record(0, 1, "OnOK", 200, BodyKind::Json, "[1,2]", false));
        run_tick(&queue, &loaded(&[1]), arena, &mut Persisting(arena));
        assert!(arena.lock().unwrap().is_empty());
    }

    #[test]
    fn websocket_records_omit_status() {
        let queue = ResponseQueue::new(DeliveryOrder::Fifo);
        queue.push(record(6, 1, "OnMessage", 0, BodyKind::String, "hi", true));
        queue.push(record(6, 1, "OnMessage", 0, BodyKind::Json, "true", true));
        let mut host = RecordingHost::with(&[(1, "OnMessage", 1)]);

        let report = run_tick(&queue, &loaded(&[1]), &Mutex::new(JsonArena::new()), &mut host);

        assert_eq!(report.delivered, 2);
        assert_eq!(
            host.calls[0].2,
            [CallbackArg::Int(2), CallbackArg::Bytes(b"hi".to_vec()), CallbackArg::Int(6)]
        );
        assert_eq!(host.calls[1].2.len(), 2);
        assert_eq!(host.calls[1].2[1], CallbackArg::Int(6));
    }

    #[test]
    fn bad_records_are_skipped_without_stopping_the_drain() {
        let queue = ResponseQueue::new(DeliveryOrder::Fifo);
        queue.push(record(0, 1, "Missing", 200, BodyKind::String, "a", false));
        queue.push(record(1, 1, "OnOK", 200, BodyKind::Json, "{not json", false));
        queue.push(record(2, 2, "OnOK", 200, BodyKind::String, "gone", false));
        queue.push(record(3, 1, "OnOK", 200, BodyKind::String, "ok", false));
        let mut host = RecordingHost::with(&[(1, "OnOK", 0), (2, "OnOK", 0)]);
        let arena = Mutex::new(JsonArena::new());

        let report = run_tick(&queue, &loaded(&[1]), &arena, &mut host);

        assert_eq!(report, TickReport { delivered: 1, dropped: 1, skipped: 2 });
        assert_eq!(host.calls.len(), 1);
        assert_eq!(host.calls[0].2.last(), Some(&CallbackArg::Int(3)));
        assert!(arena.lock().unwrap().is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn json_body_with_invalid_utf8_is_skipped() {
        let queue = ResponseQueue::new(DeliveryOrder::Fifo);
        let mut bad = record(5, 1, "OnOK", 200, BodyKind::Json, "", false);
        bad.body = b"{\"s\":\"a\xffb\"}".to_vec();
        queue.push(bad);
        let mut host = RecordingHost::with(&[(1, "OnOK", 0)]);
        let arena = Mutex::new(JsonArena::new());

        let report = run_tick(&queue, &loaded(&[1]), &arena, &mut host);

        assert_eq!(report, TickReport { delivered: 0, dropped: 0, skipped: 1 });
        assert!(host.calls.is_empty());
        assert!(arena.lock().unwrap().is_empty());
    }

    #[test]
    fn lifo_queue_delivers_newest_first() {
        let queue = ResponseQueue::new(DeliveryOrder::Lifo);
        for id in 0..3 {
            queue.push(record(id, 1, "OnOK", 200, BodyKind::String, "", false));
        }
        let mut host = RecordingHost::with(&[(1, "OnOK", 0)]);
        run_tick(&queue, &loaded(&[1]), &Mutex::new(JsonArena::new()), &mut host);
        let ids: Vec<_> = host.calls.iter().map(|(_, _, args)| args.last().cloned()).collect();
        assert_eq!(ids, [Some(CallbackArg::Int(2)), Some(CallbackArg::Int(1)), Some(CallbackArg::Int(0))]);
    }
}
