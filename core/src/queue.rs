//! The response queue between workers and the tick thread.
//!
//! # Design
//! Workers and WebSocket readers push under a blocking lock; the pump drains
//! with `try_lock` so the tick thread never stalls behind a producer. A
//! failed drain returns nothing and leaves every record in place for the
//! next tick. Records come back most-recently-completed first unless the
//! queue was built with `DeliveryOrder::Fifo`.

use std::sync::{Mutex, PoisonError, TryLockError};

use crate::config::DeliveryOrder;
use crate::http::BodyKind;
use crate::registry::Handle;

/// Identifies the script instance a response must be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

/// One completed operation or inbound WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    /// Request id, or the session handle for WebSocket events.
    pub request_id: Handle,
    pub instance: InstanceId,
    pub callback: String,
    /// HTTP status, or the failure class for failure records.
    pub status: i32,
    pub body_kind: BodyKind,
    pub body: Vec<u8>,
    pub is_websocket: bool,
}

#[derive(Debug, Default)]
pub struct ResponseQueue {
    records: Mutex<Vec<ResponseRecord>>,
    order: DeliveryOrder,
}

impl ResponseQueue {
    pub fn new(order: DeliveryOrder) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            order,
        }
    }

    pub fn push(&self, record: ResponseRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Take every queued record without blocking. Returns an empty list if a
    /// producer currently holds the lock.
    pub fn drain(&self) -> Vec<ResponseRecord> {
        let mut guard = match self.records.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Vec::new(),
        };
        let mut records = std::mem::take(&mut *guard);
        drop(guard);
        if self.order == DeliveryOrder::Lifo {
            records.reverse();
        }
        records
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
