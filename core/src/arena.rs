//! Handle-based storage for JSON values owned on behalf of the host.
//!
//! # Design
//! The arena owns every value; the host only ever holds a `Handle`. Reads
//! return structural copies, so nothing outside the arena can alias a stored
//! value. An entry's `ReleasePolicy` decides whether a consuming read moves
//! the value out and invalidates the handle (`AutoReleaseOnRead`) or clones
//! it and leaves the entry resident (`Persistent`).

use serde_json::Value;

use crate::error::JsonError;
use crate::registry::{Handle, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    AutoReleaseOnRead,
    Persistent,
}

#[derive(Debug)]
struct Node {
    value: Value,
    policy: ReleasePolicy,
}

#[derive(Debug, Default)]
pub struct JsonArena {
    nodes: Registry<Node>,
}

impl JsonArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value with the default `AutoReleaseOnRead` policy.
    pub fn alloc(&mut self, value: Value) -> Handle {
        self.nodes.insert(Node {
            value,
            policy: ReleasePolicy::AutoReleaseOnRead,
        })
    }

    /// Copy a value out. With `consume` set, an `AutoReleaseOnRead` entry is
    /// removed and its handle becomes invalid.
    pub fn get(&mut self, handle: Handle, consume: bool) -> Result<Value, JsonError> {
        let node = self.nodes.get(handle).ok_or(JsonError::InvalidNode(handle))?;
        if consume && node.policy == ReleasePolicy::AutoReleaseOnRead {
            return self
                .nodes
                .remove(handle)
                .map(|node| node.value)
                .ok_or(JsonError::InvalidNode(handle));
        }
        Ok(node.value.clone())
    }

    /// Consuming read.
    pub fn take(&mut self, handle: Handle) -> Result<Value, JsonError> {
        self.get(handle, true)
    }

    /// Borrow a value without affecting its lifetime.
    pub fn peek(&self, handle: Handle) -> Result<&Value, JsonError> {
        self.nodes
            .get(handle)
            .map(|node| &node.value)
            .ok_or(JsonError::InvalidNode(handle))
    }

    /// Mutable access for in-place field assignment.
    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut Value, JsonError> {
        self.nodes
            .get_mut(handle)
            .map(|node| &mut node.value)
            .ok_or(JsonError::InvalidNode(handle))
    }

    pub fn policy(&self, handle: Handle) -> Option<ReleasePolicy> {
        self.nodes.get(handle).map(|node| node.policy)
    }

    /// Switch between auto-release (`true`) and persistent (`false`).
    pub fn toggle_gc(&mut self, handle: Handle, auto_release: bool) -> Result<(), JsonError> {
        let node = self.nodes.get_mut(handle).ok_or(JsonError::InvalidNode(handle))?;
        node.policy = if auto_release {
            ReleasePolicy::AutoReleaseOnRead
        } else {
            ReleasePolicy::Persistent
        };
        Ok(())
    }

    /// Delete an entry regardless of its policy.
    pub fn release(&mut self, handle: Handle) -> Result<(), JsonError> {
        self.nodes
            .remove(handle)
            .map(|_| ())
            .ok_or(JsonError::InvalidNode(handle))
    }

    /// Host-facing cleanup. A manual cleanup deletes unconditionally and logs
    /// unknown handles. An `auto` cleanup is quiet about unknown handles and
    /// leaves persistent entries alone.
    pub fn cleanup(&mut self, handle: Handle, auto: bool) -> Result<(), JsonError> {
        match self.policy(handle) {
            None => {
                if !auto {
                    tracing::warn!(node = handle, "attempt to clean up invalid node");
                }
                Err(JsonError::InvalidNode(handle))
            }
            Some(ReleasePolicy::Persistent) if auto => Err(JsonError::Persistent(handle)),
            Some(_) => self.release(handle),
        }
    }

    /// Remove an entry if it still exists. Returns whether it did.
    pub fn discard(&mut self, handle: Handle) -> bool {
        self.nodes.remove(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
