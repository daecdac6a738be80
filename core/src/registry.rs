//! Handle tables shared by every host-facing resource.
//!
//! # Design
//! The host only ever holds an integer. `Registry<T>` hands out handles from
//! a monotonically increasing counter, so a released handle stays invalid
//! instead of silently aliasing a newer entry. The counter only wraps after
//! `i32::MAX` allocations and then skips handles that are still live.

use std::collections::HashMap;

/// Opaque integer identifier handed to the host.
pub type Handle = i32;

/// An ordered list of header name/value pairs. Duplicate names are allowed.
pub type HeaderList = Vec<(String, String)>;

#[derive(Debug)]
pub struct Registry<T> {
    entries: HashMap<Handle, T>,
    next: Handle,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next: 0,
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under a fresh handle.
    pub fn insert(&mut self, value: T) -> Handle {
        let handle = self.allocate();
        self.entries.insert(handle, value);
        handle
    }

    /// Reserve a handle, build the value with it, and store the value only if
    /// construction succeeds. The handle is consumed either way.
    pub fn try_insert_with<E>(&mut self, build: impl FnOnce(Handle) -> Result<T, E>) -> Result<Handle, E> {
        let handle = self.allocate();
        let value = build(handle)?;
        self.entries.insert(handle, value);
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.entries.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.entries.remove(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Handle, T)> + '_ {
        self.entries.drain()
    }

    fn allocate(&mut self) -> Handle {
        loop {
            let handle = self.next;
            self.next = if self.next == Handle::MAX { 0 } else { self.next + 1 };
            if !self.entries.contains_key(&handle) {
                return handle;
            }
        }
    }
}

/// Reusable header lists referenced by requests and clients.
#[derive(Debug, Default)]
pub struct HeaderSets {
    sets: Registry<HeaderList>,
}

impl HeaderSets {
    pub fn create(&mut self, pairs: HeaderList) -> Handle {
        self.sets.insert(pairs)
    }

    /// Remove a header set. Returns `false` if the handle was unknown.
    pub fn release(&mut self, handle: Handle) -> bool {
        self.sets.remove(handle).is_some()
    }

    /// Copy out the header list. Unknown or released handles resolve to an
    /// empty list so stale references never fail a request.
    pub fn resolve(&self, handle: Handle) -> HeaderList {
        self.sets.get(handle).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
