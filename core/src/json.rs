//! JSON operations exposed to the host on top of `JsonArena`.
//!
//! Composite constructors consume their children under each child's own
//! release policy and store a copy, so a child handle that survives
//! composition stays independent of the composite. Field getters read their
//! parent without consuming it; `get_object` and the `get_node_*` family do
//! consume. Integers and floats are 32-bit at the host boundary.

use serde_json::{Map, Number, Value};

use crate::arena::JsonArena;
use crate::error::JsonError;
use crate::registry::Handle;

/// Type tag reported by `node_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Number = 0,
    Boolean = 1,
    String = 2,
    Object = 3,
    Array = 4,
    Null = 5,
}

impl NodeType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Number(_) => NodeType::Number,
            Value::Bool(_) => NodeType::Boolean,
            Value::String(_) => NodeType::String,
            Value::Object(_) => NodeType::Object,
            Value::Array(_) => NodeType::Array,
            Value::Null => NodeType::Null,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

fn float_value(value: f32) -> Result<Value, JsonError> {
    Number::from_f64(f64::from(value))
        .map(Value::Number)
        .ok_or(JsonError::NotFinite)
}

fn as_int(value: &Value) -> Result<i32, JsonError> {
    value
        .as_i64()
        .and_then(|n| i32::try_from(n).ok())
        .ok_or(JsonError::WrongType)
}

fn as_float(value: &Value) -> Result<f32, JsonError> {
    value.as_f64().map(|n| n as f32).ok_or(JsonError::WrongType)
}

fn as_bool(value: &Value) -> Result<bool, JsonError> {
    value.as_bool().ok_or(JsonError::WrongType)
}

fn as_string(value: &Value) -> Result<String, JsonError> {
    value.as_str().map(str::to_owned).ok_or(JsonError::WrongType)
}

fn field<'a>(value: &'a Value, key: &str) -> Result<&'a Value, JsonError> {
    value
        .as_object()
        .ok_or(JsonError::NotObject)?
        .get(key)
        .ok_or_else(|| JsonError::MissingKey(key.to_string()))
}

impl JsonArena {
    pub fn parse(&mut self, text: &str) -> Result<Handle, JsonError> {
        self.parse_slice(text.as_bytes())
    }

    /// Parse raw bytes. Input that is not valid UTF-8 is a parse error.
    pub fn parse_slice(&mut self, bytes: &[u8]) -> Result<Handle, JsonError> {
        let value = serde_json::from_slice(bytes)?;
        Ok(self.alloc(value))
    }

    pub fn stringify(&self, handle: Handle) -> Result<String, JsonError> {
        Ok(self.peek(handle)?.to_string())
    }

    pub fn node_type(&self, handle: Handle) -> Result<NodeType, JsonError> {
        self.peek(handle).map(NodeType::of)
    }

    /// Build an object from `(key, child)` pairs in order.
    pub fn object(&mut self, fields: &[(String, Handle)]) -> Result<Handle, JsonError> {
        let mut map = Map::with_capacity(fields.len());
        for (key, child) in fields {
            if key.is_empty() {
                return Err(JsonError::InvalidKey);
            }
            let value = self.take(*child).map_err(|_| JsonError::InvalidValue(*child))?;
            map.insert(key.clone(), value);
        }
        Ok(self.alloc(Value::Object(map)))
    }

    pub fn array(&mut self, elements: &[Handle]) -> Result<Handle, JsonError> {
        let values = elements
            .iter()
            .map(|&child| self.take(child).map_err(|_| JsonError::InvalidValue(child)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.alloc(Value::Array(values)))
    }

    pub fn int(&mut self, value: i32) -> Handle {
        self.alloc(Value::from(value))
    }

    pub fn float(&mut self, value: f32) -> Result<Handle, JsonError> {
        let value = float_value(value)?;
        Ok(self.alloc(value))
    }

    pub fn bool(&mut self, value: bool) -> Handle {
        self.alloc(Value::Bool(value))
    }

    pub fn string(&mut self, value: &str) -> Handle {
        self.alloc(Value::String(value.to_string()))
    }

    /// Concatenate two objects or two arrays into a new node. `right` is
    /// consumed, `left` is not.
    pub fn append(&mut self, left: Handle, right: Handle) -> Result<Handle, JsonError> {
        let a = self.get(left, false);
        let b = self.take(right);
        let combined = match (a?, b?) {
            (Value::Object(mut a), Value::Object(b)) => {
                a.extend(b);
                Value::Object(a)
            }
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Value::Array(a)
            }
            _ => return Err(JsonError::Mismatched),
        };
        Ok(self.alloc(combined))
    }

    fn object_mut(&mut self, handle: Handle) -> Result<&mut Map<String, Value>, JsonError> {
        self.get_mut(handle)?.as_object_mut().ok_or(JsonError::NotObject)
    }

    fn set_field(&mut self, handle: Handle, key: &str, value: Value) -> Result<(), JsonError> {
        self.object_mut(handle)?.insert(key.to_string(), value);
        Ok(())
    }

    /// Assign a child node to `key`, consuming the child.
    pub fn set_object(&mut self, handle: Handle, key: &str, child: Handle) -> Result<(), JsonError> {
        self.object_mut(handle)?;
        let value = self.take(child).map_err(|_| JsonError::InvalidValue(child))?;
        self.set_field(handle, key, value)
    }

    pub fn set_int(&mut self, handle: Handle, key: &str, value: i32) -> Result<(), JsonError> {
        self.set_field(handle, key, Value::from(value))
    }

    pub fn set_float(&mut self, handle: Handle, key: &str, value: f32) -> Result<(), JsonError> {
        self.object_mut(handle)?;
        let value = float_value(value)?;
        self.set_field(handle, key, value)
    }

    pub fn set_bool(&mut self, handle: Handle, key: &str, value: bool) -> Result<(), JsonError> {
        self.set_field(handle, key, Value::Bool(value))
    }

    pub fn set_string(&mut self, handle: Handle, key: &str, value: &str) -> Result<(), JsonError> {
        self.set_field(handle, key, Value::String(value.to_string()))
    }

    /// Copy the field `key` into a new node. Consumes the parent.
    pub fn get_object(&mut self, handle: Handle, key: &str) -> Result<Handle, JsonError> {
        let parent = self.take(handle)?;
        let value = field(&parent, key)?.clone();
        Ok(self.alloc(value))
    }

    pub fn get_int(&self, handle: Handle, key: &str) -> Result<i32, JsonError> {
        as_int(field(self.peek(handle)?, key)?)
    }

    pub fn get_float(&self, handle: Handle, key: &str) -> Result<f32, JsonError> {
        as_float(field(self.peek(handle)?, key)?)
    }

    pub fn get_bool(&self, handle: Handle, key: &str) -> Result<bool, JsonError> {
        as_bool(field(self.peek(handle)?, key)?)
    }

    pub fn get_string(&self, handle: Handle, key: &str) -> Result<String, JsonError> {
        as_string(field(self.peek(handle)?, key)?)
    }

    /// Copy the array at `key` into a new node.
    pub fn get_array(&mut self, handle: Handle, key: &str) -> Result<Handle, JsonError> {
        let value = field(self.peek(handle)?, key)?;
        if !value.is_array() {
            return Err(JsonError::WrongType);
        }
        let value = value.clone();
        Ok(self.alloc(value))
    }

    pub fn array_length(&self, handle: Handle) -> Result<usize, JsonError> {
        self.peek(handle)?
            .as_array()
            .map(Vec::len)
            .ok_or(JsonError::NotArray)
    }

    /// Copy the element at `index` into a new node.
    pub fn array_object(&mut self, handle: Handle, index: i32) -> Result<Handle, JsonError> {
        let items = self.peek(handle)?.as_array().ok_or(JsonError::NotArray)?;
        let value = usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i))
            .ok_or(JsonError::OutOfRange(index))?
            .clone();
        Ok(self.alloc(value))
    }

    pub fn get_node_int(&mut self, handle: Handle) -> Result<i32, JsonError> {
        as_int(&self.take(handle)?)
    }

    pub fn get_node_float(&mut self, handle: Handle) -> Result<f32, JsonError> {
        as_float(&self.take(handle)?)
    }

    pub fn get_node_bool(&mut self, handle: Handle) -> Result<bool, JsonError> {
        as_bool(&self.take(handle)?)
    }

    pub fn get_node_string(&mut self, handle: Handle) -> Result<String, JsonError> {
        as_string(&self.take(handle)?)
    }
}
