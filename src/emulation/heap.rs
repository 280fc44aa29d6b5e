// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! The managed heap.
//!
//! Objects are stored by id behind a single `RwLock`; ids come from an atomic counter so
//! allocation never needs to read the map first. Reads hand out clones (strings are
//! `Arc<str>`, so cloning them is cheap) and mutation goes through
//! [`ManagedHeap::with_object_mut`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use crate::{
    emulation::value::{FunctionPointer, HeapRef, Value},
    metadata::{symbols::CoreTypes, token::Token, typesystem::TypeSig},
    Error, Result,
};

/// An object on the managed heap.
#[derive(Clone, Debug, PartialEq)]
pub enum HeapObject {
    /// An immutable string
    String(Arc<str>),
    /// A single-dimensional, zero-based array
    Array {
        /// Declared element type
        element_type: TypeSig,
        /// Elements
        elements: Vec<Value>,
    },
    /// A class instance
    Object {
        /// Runtime type
        type_token: Token,
        /// Instance field values
        fields: HashMap<Token, Value>,
    },
    /// A boxed value type
    Boxed {
        /// The value type
        type_token: Token,
        /// The payload
        value: Box<Value>,
    },
    /// A delegate instance
    Delegate {
        /// Delegate type
        type_token: Token,
        /// Bound receiver, [`Value::Null`] for static targets
        target: Value,
        /// The callable the delegate invokes
        method: FunctionPointer,
    },
}

impl HeapObject {
    /// Short name of the object kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "string",
            HeapObject::Array { .. } => "array",
            HeapObject::Object { .. } => "object",
            HeapObject::Boxed { .. } => "boxed value",
            HeapObject::Delegate { .. } => "delegate",
        }
    }

    /// The runtime type of the object.
    ///
    /// Arrays report `System.Object`; the engine never dispatches on array types.
    #[must_use]
    pub fn type_token(&self, core: &CoreTypes) -> Token {
        match self {
            HeapObject::String(_) => core.string,
            HeapObject::Array { .. } => core.object,
            HeapObject::Object { type_token, .. }
            | HeapObject::Boxed { type_token, .. }
            | HeapObject::Delegate { type_token, .. } => *type_token,
        }
    }
}

#[derive(Debug, Default)]
struct HeapState {
    objects: HashMap<u64, HeapObject>,
}

/// Object storage shared by every thread of a [`crate::emulation::Runtime`].
#[derive(Debug)]
pub struct ManagedHeap {
    state: RwLock<HeapState>,
    next_id: AtomicU64,
    max_objects: usize,
}

impl ManagedHeap {
    /// Creates a heap holding at most `max_objects` objects (0 = unlimited).
    #[must_use]
    pub fn new(max_objects: usize) -> Self {
        ManagedHeap {
            state: RwLock::new(HeapState::default()),
            next_id: AtomicU64::new(1),
            max_objects,
        }
    }

    fn alloc(&self, object: HeapObject) -> Result<HeapRef> {
        let mut state = write_lock!(self.state);
        if self.max_objects != 0 && state.objects.len() >= self.max_objects {
            return Err(Error::NotSupported(format!(
                "heap object limit of {} reached",
                self.max_objects
            )));
        }

        let heap_ref = HeapRef::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        state.objects.insert(heap_ref.id(), object);
        Ok(heap_ref)
    }

    /// Allocates a string.
    ///
    /// # Errors
    /// Fails when the object limit is reached.
    pub fn alloc_string(&self, value: &str) -> Result<HeapRef> {
        self.alloc(HeapObject::String(value.into()))
    }

    /// Allocates an array with `elements` as initial content.
    ///
    /// # Errors
    /// Fails when the object limit is reached.
    pub fn alloc_array(&self, element_type: TypeSig, elements: Vec<Value>) -> Result<HeapRef> {
        self.alloc(HeapObject::Array {
            element_type,
            elements,
        })
    }

    /// Allocates a class instance with the given field values.
    ///
    /// # Errors
    /// Fails when the object limit is reached.
    pub fn alloc_object(&self, type_token: Token, fields: HashMap<Token, Value>) -> Result<HeapRef> {
        self.alloc(HeapObject::Object { type_token, fields })
    }

    /// Boxes a value.
    ///
    /// # Errors
    /// Fails when the object limit is reached.
    pub fn alloc_boxed(&self, type_token: Token, value: Value) -> Result<HeapRef> {
        self.alloc(HeapObject::Boxed {
            type_token,
            value: Box::new(value),
        })
    }

    /// Allocates a delegate.
    ///
    /// # Errors
    /// Fails when the object limit is reached.
    pub fn alloc_delegate(
        &self,
        type_token: Token,
        target: Value,
        method: FunctionPointer,
    ) -> Result<HeapRef> {
        self.alloc(HeapObject::Delegate {
            type_token,
            target,
            method,
        })
    }

    /// A clone of the object behind `heap_ref`.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for dangling references.
    pub fn get(&self, heap_ref: HeapRef) -> Result<HeapObject> {
        let state = read_lock!(self.state);
        state
            .objects
            .get(&heap_ref.id())
            .cloned()
            .ok_or_else(|| dangling(heap_ref))
    }

    /// Runs `f` with mutable access to an object.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for dangling references, or whatever `f` returns.
    pub fn with_object_mut<F, R>(&self, heap_ref: HeapRef, f: F) -> Result<R>
    where
        F: FnOnce(&mut HeapObject) -> Result<R>,
    {
        let mut state = write_lock!(self.state);
        let object = state
            .objects
            .get_mut(&heap_ref.id())
            .ok_or_else(|| dangling(heap_ref))?;
        f(object)
    }

    /// The string behind `heap_ref`.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object is not a string.
    pub fn get_string(&self, heap_ref: HeapRef) -> Result<Arc<str>> {
        let state = read_lock!(self.state);
        match state.objects.get(&heap_ref.id()) {
            Some(HeapObject::String(value)) => Ok(Arc::clone(value)),
            Some(other) => Err(Error::TypeMismatch(format!(
                "expected string, found {}",
                other.kind()
            ))),
            None => Err(dangling(heap_ref)),
        }
    }

    /// Length of an array.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object is not an array.
    pub fn get_array_length(&self, heap_ref: HeapRef) -> Result<usize> {
        let state = read_lock!(self.state);
        match state.objects.get(&heap_ref.id()) {
            Some(HeapObject::Array { elements, .. }) => Ok(elements.len()),
            Some(other) => Err(Error::TypeMismatch(format!(
                "expected array, found {}",
                other.kind()
            ))),
            None => Err(dangling(heap_ref)),
        }
    }

    /// An array element, `None` when `index` is out of range.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object is not an array.
    pub fn get_array_element(&self, heap_ref: HeapRef, index: usize) -> Result<Option<Value>> {
        let state = read_lock!(self.state);
        match state.objects.get(&heap_ref.id()) {
            Some(HeapObject::Array { elements, .. }) => Ok(elements.get(index).cloned()),
            Some(other) => Err(Error::TypeMismatch(format!(
                "expected array, found {}",
                other.kind()
            ))),
            None => Err(dangling(heap_ref)),
        }
    }

    /// Stores an array element; returns `false` when `index` is out of range.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object is not an array.
    pub fn set_array_element(&self, heap_ref: HeapRef, index: usize, value: Value) -> Result<bool> {
        self.with_object_mut(heap_ref, |object| match object {
            HeapObject::Array { elements, .. } => match elements.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(true)
                }
                None => Ok(false),
            },
            other => Err(Error::TypeMismatch(format!(
                "expected array, found {}",
                other.kind()
            ))),
        })
    }

    /// A field of a class instance; unset fields read as `default`.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object has no fields.
    pub fn get_field(&self, heap_ref: HeapRef, field: Token, default: Value) -> Result<Value> {
        let state = read_lock!(self.state);
        match state.objects.get(&heap_ref.id()) {
            Some(HeapObject::Object { fields, .. }) => {
                Ok(fields.get(&field).cloned().unwrap_or(default))
            }
            Some(HeapObject::Boxed { value, .. }) => value.field(field).cloned(),
            Some(other) => Err(Error::TypeMismatch(format!(
                "{} has no field {field}",
                other.kind()
            ))),
            None => Err(dangling(heap_ref)),
        }
    }

    /// Stores a field of a class instance.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object has no fields.
    pub fn set_field(&self, heap_ref: HeapRef, field: Token, value: Value) -> Result<()> {
        self.with_object_mut(heap_ref, |object| match object {
            HeapObject::Object { fields, .. } => {
                fields.insert(field, value);
                Ok(())
            }
            HeapObject::Boxed { value: payload, .. } => payload.set_field(field, value),
            other => Err(Error::TypeMismatch(format!(
                "{} has no field {field}",
                other.kind()
            ))),
        })
    }

    /// The payload of a boxed value.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object is not a boxed value.
    pub fn unbox(&self, heap_ref: HeapRef) -> Result<(Token, Value)> {
        let state = read_lock!(self.state);
        match state.objects.get(&heap_ref.id()) {
            Some(HeapObject::Boxed { type_token, value }) => Ok((*type_token, (**value).clone())),
            Some(other) => Err(Error::TypeMismatch(format!(
                "expected boxed value, found {}",
                other.kind()
            ))),
            None => Err(dangling(heap_ref)),
        }
    }

    /// Replaces the payload of a boxed value.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the object is not a boxed value.
    pub fn set_boxed(&self, heap_ref: HeapRef, value: Value) -> Result<()> {
        self.with_object_mut(heap_ref, |object| match object {
            HeapObject::Boxed { value: payload, .. } => {
                **payload = value;
                Ok(())
            }
            other => Err(Error::TypeMismatch(format!(
                "expected boxed value, found {}",
                other.kind()
            ))),
        })
    }

    /// The runtime type of an object.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for dangling references.
    pub fn get_type_token(&self, heap_ref: HeapRef, core: &CoreTypes) -> Result<Token> {
        let state = read_lock!(self.state);
        state
            .objects
            .get(&heap_ref.id())
            .map(|object| object.type_token(core))
            .ok_or_else(|| dangling(heap_ref))
    }

    /// Whether `heap_ref` refers to a live object.
    #[must_use]
    pub fn contains(&self, heap_ref: HeapRef) -> bool {
        self.state
            .read()
            .map(|state| state.objects.contains_key(&heap_ref.id()))
            .unwrap_or(false)
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state
            .read()
            .map(|state| state.objects.len())
            .unwrap_or(0)
    }
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new(0)
    }
}

fn dangling(heap_ref: HeapRef) -> Error {
    Error::TypeMismatch(format!("{heap_ref} does not refer to a live object"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> CoreTypes {
        CoreTypes {
            object: Token::new(0x0200_0001),
            value_type: Token::new(0x0200_0002),
            string: Token::new(0x0200_0008),
            int32: Token::new(0x0200_0003),
            int64: Token::new(0x0200_0004),
            double: Token::new(0x0200_0005),
            boolean: Token::new(0x0200_0006),
            char: Token::new(0x0200_0007),
        }
    }

    #[test]
    fn strings_and_types() -> Result<()> {
        let heap = ManagedHeap::default();
        let hello = heap.alloc_string("hello")?;
        assert_eq!(&*heap.get_string(hello)?, "hello");
        assert_eq!(heap.get_type_token(hello, &core())?, core().string);
        assert!(heap.contains(hello));
        assert!(!heap.contains(HeapRef::new(99)));
        assert!(heap.get(HeapRef::new(99)).is_err());
        Ok(())
    }

    #[test]
    fn arrays() -> Result<()> {
        let heap = ManagedHeap::default();
        let array = heap.alloc_array(TypeSig::I4, vec![Value::I4(0); 3])?;
        assert_eq!(heap.get_array_length(array)?, 3);
        assert!(heap.set_array_element(array, 2, Value::I4(9))?);
        assert!(!heap.set_array_element(array, 3, Value::I4(9))?);
        assert_eq!(heap.get_array_element(array, 2)?, Some(Value::I4(9)));
        assert_eq!(heap.get_array_element(array, 5)?, None);
        Ok(())
    }

    #[test]
    fn fields_and_boxes() -> Result<()> {
        let heap = ManagedHeap::default();
        let field = Token::new(0x0400_0001);
        let object = heap.alloc_object(Token::new(0x0200_0010), HashMap::new())?;
        assert_eq!(heap.get_field(object, field, Value::I4(0))?, Value::I4(0));
        heap.set_field(object, field, Value::I4(5))?;
        assert_eq!(heap.get_field(object, field, Value::I4(0))?, Value::I4(5));

        let boxed = heap.alloc_boxed(core().int32, Value::I4(3))?;
        assert_eq!(heap.unbox(boxed)?, (core().int32, Value::I4(3)));
        heap.set_boxed(boxed, Value::I4(4))?;
        assert_eq!(heap.unbox(boxed)?.1, Value::I4(4));
        assert!(heap.get_string(boxed).is_err());
        Ok(())
    }

    #[test]
    fn object_limit() -> Result<()> {
        let heap = ManagedHeap::new(1);
        heap.alloc_string("a")?;
        assert!(heap.alloc_string("b").is_err());
        assert_eq!(heap.object_count(), 1);
        Ok(())
    }
}
