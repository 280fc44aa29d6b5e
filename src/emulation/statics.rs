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

//! Static field storage.
//!
//! Static fields are stored by field token and shared by every thread of a runtime.
//! A field that was never written reads as the zero value of its declared type.

use std::{collections::HashMap, sync::RwLock};

use crate::{emulation::value::Value, metadata::token::Token, Result};

/// Storage for static fields.
#[derive(Debug, Default)]
pub struct StaticFieldStorage {
    fields: RwLock<HashMap<Token, Value>>,
}

impl StaticFieldStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored value of a field, `None` if it was never written.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the storage lock is poisoned.
    pub fn get(&self, field: Token) -> Result<Option<Value>> {
        Ok(read_lock!(self.fields).get(&field).cloned())
    }

    /// Stores a field value.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the storage lock is poisoned.
    pub fn set(&self, field: Token, value: Value) -> Result<()> {
        write_lock!(self.fields).insert(field, value);
        Ok(())
    }

    /// Runs `f` on the stored value of a field, initializing it with `default` first.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the storage lock is poisoned, or whatever
    /// `f` returns.
    pub fn update<F, R>(&self, field: Token, default: Value, f: F) -> Result<R>
    where
        F: FnOnce(&mut Value) -> Result<R>,
    {
        let mut fields = write_lock!(self.fields);
        f(fields.entry(field).or_insert(default))
    }

    /// Number of fields that hold a value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.read().map(|fields| fields.len()).unwrap_or(0)
    }

    /// Whether no field was written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets all stored values.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the storage lock is poisoned.
    pub fn clear(&self) -> Result<()> {
        write_lock!(self.fields).clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_update() -> Result<()> {
        let storage = StaticFieldStorage::new();
        let field = Token::new(0x0400_0001);
        assert_eq!(storage.get(field)?, None);

        storage.set(field, Value::I4(42))?;
        assert_eq!(storage.get(field)?, Some(Value::I4(42)));

        let other = Token::new(0x0400_0002);
        let previous = storage.update(other, Value::I4(1), |value| {
            let previous = value.clone();
            *value = Value::I4(2);
            Ok(previous)
        })?;
        assert_eq!(previous, Value::I4(1));
        assert_eq!(storage.get(other)?, Some(Value::I4(2)));
        assert_eq!(storage.len(), 2);

        storage.clear()?;
        assert!(storage.is_empty());
        Ok(())
    }
}
