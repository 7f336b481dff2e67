// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    error::{Error, Result},
    value::Value,
};
use std::collections::HashMap;

/// Interning table mapping leaf nodes to a dense index space.
///
/// Kernels read every input through this index space, so the registry is
/// what lets structurally identical residuals with different leaves share
/// one compiled kernel. Deduplication rules:
///
/// * constants merge by exact `f64` equality (bit pattern),
/// * named variables merge by name,
/// * unnamed variables merge by node identity.
///
/// Ids are stable for the lifetime of the registry and index the dense data
/// image returned by [`ValueRegistry::data_array`].
pub struct ValueRegistry {
    entries: Vec<Value>,
    data: Vec<f64>,
    by_identity: HashMap<usize, u32>,
    by_name: HashMap<String, u32>,
    by_constant: HashMap<u64, u32>,
}

impl Default for ValueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueRegistry {
    pub fn new() -> Self {
        ValueRegistry {
            entries: Vec::new(),
            data: Vec::new(),
            by_identity: HashMap::new(),
            by_name: HashMap::new(),
            by_constant: HashMap::new(),
        }
    }

    /// Intern a leaf and return its dense id. Re-registering a leaf (or a
    /// distinct leaf that deduplicates with a registered one) returns the
    /// existing id.
    pub fn register(&mut self, leaf: &Value) -> Result<u32> {
        if !leaf.is_leaf() {
            return Err(Error::registry_lookup(
                func_name!(),
                "only leaf nodes can be registered",
            ));
        }
        if let Some(id) = self.lookup(leaf) {
            return Ok(id);
        }
        let id = self.entries.len() as u32;
        if !leaf.requires_grad() {
            self.by_constant.insert(leaf.data().to_bits(), id);
        } else if let Some(name) = leaf.name() {
            self.by_name.insert(name.to_string(), id);
        } else {
            self.by_identity.insert(leaf.key(), id);
        }
        self.entries.push(leaf.clone());
        self.data.push(leaf.data());
        Ok(id)
    }

    /// The id of a registered leaf, if any, honoring the deduplication rules.
    pub fn lookup(&self, leaf: &Value) -> Option<u32> {
        if !leaf.requires_grad() {
            return self.by_constant.get(&leaf.data().to_bits()).copied();
        }
        if let Some(name) = leaf.name() {
            return self.by_name.get(name).copied();
        }
        self.by_identity.get(&leaf.key()).copied()
    }

    /// The id of a registered leaf, as an error when absent.
    pub fn id_of(&self, leaf: &Value) -> Result<u32> {
        self.lookup(leaf)
            .ok_or_else(|| Error::registry_lookup(func_name!(), "value is not registered"))
    }

    /// The leaf registered under `id`.
    pub fn value(&self, id: u32) -> Option<&Value> {
        self.entries.get(id as usize)
    }

    /// Dense snapshot of leaf data, indexed by id.
    pub fn data_array(&self) -> &[f64] {
        &self.data
    }

    /// Overwrite one slot of the dense data image.
    pub fn set(&mut self, id: u32, value: f64) -> Result<()> {
        match self.data.get_mut(id as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::registry_lookup(func_name!(), "id out of range")),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ValueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueRegistry")
            .field("len", &self.entries.len())
            .field("constants", &self.by_constant.len())
            .field("named", &self.by_name.len())
            .finish()
    }
}
