// Copyright (c) 2024 Mike Tsao

//! Identifiers for modules and cables, and the factories that mint them.

use core::sync::atomic::{AtomicI64, Ordering};
use core::{hash::Hash, marker::PhantomData};
use serde::{Deserialize, Serialize};
use synonym::Synonym;

/// Identifies a module for the lifetime of a process. Patch files carry these
/// ids, so they also survive serialization.
#[derive(Synonym, Serialize, Deserialize, Eq, PartialEq)]
#[synonym(skip(PartialEq))]
pub struct ModuleId(pub i64);
impl ModuleId {
    /// The id of no module. A [ParamHandle](crate::engine::ParamHandle) whose
    /// module id is [ModuleId::UNSET] is unbound.
    pub const UNSET: ModuleId = ModuleId(-1);
}
impl IsId for ModuleId {
    fn as_i64(&self) -> i64 {
        self.0
    }
}

/// Identifies a cable.
#[derive(Synonym, Serialize, Deserialize, Eq, PartialEq)]
#[synonym(skip(PartialEq))]
pub struct CableId(pub i64);
impl IsId for CableId {
    fn as_i64(&self) -> i64 {
        self.0
    }
}

/// An id newtype that an [IdFactory] knows how to mint.
pub trait IsId: Eq + Hash + Clone + From<i64> {
    /// Returns the raw id.
    fn as_i64(&self) -> i64;
}

/// Mints unique ids. Minting is a single atomic increment, so any thread may
/// mint.
#[derive(Debug)]
pub struct IdFactory<T: IsId> {
    next_id_value: AtomicI64,
    _phantom: PhantomData<T>,
}
impl<T: IsId> Default for IdFactory<T> {
    fn default() -> Self {
        Self {
            next_id_value: AtomicI64::new(0),
            _phantom: Default::default(),
        }
    }
}
impl<T: IsId> IdFactory<T> {
    /// Mints the next unique id.
    pub fn mint_next(&self) -> T {
        let id_value = self.next_id_value.fetch_add(1, Ordering::Relaxed);
        T::from(id_value)
    }

    /// Tells the factory about an id that was chosen elsewhere, typically by a
    /// deserialized patch or by a caller that supplied an explicit id. The
    /// factory adjusts itself so that it never mints a duplicate of any id it
    /// has been told about.
    pub fn notify_externally_minted_id(&self, id: &T) {
        if id.as_i64() >= self.next_id_value.load(Ordering::Relaxed) {
            self.next_id_value.store(id.as_i64() + 1, Ordering::Relaxed);
        }
    }
}
