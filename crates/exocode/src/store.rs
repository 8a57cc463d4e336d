//! # Code Unit Store
//!
//! Append-only, process-lifetime record of captured code units, keyed by qualified name.
//! A pure lookup table: it knows nothing about how units were found or how they are served.

use dashmap::DashMap;

use crate::unit::CodeUnit;

#[derive(Default)]
pub struct CodeUnitStore {
    units: DashMap<String, CodeUnit>,
}

impl CodeUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a unit. The first capture of a name wins; later captures are ignored so a unit
    /// already shipped to a worker never changes underneath it.
    ///
    /// Returns true if the unit was newly recorded.
    pub fn record(&self, unit: CodeUnit) -> bool {
        match self.units.entry(unit.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::trace!(unit = %unit.name, len = unit.bytes.len(), "captured code unit");
                slot.insert(unit);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<CodeUnit> {
        self.units.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Captured names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
