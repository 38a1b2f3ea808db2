use std::collections::HashSet;
use std::fmt;

use crate::registry::ModelId;

/// Where a session's weights live. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Accelerator device by index, rendered as `cuda:N`.
    Device(usize),
    /// CPU fallback used when no devices exist.
    Cpu,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Device(index) => write!(f, "cuda:{index}"),
            Residency::Cpu => write!(f, "cpu"),
        }
    }
}

/// Device index -> resident model ids. CPU sessions hold no entry.
///
/// Mutated only under the registry mutex, so reservations made while a load
/// is still in flight are already visible to later placement decisions.
pub(crate) struct OccupancyTable {
    devices: Vec<HashSet<ModelId>>,
}

impl OccupancyTable {
    pub(crate) fn new(device_count: usize) -> Self {
        Self {
            devices: (0..device_count).map(|_| HashSet::new()).collect(),
        }
    }

    /// Greedy placement: the lowest empty device if one exists, otherwise the
    /// device with the fewest residents (lowest index on ties), CPU when
    /// there are no devices at all.
    pub(crate) fn place(&self) -> Residency {
        if self.devices.is_empty() {
            return Residency::Cpu;
        }
        if let Some(free) = self.devices.iter().position(HashSet::is_empty) {
            return Residency::Device(free);
        }
        let least_loaded = self
            .devices
            .iter()
            .enumerate()
            .min_by_key(|(_, residents)| residents.len())
            .map(|(index, _)| index)
            .unwrap_or(0);
        Residency::Device(least_loaded)
    }

    pub(crate) fn insert(&mut self, residency: Residency, model_id: &str) {
        if let Residency::Device(index) = residency {
            self.devices[index].insert(model_id.to_string());
        }
    }

    pub(crate) fn remove(&mut self, residency: Residency, model_id: &str) {
        if let Residency::Device(index) = residency {
            self.devices[index].remove(model_id);
        }
    }

    pub(crate) fn is_free(&self, residency: Residency) -> bool {
        match residency {
            Residency::Device(index) => self.devices[index].is_empty(),
            Residency::Cpu => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn residents(&self, index: usize) -> usize {
        self.devices[index].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_prefers_lowest_empty_device() {
        let mut table = OccupancyTable::new(3);
        table.insert(Residency::Device(0), "a");
        assert_eq!(table.place(), Residency::Device(1));
        table.insert(Residency::Device(1), "b");
        assert_eq!(table.place(), Residency::Device(2));
    }

    #[test]
    fn test_place_picks_least_loaded_once_all_occupied() {
        let mut table = OccupancyTable::new(2);
        table.insert(Residency::Device(0), "a");
        table.insert(Residency::Device(0), "b");
        table.insert(Residency::Device(1), "c");
        assert_eq!(table.place(), Residency::Device(1));
    }

    #[test]
    fn test_place_breaks_ties_by_lowest_index() {
        let mut table = OccupancyTable::new(3);
        table.insert(Residency::Device(0), "a");
        table.insert(Residency::Device(1), "b");
        table.insert(Residency::Device(2), "c");
        assert_eq!(table.place(), Residency::Device(0));
    }

    #[test]
    fn test_place_falls_back_to_cpu_without_devices() {
        let table = OccupancyTable::new(0);
        assert_eq!(table.place(), Residency::Cpu);
    }

    #[test]
    fn test_cpu_residency_holds_no_entry() {
        let mut table = OccupancyTable::new(1);
        table.insert(Residency::Cpu, "a");
        assert_eq!(table.residents(0), 0);
        assert_eq!(table.place(), Residency::Device(0));
    }

    #[test]
    fn test_remove_frees_the_device() {
        let mut table = OccupancyTable::new(1);
        table.insert(Residency::Device(0), "a");
        assert!(!table.is_free(Residency::Device(0)));
        table.remove(Residency::Device(0), "a");
        assert!(table.is_free(Residency::Device(0)));
    }

    #[test]
    fn test_residency_display() {
        assert_eq!(Residency::Device(2).to_string(), "cuda:2");
        assert_eq!(Residency::Cpu.to_string(), "cpu");
    }
}
