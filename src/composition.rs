use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::classes::ClassTable;
use crate::errors::{Result, WasteSegError};
use crate::prediction::{foreground_pixels, InstancePredictions};

/// Values keyed by class name, in class-table order.
///
/// Every class of the table is present, detected or not, so charts, exports
/// and storage columns see a stable schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMap<V> {
    entries: Vec<(String, V)>,
}

/// Foreground pixel count per class. Overlapping instances are double-counted.
pub type ClassAreaMap = ClassMap<u64>;

/// Share of total foreground per class, 0–100.
pub type PercentageMap = ClassMap<f64>;

impl<V: Copy + Default> ClassMap<V> {
    /// All classes of `table` at the default value.
    pub fn zeroed(table: &ClassTable) -> Self {
        Self {
            entries: table.names().map(|n| (n.to_string(), V::default())).collect(),
        }
    }
}

impl<V: Copy> ClassMap<V> {
    pub fn from_entries(entries: Vec<(String, V)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<V> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, V)> + '_ {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut V> {
        self.entries.get_mut(index).map(|(_, v)| v)
    }
}

impl ClassAreaMap {
    pub fn total(&self) -> u64 {
        self.values().sum()
    }
}

impl PercentageMap {
    pub fn total(&self) -> f64 {
        self.values().sum()
    }
}

impl<V: Copy + Serialize> Serialize for ClassMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Aggregate instance masks into per-class foreground pixel counts.
///
/// Fails with `ShapeMismatch` when masks and labels are not paired one to one
/// or a label falls outside the class table.
pub fn pixel_area(predictions: &InstancePredictions, table: &ClassTable) -> Result<ClassAreaMap> {
    if !predictions.is_paired() {
        return Err(WasteSegError::shape_mismatch(format!(
            "{} masks but {} class labels",
            predictions.masks.len(),
            predictions.classes.len()
        )));
    }

    let mut area = ClassAreaMap::zeroed(table);
    for (mask, class_index) in predictions.iter() {
        let count = foreground_pixels(mask);
        let slot = area.entry_mut(class_index).ok_or_else(|| {
            WasteSegError::shape_mismatch(format!(
                "class index {} outside class table of {}",
                class_index,
                table.len()
            ))
        })?;
        *slot += count;
    }

    Ok(area)
}

/// Each class's share of the total, ×100. A zero total yields all zeros.
pub fn percentage(area: &ClassAreaMap) -> PercentageMap {
    let total = area.total();
    let entries = area
        .iter()
        .map(|(name, count)| {
            let share = if total > 0 {
                count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            (name.to_string(), share)
        })
        .collect();
    PercentageMap::from_entries(entries)
}

/// Class with the largest share. Ties resolve to the class that comes first
/// in table order. `None` only for an empty map.
pub fn dominant(percentages: &PercentageMap) -> Option<&str> {
    let mut best: Option<(&str, f64)> = None;
    for (name, value) in percentages.iter() {
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((name, value)),
        }
    }
    best.map(|(name, _)| name)
}
