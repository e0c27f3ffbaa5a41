//! Parameter tables.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use rustc_hash::FxHashMap;

use crate::protocol::parameters::{ParameterInfo, ParameterValue};

// ============================================================================
// ParameterRow
// ============================================================================

/// One parameter and its last known value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRow {
    /// Parameter id.
    pub id: String,
    /// Display name, falling back to the id.
    pub name: String,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Last value; the default until the first frame arrives.
    pub value: Option<f64>,
}

impl ParameterRow {
    /// Value rounded to two decimals, or `-` before any value is known.
    #[must_use]
    pub fn display_value(&self) -> String {
        self.value
            .map_or_else(|| "-".to_string(), |value| format!("{value:.2}"))
    }
}

impl From<ParameterInfo> for ParameterRow {
    fn from(info: ParameterInfo) -> Self {
        Self {
            name: info.name.unwrap_or_else(|| info.id.clone()),
            id: info.id,
            min: info.min,
            max: info.max,
            value: info.default,
        }
    }
}

// ============================================================================
// ParameterTable
// ============================================================================

/// Parameters in host order, addressable by id.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    rows: Vec<ParameterRow>,
    index: FxHashMap<String, usize>,
}

impl ParameterTable {
    /// Creates an empty table.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every row. A repeated id keeps its first position.
    pub fn rebuild(&mut self, parameters: Vec<ParameterInfo>) {
        self.clear();
        for info in parameters {
            if self.index.contains_key(&info.id) {
                continue;
            }
            self.index.insert(info.id.clone(), self.rows.len());
            self.rows.push(info.into());
        }
    }

    /// Updates values for known ids; returns how many rows changed.
    pub fn apply(&mut self, values: &[ParameterValue]) -> usize {
        let mut updated = 0;
        for value in values {
            if let Some(&position) = self.index.get(&value.id) {
                self.rows[position].value = Some(value.value);
                updated += 1;
            }
        }
        updated
    }

    /// Removes every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    /// Row for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ParameterRow> {
        self.index.get(id).map(|&position| &self.rows[position])
    }

    /// Rows in host order.
    #[inline]
    #[must_use]
    pub fn rows(&self) -> &[ParameterRow] {
        &self.rows
    }

    /// Number of rows.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if the table has no rows.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for ParameterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.rows {
            writeln!(
                f,
                "{:<32} {:>8} [{:.2}, {:.2}]",
                row.name,
                row.display_value(),
                row.min,
                row.max
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
