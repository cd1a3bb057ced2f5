//! Input state handed to the forecast model.

use crate::reference::ReferenceTime;
use ndarray::Array2;
use std::collections::BTreeMap;

/// `(2, N)` array: row 0 is the analysis at `T - 6h`, row 1 the one at `T`.
pub type FieldTensor = Array2<f64>;

pub type FieldMap = BTreeMap<String, FieldTensor>;

#[derive(Debug, Clone, PartialEq)]
pub struct InputState {
    pub date: ReferenceTime,
    pub fields: FieldMap,
}

impl InputState {
    pub fn new(date: ReferenceTime, fields: FieldMap) -> Self {
        Self { date, fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldTensor> {
        self.fields.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of grid points per row, taken from the first field.
    pub fn grid_size(&self) -> Option<usize> {
        self.fields.values().next().map(|tensor| tensor.ncols())
    }
}
