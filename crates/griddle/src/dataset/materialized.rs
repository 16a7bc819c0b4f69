use std::sync::Arc;
use crate::protocol::Row;
use super::Dataset;

/// The rows produced by [`Dataset::materialize`].
///
/// Cheap to clone. Nothing here executes any stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedDataset {
    rows: Arc<Vec<Row>>,
}

impl MaterializedDataset {
    pub(crate) fn new(rows: Vec<Row>) -> Self {
        Self { rows: Arc::new(rows) }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// Returns the same rows again without running anything.
    pub fn materialize(&self) -> MaterializedDataset {
        self.clone()
    }

    /// All rows in order.
    pub fn take_all(self) -> Vec<Row> {
        Arc::try_unwrap(self.rows).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    /// Starts a new lazy dataset whose source is these rows.
    pub fn into_dataset(self) -> Dataset {
        Dataset::from_shared(self.rows)
    }
}

impl<'a> IntoIterator for &'a MaterializedDataset {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Row> {
        (0..3).map(|i| Row::new().with("resp", i)).collect()
    }

    #[test]
    fn test_materialize_returns_same_rows() {
        let done = MaterializedDataset::new(rows());
        let again = done.materialize();

        assert_eq!(again, done);
        assert!(Arc::ptr_eq(&again.rows, &done.rows));
    }

    #[test]
    fn test_take_all_with_shared_rows() {
        let done = MaterializedDataset::new(rows());
        let copy = done.clone();

        assert_eq!(done.take_all(), rows());
        assert_eq!(copy.take_all(), rows());
    }

    #[test]
    fn test_into_dataset_starts_fresh_graph() {
        let dataset = MaterializedDataset::new(rows()).into_dataset();
        assert_eq!(dataset.len(), 3);
        assert!(dataset.plan().is_empty());
    }
}
