use std::collections::BTreeMap;

use crate::{CategoryIndex, Column, ColumnError};

#[derive(Debug, Clone, Default, PartialEq)]
/// A group of columns sharing one event axis, plus the category index
/// describing where each source category lies on that axis.
pub struct ColumnSet {
    columns: BTreeMap<String, Column>,
    category_index: Option<CategoryIndex>,
}

impl ColumnSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from columns and an optional category index,
    /// checking they all agree on the event count.
    pub fn from_parts(
        columns: impl IntoIterator<Item = Column>,
        category_index: Option<CategoryIndex>,
    ) -> Result<Self, ColumnError> {
        let mut set = Self::new();
        if let Some(index) = category_index {
            set.set_category_index(index)?;
        }
        for column in columns {
            set.add_column(column)?;
        }
        Ok(set)
    }

    /// The number of events on the shared axis.
    ///
    /// The category index is authoritative if present, otherwise
    /// the event count of the existing columns is used.
    pub fn rows(&self) -> Option<usize> {
        if let Some(index) = &self.category_index {
            return Some(index.total_rows());
        }
        self.columns.values().next().map(Column::rows)
    }

    /// Adds a new column to the set.
    ///
    /// The column must cover the same number of events as the set and must not
    /// share a name with an existing column. Existing columns and the category
    /// index are left untouched.
    pub fn add_column(&mut self, column: Column) -> Result<(), ColumnError> {
        if self.columns.contains_key(column.name()) {
            return Err(ColumnError::DuplicateColumn(column.name().to_string()));
        }

        if let Some(rows) = self.rows() {
            if column.rows() != rows {
                return Err(ColumnError::length_mismatch(
                    column.name(),
                    format!("column has {} events but the set has {rows}", column.rows()),
                ));
            }
        }

        self.columns.insert(column.name().to_string(), column);
        Ok(())
    }

    /// Attaches a category index to the set, replacing any existing one.
    pub fn set_category_index(&mut self, index: CategoryIndex) -> Result<(), ColumnError> {
        index.validate()?;

        if let Some(column) = self.columns.values().next() {
            if column.rows() != index.total_rows() {
                return Err(ColumnError::length_mismatch(
                    index.name(),
                    format!(
                        "category index covers {} events but column {:?} has {}",
                        index.total_rows(),
                        column.name(),
                        column.rows(),
                    ),
                ));
            }
        }

        self.category_index = Some(index);
        Ok(())
    }

    #[inline]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Iterates over the columns ordered by name.
    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.values()
    }

    /// The column names ordered by name.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    #[inline]
    pub fn category_index(&self) -> Option<&CategoryIndex> {
        self.category_index.as_ref()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Removes a column from the set.
    pub fn remove(&mut self, name: &str) -> Option<Column> {
        self.columns.remove(name)
    }

    pub fn into_parts(self) -> (BTreeMap<String, Column>, Option<CategoryIndex>) {
        (self.columns, self.category_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CategoryMode, ColumnKind, PrimitiveType};

    fn scalar(name: &str, rows: usize) -> Column {
        Column::create(name, ColumnKind::Scalar, PrimitiveType::F32.into(), rows).unwrap()
    }

    #[test]
    fn test_add_column_checks_rows() {
        let mut set = ColumnSet::new();
        set.add_column(scalar("a", 3)).expect("First column sets the axis");
        set.add_column(scalar("b", 3)).expect("Matching rows");

        let err = set.add_column(scalar("c", 4)).expect_err("Row count differs");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }), "got {err:?}");

        let err = set.add_column(scalar("a", 3)).expect_err("Name collision");
        assert!(matches!(err, ColumnError::DuplicateColumn(name) if name == "a"));
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_category_index_is_authoritative() {
        let index = CategoryIndex::build("run", [(1i64, 2), (2, 3)], CategoryMode::Unique).unwrap();
        let mut set = ColumnSet::from_parts([scalar("a", 5)], Some(index.clone())).unwrap();
        assert_eq!(set.rows(), Some(5));

        let err = set.add_column(scalar("b", 2)).expect_err("Must cover every category");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }));

        let before = set.clone();
        set.add_column(scalar("b", 5)).expect("Incremental addition");
        assert_eq!(set.category_index(), Some(&index));
        assert_eq!(set.column("a"), before.column("a"));
    }

    #[test]
    fn test_set_category_index_checks_rows() {
        let index = CategoryIndex::build("run", [(1i64, 2)], CategoryMode::Unique).unwrap();
        let err = ColumnSet::from_parts([scalar("a", 5)], None)
            .unwrap()
            .set_category_index(index)
            .expect_err("Index does not cover the columns");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }));
    }
}
