//! Single writer build operations used by producers while filling a column.

use std::mem;

use bytemuck::Pod;

use super::{Column, IndexRange};
use crate::{ColumnError, TypedArray};

impl Column {
    /// Attaches a `valid` array marking every event as valid.
    ///
    /// Does nothing if the column already tracks validity.
    pub fn with_validity(mut self) -> Self {
        if self.valid.is_none() {
            self.valid = Some(TypedArray::all_valid(self.rows()));
        }
        self
    }

    /// Appends the raw `records` of event `event` to `data` and points the
    /// event's index range at them.
    ///
    /// Events must be appended in strictly increasing order, each at most once.
    /// Events which are skipped keep an empty range.
    pub fn append_vector_rows(&mut self, event: usize, records: &[u8]) -> Result<(), ColumnError> {
        let rows = self.rows();
        let Some(index) = self.index.as_mut() else {
            return Err(ColumnError::KindMismatch {
                column: self.name.clone(),
                expected: "vector",
            });
        };

        if event >= rows {
            return Err(ColumnError::out_of_range(
                &self.name,
                format!("event {event} is past the last event {}", rows.saturating_sub(1)),
            ));
        }
        if event < self.next_append {
            return Err(ColumnError::AppendOrder {
                column: self.name.clone(),
                event,
                next: self.next_append,
            });
        }

        let start = self.data.len();
        self.data
            .push_bytes(records)
            .map_err(|e| e.for_column(&self.name))?;
        let stop = self.data.len();

        let ranges = index
            .cast_mut::<IndexRange>()
            .map_err(|e| e.for_column(&self.name))?;
        ranges[self.next_append..event].fill(IndexRange::new(start, start));
        ranges[event] = IndexRange::new(start, stop);
        self.next_append = event + 1;

        Ok(())
    }

    /// Typed variant of [Self::append_vector_rows].
    pub fn append_vector_rows_as<T: Pod>(
        &mut self,
        event: usize,
        records: &[T],
    ) -> Result<(), ColumnError> {
        self.check_record_size::<T>()?;
        self.append_vector_rows(event, bytemuck::cast_slice(records))
    }

    /// Writes the raw record of event `event` in a scalar column.
    pub fn set_scalar_row(&mut self, event: usize, record: &[u8]) -> Result<(), ColumnError> {
        if self.index.is_some() {
            return Err(ColumnError::KindMismatch {
                column: self.name.clone(),
                expected: "scalar",
            });
        }

        let record_size = self.data.record_size();
        if record.len() != record_size {
            return Err(ColumnError::length_mismatch(
                &self.name,
                format!("record is {} bytes, expected {record_size}", record.len()),
            ));
        }

        let rows = self.rows();
        if event >= rows {
            return Err(ColumnError::out_of_range(
                &self.name,
                format!("event {event} is past the last event {}", rows.saturating_sub(1)),
            ));
        }

        let start = event * record_size;
        self.data.as_bytes_mut()[start..start + record_size].copy_from_slice(record);
        Ok(())
    }

    /// Typed variant of [Self::set_scalar_row].
    pub fn set_scalar_row_as<T: Pod>(&mut self, event: usize, record: &T) -> Result<(), ColumnError> {
        self.check_record_size::<T>()?;
        self.set_scalar_row(event, bytemuck::bytes_of(record))
    }

    /// Marks event `event` as semantically absent.
    ///
    /// The data slot remains in place.
    pub fn mark_invalid(&mut self, event: usize) -> Result<(), ColumnError> {
        let rows = self.rows();
        let Some(valid) = self.valid.as_mut() else {
            return Err(ColumnError::NoValidityTracking(self.name.clone()));
        };

        if event >= rows {
            return Err(ColumnError::out_of_range(
                &self.name,
                format!("event {event} is past the last event {}", rows.saturating_sub(1)),
            ));
        }

        valid.as_bytes_mut()[event] = 0;
        Ok(())
    }

    fn check_record_size<T: Pod>(&self) -> Result<(), ColumnError> {
        let record_size = self.data.record_size();
        if mem::size_of::<T>() != record_size {
            return Err(ColumnError::layout(
                &self.name,
                format!(
                    "{} is {} bytes but records are {record_size} bytes",
                    std::any::type_name::<T>(),
                    mem::size_of::<T>(),
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Column, ColumnError, ColumnKind, IndexRange, PrimitiveType};

    fn vector_column(rows: usize) -> Column {
        Column::create("pulses", ColumnKind::Vector, PrimitiveType::I64.into(), rows).unwrap()
    }

    #[test]
    fn test_append_vector_rows() {
        let mut column = vector_column(3);
        column.append_vector_rows_as(0, &[1i64, 2]).expect("Append event 0");
        column.append_vector_rows_as::<i64>(1, &[]).expect("Append event 1");
        column.append_vector_rows_as(2, &[3i64, 4, 5]).expect("Append event 2");

        assert_eq!(column.values_as::<i64>().unwrap(), &[1, 2, 3, 4, 5]);
        assert_eq!(
            column.ranges().unwrap(),
            &[IndexRange::new(0, 2), IndexRange::new(2, 2), IndexRange::new(2, 5)],
        );
        column.validate().expect("Column should be valid");
    }

    #[test]
    fn test_append_skipped_events_get_empty_ranges() {
        let mut column = vector_column(4);
        column.append_vector_rows_as(0, &[1i64]).unwrap();
        column.append_vector_rows_as(3, &[2i64, 3]).unwrap();

        assert_eq!(
            column.ranges().unwrap(),
            &[
                IndexRange::new(0, 1),
                IndexRange::new(1, 1),
                IndexRange::new(1, 1),
                IndexRange::new(1, 3),
            ],
        );
        column.validate().expect("Column should be valid");
    }

    #[rstest::rstest]
    #[case(1)]
    #[case(0)]
    fn test_append_out_of_order_is_rejected(#[case] event: usize) {
        let mut column = vector_column(3);
        column.append_vector_rows_as(1, &[1i64]).unwrap();

        let err = column
            .append_vector_rows_as(event, &[2i64])
            .expect_err("Event was already passed");
        assert!(matches!(err, ColumnError::AppendOrder { next: 2, .. }), "got {err:?}");
        assert_eq!(column.data().len(), 1, "Rejected rows must not be appended");
    }

    #[test]
    fn test_append_past_end_is_rejected() {
        let mut column = vector_column(2);
        let err = column.append_vector_rows_as(2, &[1i64]).expect_err("No such event");
        assert!(matches!(err, ColumnError::IndexOutOfRange { .. }), "got {err:?}");
    }

    #[test]
    fn test_append_partial_record_is_rejected() {
        let mut column = vector_column(2);
        let err = column.append_vector_rows(0, &[1, 2, 3]).expect_err("Partial record");
        match err {
            ColumnError::LengthMismatch { column, .. } => assert_eq!(column, "pulses"),
            other => panic!("Expected length mismatch got {other:?}"),
        }
    }

    #[test]
    fn test_append_to_scalar_is_rejected() {
        let mut column = Column::create("e", ColumnKind::Scalar, PrimitiveType::I64.into(), 2).unwrap();
        let err = column.append_vector_rows_as(0, &[1i64]).expect_err("Scalar column");
        assert!(matches!(err, ColumnError::KindMismatch { expected: "vector", .. }));
    }

    #[test]
    fn test_set_scalar_rows() {
        let mut column = Column::create("e", ColumnKind::Scalar, PrimitiveType::F32.into(), 3).unwrap();
        column.set_scalar_row_as(0, &1.5f32).unwrap();
        column.set_scalar_row_as(2, &-2.0f32).unwrap();
        assert_eq!(column.values_as::<f32>().unwrap(), &[1.5, 0.0, -2.0]);

        let err = column.set_scalar_row_as(3, &0.0f32).expect_err("No such event");
        assert!(matches!(err, ColumnError::IndexOutOfRange { .. }));
        let err = column.set_scalar_row(0, &[0, 0]).expect_err("Wrong record size");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }));
    }

    #[test]
    fn test_mark_invalid() {
        let mut column = Column::create("e", ColumnKind::Scalar, PrimitiveType::U8.into(), 3)
            .unwrap()
            .with_validity();
        column.mark_invalid(1).expect("Mark event invalid");

        assert!(column.is_valid(0));
        assert!(!column.is_valid(1));
        assert!(column.is_valid(2));
        assert_eq!(column.data().len(), 3, "Data slot must remain");
    }

    #[test]
    fn test_mark_invalid_without_validity() {
        let mut column = Column::create("e", ColumnKind::Scalar, PrimitiveType::U8.into(), 3).unwrap();
        let err = column.mark_invalid(0).expect_err("No validity tracking");
        match err {
            ColumnError::NoValidityTracking(name) => assert_eq!(name, "e"),
            other => panic!("Expected no validity tracking got {other:?}"),
        }
    }
}
