//! Read access for consumers of a column.
//!
//! This provides a common abstraction over both heap owned and memory
//! mapped columns, neither copies any bytes.

use bytemuck::Pod;

use super::{Column, ColumnKind, IndexRange};
use crate::{AccessMode, ColumnError};

impl Column {
    /// Returns where the column arrays live.
    ///
    /// A column is only reported as [AccessMode::Mapped] if every one
    /// of its arrays is mapped.
    pub fn access_mode(&self) -> AccessMode {
        let all_mapped = [Some(&self.data), self.index.as_ref(), self.valid.as_ref()]
            .into_iter()
            .flatten()
            .all(|array| array.access_mode() == AccessMode::Mapped);
        if all_mapped {
            AccessMode::Mapped
        } else {
            AccessMode::Heap
        }
    }

    /// Returns if the event holds semantically present data.
    ///
    /// Columns without a `valid` array treat every event as valid,
    /// events past the end are never valid.
    pub fn is_valid(&self, event: usize) -> bool {
        if event >= self.rows() {
            return false;
        }
        match &self.valid {
            None => true,
            Some(valid) => valid.as_bytes()[event] != 0,
        }
    }

    /// The number of events flagged as invalid.
    pub fn invalid_count(&self) -> usize {
        self.valid
            .as_ref()
            .map(|valid| valid.as_bytes().iter().filter(|flag| **flag == 0).count())
            .unwrap_or(0)
    }

    /// The index ranges of a vector column.
    pub fn ranges(&self) -> Result<&[IndexRange], ColumnError> {
        let Some(index) = &self.index else {
            return Err(self.kind_mismatch(ColumnKind::Vector));
        };
        index
            .cast::<IndexRange>()
            .map_err(|e| e.for_column(&self.name))
    }

    /// All `data` records viewed as `T`.
    pub fn values_as<T: Pod>(&self) -> Result<&[T], ColumnError> {
        self.data.cast::<T>().map_err(|e| e.for_column(&self.name))
    }

    /// The raw record of event `event` in a scalar column.
    pub fn record(&self, event: usize) -> Result<&[u8], ColumnError> {
        if self.index.is_some() {
            return Err(self.kind_mismatch(ColumnKind::Scalar));
        }
        self.data.record(event).ok_or_else(|| self.event_out_of_range(event))
    }

    /// The raw records of event `event` in a vector column.
    pub fn vector_row(&self, event: usize) -> Result<&[u8], ColumnError> {
        let range = *self
            .ranges()?
            .get(event)
            .ok_or_else(|| self.event_out_of_range(event))?;
        self.data
            .records(range.start as usize..range.stop as usize)
            .ok_or_else(|| {
                ColumnError::out_of_range(
                    &self.name,
                    format!("event {event} range {}..{} is outside data", range.start, range.stop),
                )
            })
    }

    /// The records of event `event` in a vector column viewed as `T`.
    pub fn vector_row_as<T: Pod>(&self, event: usize) -> Result<&[T], ColumnError> {
        let range = *self
            .ranges()?
            .get(event)
            .ok_or_else(|| self.event_out_of_range(event))?;
        let values = self.values_as::<T>()?;
        values
            .get(range.start as usize..range.stop as usize)
            .ok_or_else(|| {
                ColumnError::out_of_range(
                    &self.name,
                    format!("event {event} range {}..{} is outside data", range.start, range.stop),
                )
            })
    }

    fn kind_mismatch(&self, expected: ColumnKind) -> ColumnError {
        ColumnError::KindMismatch {
            column: self.name.clone(),
            expected: match expected {
                ColumnKind::Scalar => "scalar",
                ColumnKind::Vector => "vector",
            },
        }
    }

    fn event_out_of_range(&self, event: usize) -> ColumnError {
        ColumnError::out_of_range(
            &self.name,
            format!("event {event} is past the end of {} events", self.rows()),
        )
    }
}
