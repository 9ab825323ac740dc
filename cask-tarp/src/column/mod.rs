mod access;
mod build;

use std::fmt::{Display, Formatter};

use bytemuck::{Pod, Zeroable};

use crate::{ColumnError, ElementLayout, TypedArray};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The shape of a column.
pub enum ColumnKind {
    /// One `data` record per event.
    Scalar,
    /// A variable number of `data` records per event addressed by `index`.
    Vector,
}

impl Display for ColumnKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Vector => write!(f, "vector"),
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
/// A half open `[start, stop)` range of records within a vector column's `data`.
///
/// Matches the layout returned by [ElementLayout::index_range].
pub struct IndexRange {
    pub start: u64,
    pub stop: u64,
}

impl IndexRange {
    #[inline]
    pub fn new(start: usize, stop: usize) -> Self {
        Self {
            start: start as u64,
            stop: stop as u64,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.stop - self.start) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }
}

#[derive(Debug, Clone)]
/// A named event level feature made of up to three typed arrays.
///
/// | arrays                  | meaning                        |
/// |-------------------------|--------------------------------|
/// | `data`                  | scalar without validity        |
/// | `data`, `valid`         | scalar with validity           |
/// | `data`, `index`         | vector without validity        |
/// | `data`, `index`, `valid`| vector with validity           |
pub struct Column {
    name: String,
    data: TypedArray,
    index: Option<TypedArray>,
    valid: Option<TypedArray>,
    /// The first event which may still receive vector rows in the current build pass.
    next_append: usize,
}

impl Column {
    /// Creates a new, empty column ready to be filled by a producer.
    ///
    /// Scalar columns get `rows` zeroed records, vector columns get an
    /// empty `data` array and `rows` empty `(0, 0)` index ranges.
    ///
    /// A [ElementLayout::VarLen] layout is accepted for vector columns and
    /// describes the per event records.
    pub fn create(
        name: impl Into<String>,
        kind: ColumnKind,
        layout: ElementLayout,
        rows: usize,
    ) -> Result<Self, ColumnError> {
        let name = name.into();
        let layout = match (kind, layout) {
            (ColumnKind::Vector, ElementLayout::VarLen(element)) => *element,
            (_, layout) => layout,
        };
        layout.validate(&name)?;

        let (data, index) = match kind {
            ColumnKind::Scalar => (TypedArray::zeroed(layout, rows), None),
            ColumnKind::Vector => (
                TypedArray::zeroed(layout, 0),
                Some(TypedArray::zeroed(ElementLayout::index_range(), rows)),
            ),
        };

        Ok(Self {
            data: data.map_err(|e| e.for_column(&name))?,
            index: index.transpose().map_err(|e| e.for_column(&name))?,
            valid: None,
            next_append: 0,
            name,
        })
    }

    /// Assembles a column from existing arrays, checking all invariants.
    ///
    /// Columns created this way are complete, vector rows can no
    /// longer be appended to them.
    pub fn from_parts(
        name: impl Into<String>,
        data: TypedArray,
        index: Option<TypedArray>,
        valid: Option<TypedArray>,
    ) -> Result<Self, ColumnError> {
        let mut column = Self {
            name: name.into(),
            data,
            index,
            valid,
            next_append: 0,
        };
        column.validate()?;
        column.next_append = column.rows();
        Ok(column)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ColumnKind {
        if self.index.is_some() {
            ColumnKind::Vector
        } else {
            ColumnKind::Scalar
        }
    }

    #[inline]
    /// The number of events in the column.
    pub fn rows(&self) -> usize {
        match &self.index {
            Some(index) => index.len(),
            None => self.data.len(),
        }
    }

    #[inline]
    /// The layout of the `data` records.
    pub fn layout(&self) -> &ElementLayout {
        self.data.layout()
    }

    #[inline]
    pub fn data(&self) -> &TypedArray {
        &self.data
    }

    #[inline]
    pub fn index(&self) -> Option<&TypedArray> {
        self.index.as_ref()
    }

    #[inline]
    pub fn valid(&self) -> Option<&TypedArray> {
        self.valid.as_ref()
    }

    /// Checks the column invariants.
    ///
    /// - `valid`, if present, holds one `bool` per event.
    /// - `index`, if present, holds one range per event, each within `data`,
    ///   with non-empty ranges ordered and non-overlapping.
    pub fn validate(&self) -> Result<(), ColumnError> {
        let rows = self.rows();

        if let Some(valid) = &self.valid {
            if valid.layout() != &ElementLayout::validity() {
                return Err(ColumnError::layout(
                    &self.name,
                    format!("valid array has layout {} expected Bool", valid.layout()),
                ));
            }
            if valid.len() != rows {
                return Err(ColumnError::length_mismatch(
                    &self.name,
                    format!("valid has {} entries for {rows} events", valid.len()),
                ));
            }
        }

        let Some(index) = &self.index else { return Ok(()) };
        if index.layout() != &ElementLayout::index_range() {
            return Err(ColumnError::layout(
                &self.name,
                format!("index array has layout {}", index.layout()),
            ));
        }

        let data_len = self.data.len() as u64;
        let ranges = index
            .cast::<IndexRange>()
            .map_err(|e| e.for_column(&self.name))?;

        let mut prev_stop = 0;
        for (event, range) in ranges.iter().enumerate() {
            if range.start > range.stop || range.stop > data_len {
                return Err(ColumnError::out_of_range(
                    &self.name,
                    format!(
                        "event {event} has range {}..{} but data has {data_len} records",
                        range.start, range.stop,
                    ),
                ));
            }
            if range.is_empty() {
                continue;
            }
            if range.start < prev_stop {
                return Err(ColumnError::out_of_range(
                    &self.name,
                    format!(
                        "event {event} range {}..{} overlaps the previous range ending at {prev_stop}",
                        range.start, range.stop,
                    ),
                ));
            }
            prev_stop = range.stop;
        }

        Ok(())
    }

    /// Returns a copy of the column with every array owned on the heap.
    pub fn to_heap(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.to_heap(),
            index: self.index.as_ref().map(TypedArray::to_heap),
            valid: self.valid.as_ref().map(TypedArray::to_heap),
            next_append: self.next_append,
        }
    }
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.data == other.data
            && self.index == other.index
            && self.valid == other.valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Field, PrimitiveType};

    #[test]
    fn test_create_scalar() {
        let column = Column::create("energy", ColumnKind::Scalar, PrimitiveType::F64.into(), 4)
            .expect("Create column");
        assert_eq!(column.kind(), ColumnKind::Scalar);
        assert_eq!(column.rows(), 4);
        assert_eq!(column.data().len(), 4);
        assert!(column.index().is_none());
        assert!(column.valid().is_none());
        column.validate().expect("Column should be valid");
    }

    #[test]
    fn test_create_vector() {
        let column = Column::create("pulses", ColumnKind::Vector, PrimitiveType::F32.into(), 3)
            .expect("Create column");
        assert_eq!(column.kind(), ColumnKind::Vector);
        assert_eq!(column.rows(), 3);
        assert_eq!(column.data().len(), 0);
        assert_eq!(column.ranges().unwrap(), &[IndexRange::default(); 3]);
        column.validate().expect("Column should be valid");
    }

    #[test]
    fn test_create_vector_from_var_len_layout() {
        let layout = ElementLayout::VarLen(Box::new(PrimitiveType::U32.into()));
        let column = Column::create("hits", ColumnKind::Vector, layout, 2).expect("Create column");
        assert_eq!(column.layout(), &ElementLayout::Primitive(PrimitiveType::U32));
    }

    #[rstest::rstest]
    #[case(ColumnKind::Scalar, ElementLayout::VarLen(Box::new(PrimitiveType::U32.into())))]
    #[case(
        ColumnKind::Vector,
        ElementLayout::Struct(vec![
            Field::new("time", PrimitiveType::F64.into()),
            Field::new("charges", ElementLayout::VarLen(Box::new(PrimitiveType::F32.into()))),
        ])
    )]
    #[case(
        ColumnKind::Vector,
        ElementLayout::VarLen(Box::new(ElementLayout::VarLen(Box::new(PrimitiveType::F32.into()))))
    )]
    fn test_create_nested_var_len_is_rejected(#[case] kind: ColumnKind, #[case] layout: ElementLayout) {
        let err = Column::create("bad", kind, layout, 1).expect_err("Layout should be rejected");
        match err {
            ColumnError::Layout { column, .. } => assert_eq!(column, "bad"),
            other => panic!("Expected layout error got {other:?}"),
        }
    }

    #[test]
    fn test_from_parts_rejects_out_of_range_index() {
        let data = TypedArray::from_pod(PrimitiveType::U8.into(), &[1u8, 2, 3]).unwrap();
        let index = TypedArray::from_pod(
            ElementLayout::index_range(),
            &[IndexRange::new(0, 2), IndexRange::new(2, 4)],
        )
        .unwrap();

        let err = Column::from_parts("hits", data, Some(index), None)
            .expect_err("Range past the end of data should be rejected");
        assert!(matches!(err, ColumnError::IndexOutOfRange { .. }), "got {err:?}");
    }

    #[test]
    fn test_from_parts_rejects_overlapping_ranges() {
        let data = TypedArray::from_pod(PrimitiveType::U8.into(), &[1u8, 2, 3]).unwrap();
        let index = TypedArray::from_pod(
            ElementLayout::index_range(),
            &[IndexRange::new(0, 2), IndexRange::new(1, 3)],
        )
        .unwrap();

        let err = Column::from_parts("hits", data, Some(index), None)
            .expect_err("Overlapping ranges should be rejected");
        assert!(matches!(err, ColumnError::IndexOutOfRange { .. }), "got {err:?}");
    }

    #[test]
    fn test_from_parts_allows_gaps() {
        let data = TypedArray::from_pod(PrimitiveType::U8.into(), &[1u8, 2, 3, 4]).unwrap();
        let index = TypedArray::from_pod(
            ElementLayout::index_range(),
            &[IndexRange::new(0, 1), IndexRange::new(0, 0), IndexRange::new(3, 4)],
        )
        .unwrap();

        let column = Column::from_parts("hits", data, Some(index), None).expect("Gaps are legal");
        assert_eq!(column.rows(), 3);
    }

    #[test]
    fn test_from_parts_rejects_short_valid() {
        let data = TypedArray::from_pod(PrimitiveType::I32.into(), &[1i32, 2, 3]).unwrap();
        let valid = TypedArray::from_bytes(ElementLayout::validity(), &[1, 0]).unwrap();

        let err = Column::from_parts("x", data, None, Some(valid))
            .expect_err("Valid length must match");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }), "got {err:?}");
    }

    #[test]
    fn test_from_parts_rejects_wrong_valid_layout() {
        let data = TypedArray::from_pod(PrimitiveType::I32.into(), &[1i32, 2]).unwrap();
        let valid = TypedArray::from_pod(PrimitiveType::U16.into(), &[1u16, 1]).unwrap();

        let err = Column::from_parts("x", data, None, Some(valid))
            .expect_err("Valid layout must be bool");
        assert!(matches!(err, ColumnError::Layout { .. }), "got {err:?}");
    }
}
