//! Typed arrays, the atomic storage unit of every column.
//!
//! A [TypedArray] is a flat run of fixed size records described by an
//! [ElementLayout]. The bytes either live in an owned heap buffer or
//! in a shared, read-only memory map of an array file.

use std::fmt::{Debug, Formatter};
use std::mem;
use std::ops::Range;
use std::sync::Arc;

use bytemuck::Pod;
use memmap2::Mmap;

use crate::{ColumnError, ElementLayout, PrimitiveType};

const WORD_SIZE: usize = mem::size_of::<u64>();
const ARRAY_LABEL: &str = "array";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Where the bytes of a [TypedArray] currently live.
pub enum AccessMode {
    /// Owned memory, fully materialised.
    Heap,
    /// Borrowed from a shared memory map of the file on disk.
    Mapped,
}

#[derive(Clone, Default)]
/// A growable byte buffer whose start is always 8 byte aligned.
///
/// This allows any record type with an alignment of 8 or lower to be
/// viewed in place via [bytemuck].
pub struct AlignedBuf {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuf {
    /// Creates a buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_SIZE)],
            len,
        }
    }

    /// Creates an empty buffer able to hold `capacity` bytes without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity.div_ceil(WORD_SIZE)),
            len: 0,
        }
    }

    /// Creates a new buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.as_bytes_mut().copy_from_slice(bytes);
        buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..len]
    }

    /// Resizes the buffer, new bytes are zeroed.
    pub fn resize(&mut self, len: usize) {
        let old_len = self.len;
        self.words.resize(len.div_ceil(WORD_SIZE), 0);
        if len > old_len {
            bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[old_len..len].fill(0);
        }
        self.len = len;
    }

    /// Appends the given bytes to the end of the buffer.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let start = self.len;
        self.resize(start + bytes.len());
        self.as_bytes_mut()[start..].copy_from_slice(bytes);
    }
}

impl Debug for AlignedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AlignedBuf(len={})", self.len)
    }
}

#[derive(Clone)]
enum Storage {
    Heap { buf: AlignedBuf, offset: usize },
    Mapped { map: Arc<Mmap>, offset: usize },
}

#[derive(Clone)]
/// A flat array of fixed layout records.
pub struct TypedArray {
    layout: ElementLayout,
    record_size: usize,
    rows: usize,
    storage: Storage,
}

impl TypedArray {
    /// Creates an array of `rows` zeroed records.
    pub fn zeroed(layout: ElementLayout, rows: usize) -> Result<Self, ColumnError> {
        let record_size = record_size_of(&layout)?;
        let len = region_len(rows, record_size)?;
        Ok(Self {
            layout,
            record_size,
            rows,
            storage: Storage::Heap {
                buf: AlignedBuf::zeroed(len),
                offset: 0,
            },
        })
    }

    /// Creates a `bool` validity array marking all `rows` events as valid.
    pub(crate) fn all_valid(rows: usize) -> Self {
        let mut buf = AlignedBuf::zeroed(rows);
        buf.as_bytes_mut().fill(1);
        Self {
            layout: ElementLayout::validity(),
            record_size: PrimitiveType::Bool.size(),
            rows,
            storage: Storage::Heap { buf, offset: 0 },
        }
    }

    /// Creates an array by copying the raw little-endian record bytes.
    pub fn from_bytes(layout: ElementLayout, bytes: &[u8]) -> Result<Self, ColumnError> {
        let record_size = record_size_of(&layout)?;
        let rows = whole_records(bytes.len(), record_size)?;
        Ok(Self {
            layout,
            record_size,
            rows,
            storage: Storage::Heap {
                buf: AlignedBuf::from_bytes(bytes),
                offset: 0,
            },
        })
    }

    /// Creates an array by copying a slice of plain records.
    ///
    /// The size of `T` must match the size of the layout.
    pub fn from_pod<T: Pod>(layout: ElementLayout, values: &[T]) -> Result<Self, ColumnError> {
        check_pod_size::<T>(&layout)?;
        Self::from_bytes(layout, bytemuck::cast_slice(values))
    }

    /// Wraps an existing heap buffer holding `rows` records starting at `offset`.
    pub fn from_heap(
        layout: ElementLayout,
        rows: usize,
        buf: AlignedBuf,
        offset: usize,
    ) -> Result<Self, ColumnError> {
        let record_size = record_size_of(&layout)?;
        check_region(offset, region_len(rows, record_size)?, buf.len())?;
        Ok(Self {
            layout,
            record_size,
            rows,
            storage: Storage::Heap { buf, offset },
        })
    }

    /// Wraps a region of a shared memory map holding `rows` records starting at `offset`.
    ///
    /// No bytes are copied, the array keeps the map alive.
    pub fn from_mapped(
        layout: ElementLayout,
        rows: usize,
        map: Arc<Mmap>,
        offset: usize,
    ) -> Result<Self, ColumnError> {
        let record_size = record_size_of(&layout)?;
        check_region(offset, region_len(rows, record_size)?, map.len())?;
        Ok(Self {
            layout,
            record_size,
            rows,
            storage: Storage::Mapped { map, offset },
        })
    }

    #[inline]
    pub fn layout(&self) -> &ElementLayout {
        &self.layout
    }

    #[inline]
    /// The size of a single record in bytes.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    #[inline]
    /// The number of records in the array.
    pub fn len(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Returns where the array bytes currently live.
    pub fn access_mode(&self) -> AccessMode {
        match self.storage {
            Storage::Heap { .. } => AccessMode::Heap,
            Storage::Mapped { .. } => AccessMode::Mapped,
        }
    }

    /// The raw record bytes of the whole array.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.rows * self.record_size;
        match &self.storage {
            Storage::Heap { buf, offset } => &buf.as_bytes()[*offset..*offset + len],
            Storage::Mapped { map, offset } => &map[*offset..*offset + len],
        }
    }

    /// The raw bytes of record `row`.
    pub fn record(&self, row: usize) -> Option<&[u8]> {
        self.records(row..row + 1)
    }

    /// The raw bytes of the records in `rows`.
    pub fn records(&self, rows: Range<usize>) -> Option<&[u8]> {
        if rows.start > rows.end || rows.end > self.rows {
            return None;
        }
        let bytes = self.as_bytes();
        Some(&bytes[rows.start * self.record_size..rows.end * self.record_size])
    }

    /// Views the array in place as a slice of `T`.
    pub fn cast<T: Pod>(&self) -> Result<&[T], ColumnError> {
        check_pod_size::<T>(&self.layout)?;
        bytemuck::try_cast_slice(self.as_bytes()).map_err(|e| {
            ColumnError::layout(
                ARRAY_LABEL,
                format!("cannot view records as {}: {e:?}", std::any::type_name::<T>()),
            )
        })
    }

    /// Mutably views the array as a slice of `T`.
    ///
    /// Mapped arrays are copied onto the heap first.
    pub fn cast_mut<T: Pod>(&mut self) -> Result<&mut [T], ColumnError> {
        check_pod_size::<T>(&self.layout)?;
        bytemuck::try_cast_slice_mut(self.as_bytes_mut()).map_err(|e| {
            ColumnError::layout(
                ARRAY_LABEL,
                format!("cannot view records as {}: {e:?}", std::any::type_name::<T>()),
            )
        })
    }

    /// Mutable access to the raw record bytes.
    ///
    /// Mapped arrays are copied onto the heap first.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.rows * self.record_size;
        &mut self.owned_buf().as_bytes_mut()[..len]
    }

    /// Appends whole records to the end of the array.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), ColumnError> {
        let added = whole_records(bytes.len(), self.record_size)?;
        self.owned_buf().extend_from_slice(bytes);
        self.rows += added;
        Ok(())
    }

    /// Returns a fully materialised copy of the array.
    pub fn to_heap(&self) -> Self {
        Self {
            layout: self.layout.clone(),
            record_size: self.record_size,
            rows: self.rows,
            storage: Storage::Heap {
                buf: AlignedBuf::from_bytes(self.as_bytes()),
                offset: 0,
            },
        }
    }

    /// Ensures the array owns a heap buffer which starts at the first record
    /// and contains nothing past the last one.
    fn owned_buf(&mut self) -> &mut AlignedBuf {
        let len = self.rows * self.record_size;
        let is_exact = matches!(
            &self.storage,
            Storage::Heap { buf, offset: 0 } if buf.len() == len
        );
        if !is_exact {
            self.storage = Storage::Heap {
                buf: AlignedBuf::from_bytes(self.as_bytes()),
                offset: 0,
            };
        }

        match &mut self.storage {
            Storage::Heap { buf, .. } => buf,
            Storage::Mapped { .. } => unreachable!("storage was converted to the heap"),
        }
    }
}

impl PartialEq for TypedArray {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout && self.as_bytes() == other.as_bytes()
    }
}

impl Debug for TypedArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedArray")
            .field("layout", &self.layout.to_string())
            .field("rows", &self.rows)
            .field("mode", &self.access_mode())
            .finish()
    }
}

fn record_size_of(layout: &ElementLayout) -> Result<usize, ColumnError> {
    layout.validate(ARRAY_LABEL)?;
    match layout.size() {
        Some(0) | None => Err(ColumnError::layout(ARRAY_LABEL, "records must have a fixed, non-zero size")),
        Some(size) => Ok(size),
    }
}

fn whole_records(bytes: usize, record_size: usize) -> Result<usize, ColumnError> {
    if bytes % record_size != 0 {
        return Err(ColumnError::length_mismatch(
            ARRAY_LABEL,
            format!("{bytes} bytes is not a whole number of {record_size} byte records"),
        ));
    }
    Ok(bytes / record_size)
}

fn region_len(rows: usize, record_size: usize) -> Result<usize, ColumnError> {
    rows.checked_mul(record_size).ok_or_else(|| {
        ColumnError::length_mismatch(
            ARRAY_LABEL,
            format!("{rows} records of {record_size} bytes do not fit in memory"),
        )
    })
}

fn check_pod_size<T: Pod>(layout: &ElementLayout) -> Result<(), ColumnError> {
    let expected = layout.size();
    if expected != Some(mem::size_of::<T>()) {
        return Err(ColumnError::layout(
            ARRAY_LABEL,
            format!(
                "{} is {} bytes but the layout {layout} is {expected:?} bytes",
                std::any::type_name::<T>(),
                mem::size_of::<T>(),
            ),
        ));
    }
    Ok(())
}

fn check_region(offset: usize, len: usize, available: usize) -> Result<(), ColumnError> {
    if offset % WORD_SIZE != 0 {
        return Err(ColumnError::layout(
            ARRAY_LABEL,
            format!("record data offset {offset} is not {WORD_SIZE} byte aligned"),
        ));
    }
    if offset.checked_add(len).map_or(true, |end| end > available) {
        return Err(ColumnError::length_mismatch(
            ARRAY_LABEL,
            format!("records need {len} bytes at offset {offset} but only {available} bytes exist"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Field, PrimitiveType};

    #[test]
    fn test_all_valid_matches_from_bytes() {
        let flags = TypedArray::all_valid(3);
        let expected = TypedArray::from_bytes(ElementLayout::validity(), &[1, 1, 1]).unwrap();
        assert_eq!(flags, expected);
        assert_eq!(flags.len(), 3);
        assert_eq!(flags.record_size(), 1);
        assert!(TypedArray::all_valid(0).is_empty());
    }

    #[test]
    fn test_aligned_buf_resize_zeroes_new_bytes() {
        let mut buf = AlignedBuf::from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        buf.resize(2);
        buf.resize(12);
        assert_eq!(buf.as_bytes(), &[1, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_from_pod_and_cast() {
        let array = TypedArray::from_pod(PrimitiveType::F64.into(), &[1.5f64, 2.5, -3.0])
            .expect("Create array");
        assert_eq!(array.len(), 3);
        assert_eq!(array.access_mode(), AccessMode::Heap);
        assert_eq!(array.cast::<f64>().unwrap(), &[1.5, 2.5, -3.0]);
        assert_eq!(array.record(1).unwrap(), 2.5f64.to_le_bytes());
        assert!(array.record(3).is_none());
    }

    #[test]
    fn test_cast_with_wrong_size_is_rejected() {
        let array = TypedArray::from_pod(PrimitiveType::U32.into(), &[1u32, 2]).unwrap();
        let err = array.cast::<u64>().expect_err("Size mismatch should be rejected");
        assert!(matches!(err, ColumnError::Layout { .. }));
    }

    #[test]
    fn test_partial_records_are_rejected() {
        let err = TypedArray::from_bytes(PrimitiveType::U16.into(), &[1, 2, 3])
            .expect_err("Partial record should be rejected");
        assert!(matches!(err, ColumnError::LengthMismatch { .. }));
    }

    #[test]
    fn test_push_bytes_after_offset_heap() {
        let mut buf = AlignedBuf::zeroed(8);
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&9u32.to_le_bytes());

        let mut array = TypedArray::from_heap(PrimitiveType::U32.into(), 2, buf, 8)
            .expect("Wrap heap buffer");
        assert_eq!(array.cast::<u32>().unwrap(), &[7, 9]);

        array.push_bytes(&11u32.to_le_bytes()).expect("Push record");
        assert_eq!(array.cast::<u32>().unwrap(), &[7, 9, 11]);
    }

    #[test]
    fn test_unaligned_heap_offset_is_rejected() {
        let buf = AlignedBuf::zeroed(16);
        let err = TypedArray::from_heap(PrimitiveType::U8.into(), 4, buf, 3)
            .expect_err("Offset must be aligned");
        assert!(matches!(err, ColumnError::Layout { .. }));
    }

    #[test]
    fn test_struct_records() {
        let layout = ElementLayout::Struct(vec![
            Field::new("a", PrimitiveType::U8.into()),
            Field::new("b", PrimitiveType::U16.into()),
        ]);
        let array = TypedArray::from_bytes(layout, &[1, 2, 0, 3, 4, 0]).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array.record_size(), 3);
        assert_eq!(array.record(1).unwrap(), &[3, 4, 0]);
        assert_eq!(array.records(0..2).unwrap().len(), 6);
    }

    #[test]
    fn test_var_len_layout_is_rejected() {
        let layout = ElementLayout::VarLen(Box::new(PrimitiveType::U8.into()));
        let err = TypedArray::zeroed(layout, 3).expect_err("No fixed record size");
        assert!(matches!(err, ColumnError::Layout { .. }));
    }
}
