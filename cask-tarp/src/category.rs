//! Category indexes map a source grouping label (e.g. a run number) onto the
//! contiguous range of events it contributed to a merged column set.

use std::fmt::{Display, Formatter};
use std::ops::Range;

use crate::{ColumnError, ElementLayout, Field, PrimitiveType, TypedArray};

const START_FIELD: &str = "start";
const STOP_FIELD: &str = "stop";
const INT_KEY_SIZE: usize = 8;
const RANGE_FIELDS_SIZE: usize = 16;

#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
/// The label identifying a source grouping.
pub enum CategoryKey {
    Int(i64),
    Text(String),
}

impl CategoryKey {
    fn is_same_kind(&self, other: &CategoryKey) -> bool {
        matches!(
            (self, other),
            (Self::Int(_), Self::Int(_)) | (Self::Text(_), Self::Text(_))
        )
    }
}

impl Display for CategoryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(key) => write!(f, "{key}"),
            Self::Text(key) => write!(f, "{key:?}"),
        }
    }
}

impl From<i64> for CategoryKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for CategoryKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CategoryKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
/// Controls whether category keys may repeat within one index.
pub enum CategoryMode {
    #[default]
    /// Every key must appear at most once.
    Unique,
    /// Keys may be reused intentionally by the caller.
    AllowRepeats,
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// A single `(key, start, stop)` entry of a [CategoryIndex].
pub struct CategoryEntry {
    pub key: CategoryKey,
    pub start: usize,
    pub stop: usize,
}

impl CategoryEntry {
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.start..self.stop
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.stop - self.start
    }
}

#[derive(Debug, Clone)]
/// An ordered mapping of category keys to contiguous ranges of the event axis.
///
/// The ranges always cover `[0, total_rows)` exactly once, in order. The
/// index is never partially updated, new categories are only added to
/// the end via [CategoryIndex::push].
pub struct CategoryIndex {
    /// The category dimension, e.g. `run`.
    name: String,
    entries: Vec<CategoryEntry>,
    mode: CategoryMode,
    seen: ahash::HashSet<CategoryKey>,
}

impl CategoryIndex {
    /// Creates an empty index for the given category dimension.
    pub fn new(name: impl Into<String>, mode: CategoryMode) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            mode,
            seen: ahash::HashSet::default(),
        }
    }

    /// Builds an index from `(key, row_count)` pairs in event order.
    pub fn build<K>(
        name: impl Into<String>,
        labelled: impl IntoIterator<Item = (K, usize)>,
        mode: CategoryMode,
    ) -> Result<Self, ColumnError>
    where
        K: Into<CategoryKey>,
    {
        let mut index = Self::new(name, mode);
        for (key, rows) in labelled {
            index.push(key, rows)?;
        }
        Ok(index)
    }

    /// Concatenates several indexes over consecutive event axes.
    ///
    /// Every range of index `i` is shifted by the total rows of the
    /// indexes before it.
    pub fn concat(indexes: &[&CategoryIndex], mode: CategoryMode) -> Result<Self, ColumnError> {
        let Some(first) = indexes.first() else {
            return Err(ColumnError::schema_mismatch(
                "category index",
                "at least one index is required to concatenate",
            ));
        };

        let mut output = Self::new(first.name.clone(), mode);
        for index in indexes {
            if index.name != output.name {
                return Err(ColumnError::schema_mismatch(
                    &output.name,
                    format!("cannot concatenate with category index {:?}", index.name),
                ));
            }
            for entry in &index.entries {
                output.push(entry.key.clone(), entry.rows())?;
            }
        }
        Ok(output)
    }

    /// Appends a new category covering the next `rows` events.
    pub fn push(&mut self, key: impl Into<CategoryKey>, rows: usize) -> Result<(), ColumnError> {
        let key = key.into();

        if let Some(first) = self.entries.first() {
            if !first.key.is_same_kind(&key) {
                return Err(ColumnError::layout(
                    &self.name,
                    format!("key {key} does not match the type of key {}", first.key),
                ));
            }
        }

        if !self.seen.insert(key.clone()) && self.mode == CategoryMode::Unique {
            return Err(ColumnError::DuplicateCategory {
                index: self.name.clone(),
                key: key.to_string(),
            });
        }

        let start = self.total_rows();
        self.entries.push(CategoryEntry {
            key,
            start,
            stop: start + rows,
        });
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn mode(&self) -> CategoryMode {
        self.mode
    }

    #[inline]
    pub fn entries(&self) -> &[CategoryEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of events covered by the index.
    pub fn total_rows(&self) -> usize {
        self.entries.last().map(|entry| entry.stop).unwrap_or(0)
    }

    /// Returns the key of the category the event belongs to.
    pub fn lookup(&self, event: usize) -> Result<&CategoryKey, ColumnError> {
        let position = self.entries.partition_point(|entry| entry.stop <= event);
        self.entries
            .get(position)
            .map(|entry| &entry.key)
            .ok_or_else(|| {
                ColumnError::out_of_range(
                    &self.name,
                    format!("event {event} is past the end of {} events", self.total_rows()),
                )
            })
    }

    /// Returns the event range of the first category with the given key.
    pub fn slice(&self, key: &CategoryKey) -> Option<Range<usize>> {
        self.entries
            .iter()
            .find(|entry| &entry.key == key)
            .map(CategoryEntry::range)
    }

    /// Checks the ranges are ordered, contiguous and start at `0`.
    pub fn validate(&self) -> Result<(), ColumnError> {
        let mut expected_start = 0;
        for entry in &self.entries {
            if entry.start != expected_start || entry.stop < entry.start {
                return Err(ColumnError::out_of_range(
                    &self.name,
                    format!(
                        "category {} covers {}..{} but should start at {expected_start}",
                        entry.key, entry.start, entry.stop,
                    ),
                ));
            }
            expected_start = entry.stop;
        }
        Ok(())
    }

    /// Encodes the index as a typed array of `(<name>, start, stop)` records.
    ///
    /// Integer keys are stored as `i64`, text keys as NUL padded bytes
    /// as wide as the longest key.
    pub fn to_array(&self) -> Result<TypedArray, ColumnError> {
        let key_layout = match self.entries.first().map(|entry| &entry.key) {
            Some(CategoryKey::Text(_)) => {
                let width = self
                    .entries
                    .iter()
                    .map(|entry| match &entry.key {
                        CategoryKey::Text(key) => key.len(),
                        CategoryKey::Int(_) => 0,
                    })
                    .max()
                    .unwrap_or(0)
                    .max(1);
                ElementLayout::fixed_vec(PrimitiveType::U8.into(), width)
            },
            _ => PrimitiveType::I64.into(),
        };
        let key_size = key_layout.size().unwrap_or(INT_KEY_SIZE);
        let layout = Self::record_layout(&self.name, key_layout);

        let mut bytes = Vec::with_capacity(self.entries.len() * (key_size + RANGE_FIELDS_SIZE));
        for entry in &self.entries {
            match &entry.key {
                CategoryKey::Int(key) => bytes.extend_from_slice(&key.to_le_bytes()),
                CategoryKey::Text(key) => {
                    if key.as_bytes().contains(&0) {
                        return Err(ColumnError::layout(
                            &self.name,
                            format!("category key {key:?} contains a NUL byte"),
                        ));
                    }
                    bytes.extend_from_slice(key.as_bytes());
                    bytes.resize(bytes.len() + key_size - key.len(), 0);
                },
            }
            bytes.extend_from_slice(&(entry.start as u64).to_le_bytes());
            bytes.extend_from_slice(&(entry.stop as u64).to_le_bytes());
        }

        TypedArray::from_bytes(layout, &bytes).map_err(|e| e.for_column(&self.name))
    }

    /// Decodes an index previously encoded with [Self::to_array].
    pub fn from_array(name: &str, array: &TypedArray) -> Result<Self, ColumnError> {
        let ElementLayout::Struct(fields) = array.layout() else {
            return Err(ColumnError::layout(name, "category index records must be a struct"));
        };
        let is_text = match fields.as_slice() {
            [key, start, stop]
                if key.name == name
                    && start.name == START_FIELD
                    && stop.name == STOP_FIELD
                    && start.layout == ElementLayout::Primitive(PrimitiveType::U64)
                    && stop.layout == ElementLayout::Primitive(PrimitiveType::U64) =>
            {
                match &key.layout {
                    ElementLayout::Primitive(PrimitiveType::I64) => false,
                    ElementLayout::FixedVec { element, .. }
                        if **element == ElementLayout::Primitive(PrimitiveType::U8) =>
                    {
                        true
                    },
                    other => {
                        return Err(ColumnError::layout(
                            name,
                            format!("unsupported category key layout {other}"),
                        ))
                    },
                }
            },
            _ => {
                return Err(ColumnError::layout(
                    name,
                    format!("unexpected category index layout {}", array.layout()),
                ))
            },
        };

        let key_size = array.record_size() - RANGE_FIELDS_SIZE;
        let mut entries = Vec::with_capacity(array.len());
        for record in array.as_bytes().chunks_exact(array.record_size()) {
            let (key_bytes, range) = record.split_at(key_size);
            let key = if is_text {
                let end = key_bytes.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
                let text = std::str::from_utf8(&key_bytes[..end]).map_err(|e| {
                    ColumnError::layout(name, format!("category key is not UTF-8: {e}"))
                })?;
                CategoryKey::Text(text.to_string())
            } else {
                CategoryKey::Int(i64::from_le_bytes(read_word(key_bytes)))
            };

            entries.push(CategoryEntry {
                key,
                start: u64::from_le_bytes(read_word(&range[..8])) as usize,
                stop: u64::from_le_bytes(read_word(&range[8..])) as usize,
            });
        }

        let seen: ahash::HashSet<CategoryKey> =
            entries.iter().map(|entry| entry.key.clone()).collect();
        let mode = if seen.len() == entries.len() {
            CategoryMode::Unique
        } else {
            CategoryMode::AllowRepeats
        };

        let index = Self {
            name: name.to_string(),
            entries,
            mode,
            seen,
        };
        index.validate()?;
        Ok(index)
    }

    fn record_layout(name: &str, key_layout: ElementLayout) -> ElementLayout {
        ElementLayout::Struct(vec![
            Field::new(name, key_layout),
            Field::new(START_FIELD, PrimitiveType::U64.into()),
            Field::new(STOP_FIELD, PrimitiveType::U64.into()),
        ])
    }
}

impl PartialEq for CategoryIndex {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.entries == other.entries
    }
}

fn read_word(bytes: &[u8]) -> [u8; 8] {
    let mut word = [0; 8];
    word.copy_from_slice(bytes);
    word
}
