use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ColumnError;

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The primitive data type of a field as stored on disk.
///
/// All multi-byte types are stored little-endian, `Bool` is a single
/// byte holding `0` or `1`.
pub enum PrimitiveType {
    Bool = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    U8 = 6,
    U16 = 7,
    U32 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
}

impl PrimitiveType {
    /// The width of the type in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// A single named field within a [ElementLayout::Struct].
pub struct Field {
    pub name: String,
    pub layout: ElementLayout,
}

impl Field {
    pub fn new(name: impl Into<String>, layout: ElementLayout) -> Self {
        Self {
            name: name.into(),
            layout,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The layout of a single record within a typed array.
///
/// Records are packed, fields follow each other with no padding in
/// declaration order. Two arrays hold the same type if and only if their
/// layouts compare equal, including field names.
pub enum ElementLayout {
    /// A single primitive value.
    Primitive(PrimitiveType),
    /// A set of named fields laid out one after another.
    Struct(Vec<Field>),
    /// A fixed number of values of the same sub-layout.
    FixedVec {
        element: Box<ElementLayout>,
        len: usize,
    },
    /// A variable number of values of the sub-layout.
    ///
    /// This cannot be stored inside a record, it is only accepted as the
    /// top level layout of a vector column where it describes the
    /// `data` + `index` shape.
    VarLen(Box<ElementLayout>),
}

impl ElementLayout {
    /// The layout used by vector column `index` arrays.
    pub fn index_range() -> Self {
        Self::Struct(vec![
            Field::new("start", Self::Primitive(PrimitiveType::U64)),
            Field::new("stop", Self::Primitive(PrimitiveType::U64)),
        ])
    }

    /// The layout used by `valid` arrays.
    pub fn validity() -> Self {
        Self::Primitive(PrimitiveType::Bool)
    }

    /// Creates a fixed length vector of the given layout.
    pub fn fixed_vec(element: ElementLayout, len: usize) -> Self {
        Self::FixedVec {
            element: Box::new(element),
            len,
        }
    }

    /// The size of a single record in bytes.
    ///
    /// Returns `None` if the layout contains a variable length part.
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::Primitive(ty) => Some(ty.size()),
            Self::Struct(fields) => fields
                .iter()
                .try_fold(0usize, |acc, field| acc.checked_add(field.layout.size()?)),
            Self::FixedVec { element, len } => element.size()?.checked_mul(*len),
            Self::VarLen(_) => None,
        }
    }

    /// Returns the byte offset and layout of the named top level field.
    pub fn field(&self, name: &str) -> Option<(usize, &ElementLayout)> {
        let Self::Struct(fields) = self else { return None };

        let mut offset = 0;
        for field in fields {
            if field.name == name {
                return Some((offset, &field.layout));
            }
            offset = offset.checked_add(field.layout.size()?)?;
        }
        None
    }

    /// Checks the layout can be used as the record type of a typed array.
    pub fn validate(&self, column: &str) -> Result<(), ColumnError> {
        match self {
            Self::Primitive(_) => Ok(()),
            Self::Struct(fields) => {
                if fields.is_empty() {
                    return Err(ColumnError::layout(column, "struct has no fields"));
                }
                let mut seen = ahash::HashSet::default();
                for field in fields {
                    if !seen.insert(field.name.as_str()) {
                        return Err(ColumnError::layout(
                            column,
                            format!("duplicate field name {:?}", field.name),
                        ));
                    }
                    field.layout.validate(column)?;
                }
                Ok(())
            },
            Self::FixedVec { element, len } => {
                if *len == 0 {
                    return Err(ColumnError::layout(column, "fixed vector of length 0"));
                }
                element.validate(column)
            },
            Self::VarLen(_) => Err(ColumnError::layout(
                column,
                "variable length fields are only supported as the data + index shape \
                 of a vector column",
            )),
        }
    }
}

impl From<PrimitiveType> for ElementLayout {
    fn from(value: PrimitiveType) -> Self {
        Self::Primitive(value)
    }
}

impl Display for ElementLayout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primitive(ty) => write!(f, "{ty:?}"),
            Self::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.layout)?;
                }
                write!(f, "}}")
            },
            Self::FixedVec { element, len } => write!(f, "[{element}; {len}]"),
            Self::VarLen(element) => write!(f, "[{element}]"),
        }
    }
}
