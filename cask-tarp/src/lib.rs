//! Typed arrays and event columns for cask column stores.
//!
//! A store is a set of named [Column]s sharing one event axis. Columns are
//! built from [TypedArray]s, which either own their bytes or borrow them
//! from a memory mapped file, and several batches of columns can be
//! concatenated into one with the source of every event recorded in a
//! [CategoryIndex].

mod array;
mod category;
mod column;
mod datatype;
mod error;
mod group;
mod merge;

pub use self::array::{AccessMode, AlignedBuf, TypedArray};
pub use self::category::{CategoryEntry, CategoryIndex, CategoryKey, CategoryMode};
pub use self::column::{Column, ColumnKind, IndexRange};
pub use self::datatype::{ElementLayout, Field, PrimitiveType};
pub use self::error::ColumnError;
pub use self::group::ColumnSet;
pub use self::merge::{concatenate, concatenate_labelled, merge_sets};
