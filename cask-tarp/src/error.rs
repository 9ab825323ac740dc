#[derive(Debug, thiserror::Error)]
/// An error that can occur when building, validating or merging columns.
///
/// Every variant names the column (or category index) which
/// caused the failure.
pub enum ColumnError {
    #[error("Layout Error ({column}): {reason}")]
    /// The element layout is not supported.
    Layout { column: String, reason: String },
    #[error("Length Mismatch ({column}): {reason}")]
    /// Two arrays which must agree in length do not.
    LengthMismatch { column: String, reason: String },
    #[error("Index Out Of Range ({column}): {reason}")]
    /// A row or range lies outside of the array it addresses.
    IndexOutOfRange { column: String, reason: String },
    #[error("Schema Mismatch ({column}): {reason}")]
    /// Merge inputs disagree on layout, name or index presence.
    SchemaMismatch { column: String, reason: String },
    #[error("Duplicate Category ({index}): key {key} appears more than once")]
    /// A category key was repeated when uniqueness is required.
    DuplicateCategory { index: String, key: String },
    #[error("No Validity Tracking ({0}): column has no valid array")]
    /// Validity was modified on a column without a `valid` array.
    NoValidityTracking(String),
    #[error("Kind Mismatch ({column}): operation requires a {expected} column")]
    /// A vector only operation was used on a scalar column or the reverse.
    KindMismatch {
        column: String,
        expected: &'static str,
    },
    #[error("Append Order ({column}): event {event} appended after event {next} was expected")]
    /// Vector rows were appended twice or out of order for an event.
    AppendOrder {
        column: String,
        event: usize,
        next: usize,
    },
    #[error("Duplicate Column: {0:?} already exists in the set")]
    /// A column with the same name is already part of the set.
    DuplicateColumn(String),
}

impl ColumnError {
    /// Attributes an array level error to the named column.
    pub(crate) fn for_column(self, name: &str) -> Self {
        match self {
            Self::Layout { reason, .. } => Self::layout(name, reason),
            Self::LengthMismatch { reason, .. } => Self::length_mismatch(name, reason),
            Self::IndexOutOfRange { reason, .. } => Self::out_of_range(name, reason),
            Self::SchemaMismatch { reason, .. } => Self::schema_mismatch(name, reason),
            other => other,
        }
    }

    pub(crate) fn layout(column: &str, reason: impl Into<String>) -> Self {
        Self::Layout {
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn length_mismatch(column: &str, reason: impl Into<String>) -> Self {
        Self::LengthMismatch {
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn out_of_range(column: &str, reason: impl Into<String>) -> Self {
        Self::IndexOutOfRange {
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema_mismatch(column: &str, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}
