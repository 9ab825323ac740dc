use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::io::ArchiveReader;
use crate::StoreError;

/// The extension of a single array file.
pub const ARRAY_EXT: &str = "arr";
/// The extension of a compressed archive.
pub const ARCHIVE_EXT: &str = "arrz";
/// The suffix marking a category index file, `<dimension>__categ_index.arr`.
pub const CATEGORY_SUFFIX: &str = "__categ_index";

pub(crate) const DATA_ARRAY: &str = "data";
pub(crate) const INDEX_ARRAY: &str = "index";
pub(crate) const VALID_ARRAY: &str = "valid";
pub(crate) const COLUMN_ARRAYS: [&str; 3] = [DATA_ARRAY, INDEX_ARRAY, VALID_ARRAY];

static PARTIAL_EXT: &str = "partial";

/// The paths of the parts of a store directory.
///
/// ```text
/// store/
/// ├── run__categ_index.arr
/// ├── energy/
/// │   ├── data.arr
/// │   └── valid.arr
/// ├── pulses/
/// │   ├── data.arr
/// │   └── index.arr
/// └── zenith.arrz
/// ```
#[derive(Debug, Clone)]
pub(crate) struct StorePaths {
    base_path: PathBuf,
}

impl StorePaths {
    pub(crate) fn from_base(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    #[inline]
    pub(crate) fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub(crate) fn column_dir(&self, column: &str) -> PathBuf {
        self.base_path.join(column)
    }

    pub(crate) fn column_archive(&self, column: &str) -> PathBuf {
        self.base_path.join(format!("{column}.{ARCHIVE_EXT}"))
    }

    pub(crate) fn category_index_file(&self, dimension: &str) -> PathBuf {
        self.base_path
            .join(format!("{dimension}{CATEGORY_SUFFIX}.{ARRAY_EXT}"))
    }

    /// Returns if a column exists in either the directory or archive form.
    pub(crate) fn column_exists(&self, column: &str) -> std::io::Result<Option<PathBuf>> {
        for path in [self.column_dir(column), self.column_archive(column)] {
            if path.try_exists()? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    pub(crate) fn ensure_base_path_exists(&self) -> std::io::Result<()> {
        if self.base_path.try_exists()? {
            return Ok(());
        }

        debug!(path = %self.base_path.display(), "Create store path");
        fs::create_dir_all(&self.base_path)
    }
}

/// The path of array `member` within a column directory.
pub(crate) fn array_file(column_dir: &Path, member: &str) -> PathBuf {
    column_dir.join(format!("{member}.{ARRAY_EXT}"))
}

/// The archive member name of a column array inside a combined archive.
pub(crate) fn combined_member(column: &str, member: &str) -> String {
    format!("{column}/{member}")
}

/// The archive member name of a category index inside a combined archive.
pub(crate) fn combined_category_member(dimension: &str) -> String {
    format!("{dimension}{CATEGORY_SUFFIX}")
}

/// Checks a name can be used for a column or category dimension.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    let is_valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.ends_with(CATEGORY_SUFFIX)
        && !name.ends_with(&format!(".{ARCHIVE_EXT}"))
        && !name.ends_with(&format!(".{ARRAY_EXT}"));
    if is_valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Returns if `location` is a single column directory rather than a store.
pub fn is_column_dir(location: &Path) -> bool {
    location.is_dir() && array_file(location, DATA_ARRAY).is_file()
}

/// Returns if the entry is hidden, such as an in progress write.
pub(crate) fn is_hidden(file_name: &str) -> bool {
    file_name.starts_with('.')
}

/// The hidden sibling a write to `target` is staged in before being renamed into place.
pub(crate) fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = format!(".{name}.{}.{PARTIAL_EXT}", ulid::Ulid::new());
    target.with_file_name(file_name)
}

/// Where the stored form of a single column lives.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum ColumnSource {
    /// An uncompressed column directory.
    Directory(PathBuf),
    /// A compressed single column archive.
    Archive(PathBuf),
}

/// The visible entries of a store directory.
#[derive(Debug, Default)]
pub(crate) struct StoreEntries {
    pub(crate) columns: BTreeMap<String, ColumnSource>,
    /// Category index files keyed by dimension.
    pub(crate) category_indexes: BTreeMap<String, PathBuf>,
}

/// The shape of a store location.
pub(crate) enum StoreLayout {
    /// A single uncompressed column.
    ColumnDir { name: String, path: PathBuf },
    /// A single compressed column.
    ColumnArchive { name: String, reader: ArchiveReader },
    /// A directory of columns and category indexes.
    Directory(StoreEntries),
    /// A single archive holding a whole store.
    Combined(ArchiveReader),
}

impl StoreLayout {
    /// Inspects a location and works out how it is laid out.
    pub(crate) fn detect(location: &Path) -> Result<Self, StoreError> {
        if !location.try_exists()? {
            return Err(StoreError::NotFound(location.to_path_buf()));
        }

        if location.is_file() {
            let reader = ArchiveReader::open(location)?;
            if reader.contains(DATA_ARRAY) {
                return Ok(Self::ColumnArchive {
                    name: file_stem(location),
                    reader,
                });
            }
            return Ok(Self::Combined(reader));
        }

        if is_column_dir(location) {
            return Ok(Self::ColumnDir {
                name: file_name(location),
                path: location.to_path_buf(),
            });
        }

        scan_store_dir(location).map(Self::Directory)
    }
}

/// Lists the visible columns and category indexes of a store directory.
pub(crate) fn scan_store_dir(dir: &Path) -> Result<StoreEntries, StoreError> {
    let mut entries = StoreEntries::default();

    for entry in dir.read_dir()? {
        let entry = entry?;
        let path = entry.path();
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %path.display(), "Ignoring entry with non UTF-8 name");
            continue;
        };
        if is_hidden(&file_name) {
            trace!(path = %path.display(), "Ignoring hidden entry");
            continue;
        }

        let (column, source) = if entry.file_type()?.is_dir() {
            (file_name, ColumnSource::Directory(path))
        } else if let Some(stem) = file_name.strip_suffix(&format!(".{ARCHIVE_EXT}")) {
            (stem.to_string(), ColumnSource::Archive(path))
        } else if let Some(dimension) =
            file_name.strip_suffix(&format!("{CATEGORY_SUFFIX}.{ARRAY_EXT}"))
        {
            entries.category_indexes.insert(dimension.to_string(), path);
            continue;
        } else {
            trace!(path = %path.display(), "Ignoring unknown entry");
            continue;
        };

        if let Some(existing) = entries.columns.insert(column.clone(), source) {
            return Err(StoreError::corrupted(
                dir,
                format!("column {column:?} is stored more than once ({existing:?})"),
            ));
        }
    }

    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
