//! Loading and persisting column stores.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use cask_tarp::{CategoryIndex, Column, ColumnError, ColumnSet, TypedArray};
use tracing::{debug, info, instrument, warn};

use crate::io::{self, ArchiveReader};
use crate::paths::{self, ColumnSource, StoreLayout, StorePaths};
use crate::{LoadOptions, StoreError};

#[derive(Debug)]
/// The result of loading a store.
pub struct LoadedStore {
    /// The loaded columns and the category index, if the store has one.
    pub set: ColumnSet,
    /// Requested columns which do not exist in the store.
    pub missing_keys: Vec<String>,
    /// Columns which were requested memory mapped but had to be read
    /// onto the heap because they are compressed.
    pub downgraded: Vec<String>,
}

#[instrument(skip(options), fields(mmap = options.mmap))]
/// Loads a store, or a single column, from the given location.
///
/// The location may be a store directory, a column directory, a column
/// archive or a combined store archive.
///
/// If some of the requested keys are missing the remaining columns are
/// returned with the missing keys reported, if all of them are missing
/// a [StoreError::KeyNotFound] is returned.
pub fn load(location: &Path, options: LoadOptions) -> Result<LoadedStore, StoreError> {
    let layout = StoreLayout::detect(location)?;

    let available = layout.names();
    let (selected, missing_keys) = match &options.keys {
        None => (available.clone(), Vec::new()),
        Some(keys) => {
            let mut selected = BTreeSet::new();
            let mut missing = Vec::new();
            for key in keys {
                if available.contains(key) {
                    selected.insert(key.clone());
                } else {
                    missing.push(key.clone());
                }
            }
            (selected, missing)
        },
    };

    if !missing_keys.is_empty() {
        if selected.is_empty() {
            return Err(StoreError::KeyNotFound(missing_keys));
        }
        warn!(missing = ?missing_keys, "Some requested columns do not exist");
    }

    let category_index = layout.load_category_index()?;

    let mut columns = Vec::with_capacity(selected.len());
    let mut downgraded = Vec::new();
    for name in &selected {
        let (column, was_downgraded) = layout.load_column(name, options.mmap)?;
        if was_downgraded {
            warn!(column = %name, "Column is compressed, loading onto the heap instead of mapping");
            downgraded.push(name.clone());
        }
        columns.push(column);
    }

    let set = ColumnSet::from_parts(columns, category_index)?;
    debug!(columns = set.len(), rows = ?set.rows(), "Loaded store");

    Ok(LoadedStore {
        set,
        missing_keys,
        downgraded,
    })
}

/// Lists the names of the columns present at a location.
pub fn list_columns(location: &Path) -> Result<Vec<String>, StoreError> {
    let layout = StoreLayout::detect(location)?;
    Ok(layout.names().into_iter().collect())
}

/// Loads only the category index of a store, if it has one.
pub fn load_category_index(location: &Path) -> Result<Option<CategoryIndex>, StoreError> {
    StoreLayout::detect(location)?.load_category_index()
}

#[instrument(skip(column), fields(column = column.name()))]
/// Writes a column into the given store directory.
///
/// The arrays are staged in a hidden directory and renamed into place once
/// complete. Existing columns are never overwritten.
pub fn save_column(dir: &Path, column: &Column) -> Result<PathBuf, StoreError> {
    paths::validate_name(column.name())?;
    column.validate()?;

    let store = StorePaths::from_base(dir);
    store.ensure_base_path_exists()?;
    if let Some(existing) = store.column_exists(column.name())? {
        return Err(StoreError::AlreadyExists(existing));
    }

    let target = store.column_dir(column.name());
    write_dir_atomic(&target, |staging| write_column_arrays(staging, column))?;

    info!(path = %target.display(), rows = column.rows(), "Saved column");
    Ok(target)
}

#[instrument(skip(index), fields(dimension = index.name()))]
/// Writes a category index into the given store directory.
///
/// A store holds at most one category index.
pub fn save_category_index(dir: &Path, index: &CategoryIndex) -> Result<PathBuf, StoreError> {
    paths::validate_name(index.name())?;
    index.validate()?;

    let store = StorePaths::from_base(dir);
    store.ensure_base_path_exists()?;

    let entries = paths::scan_store_dir(dir)?;
    if let Some((dimension, path)) = entries.category_indexes.iter().next() {
        if dimension == index.name() {
            return Err(StoreError::AlreadyExists(path.clone()));
        }
        return Err(StoreError::AmbiguousCategoryIndex(vec![
            dimension.clone(),
            index.name().to_string(),
        ]));
    }

    let target = store.category_index_file(index.name());
    let array = index.to_array()?;
    write_file_atomic(&target, |staging| io::write_array(staging, &array))?;

    info!(path = %target.display(), categories = index.len(), rows = index.total_rows(), "Saved category index");
    Ok(target)
}

#[instrument(skip(set), fields(columns = set.len()))]
/// Writes a whole column set into the given store directory.
///
/// The category index is written before any column.
pub fn save_set(dir: &Path, set: &ColumnSet) -> Result<(), StoreError> {
    if let Some(index) = set.category_index() {
        save_category_index(dir, index)?;
    }
    for column in set.columns() {
        save_column(dir, column)?;
    }
    Ok(())
}

#[instrument(skip(column), fields(column = column.name()))]
/// Adds a new column to an existing store directory.
///
/// The column must cover exactly the events described by the persisted
/// category index, or by the existing columns if the store has none.
/// Nothing already stored is modified.
pub fn add_column(dir: &Path, column: &Column) -> Result<PathBuf, StoreError> {
    if let Some((rows, source)) = stored_rows(dir)? {
        if column.rows() != rows {
            return Err(ColumnError::LengthMismatch {
                column: column.name().to_string(),
                reason: format!("column has {} events but {source} has {rows}", column.rows()),
            }
            .into());
        }
    }

    save_column(dir, column)
}

/// The number of events a store directory already covers, and what says so.
///
/// The category index is authoritative, otherwise the first existing column
/// is used. Returns `None` for an empty store.
pub(crate) fn stored_rows(dir: &Path) -> Result<Option<(usize, String)>, StoreError> {
    let layout = StoreLayout::Directory(paths::scan_store_dir(dir)?);

    if let Some(index) = layout.load_category_index()? {
        return Ok(Some((index.total_rows(), format!("category index {:?}", index.name()))));
    }
    match layout.names().into_iter().next() {
        Some(name) => {
            let (existing, _) = layout.load_column(&name, true)?;
            Ok(Some((existing.rows(), format!("column {name:?}"))))
        },
        None => Ok(None),
    }
}

/// Writes the arrays of a column into a directory.
pub(crate) fn write_column_arrays(dir: &Path, column: &Column) -> Result<(), StoreError> {
    fs::create_dir(dir)?;
    let arrays = [
        (paths::DATA_ARRAY, Some(column.data())),
        (paths::INDEX_ARRAY, column.index()),
        (paths::VALID_ARRAY, column.valid()),
    ];
    for (member, array) in arrays {
        if let Some(array) = array {
            io::write_array(&paths::array_file(dir, member), array)?;
        }
    }
    Ok(())
}

/// Stages a directory at a hidden path and renames it to `target` once `write` succeeds.
///
/// `write` is responsible for creating the staging directory. On failure
/// the staging directory is removed.
pub(crate) fn write_dir_atomic<F>(target: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&Path) -> Result<(), StoreError>,
{
    let staging = paths::temp_path(target);
    if let Err(e) = write(&staging).and_then(|_| Ok(fs::rename(&staging, target)?)) {
        if let Err(cleanup) = fs::remove_dir_all(&staging) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = ?cleanup, "Failed to remove partial write");
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Stages a file at a hidden path and renames it to `target` once `write` succeeds.
pub(crate) fn write_file_atomic<F>(target: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&Path) -> Result<(), StoreError>,
{
    let staging = paths::temp_path(target);
    if let Err(e) = write(&staging).and_then(|_| Ok(fs::rename(&staging, target)?)) {
        if let Err(cleanup) = fs::remove_file(&staging) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = ?cleanup, "Failed to remove partial write");
            }
        }
        return Err(e);
    }
    Ok(())
}

impl StoreLayout {
    /// The names of every column available.
    pub(crate) fn names(&self) -> BTreeSet<String> {
        match self {
            Self::Directory(entries) => entries.columns.keys().cloned().collect(),
            Self::ColumnDir { name, .. } | Self::ColumnArchive { name, .. } => {
                BTreeSet::from([name.clone()])
            },
            Self::Combined(reader) => reader
                .names()
                .filter_map(|member| member.split_once('/').map(|(column, _)| column.to_string()))
                .collect(),
        }
    }

    /// Loads the single category index, if any.
    pub(crate) fn load_category_index(&self) -> Result<Option<CategoryIndex>, StoreError> {
        let dimensions: Vec<String> = match self {
            Self::Directory(entries) => entries.category_indexes.keys().cloned().collect(),
            Self::Combined(reader) => reader
                .names()
                .filter_map(|member| member.strip_suffix(paths::CATEGORY_SUFFIX))
                .map(str::to_string)
                .collect(),
            Self::ColumnDir { .. } | Self::ColumnArchive { .. } => Vec::new(),
        };

        let dimension = match dimensions.as_slice() {
            [] => return Ok(None),
            [dimension] => dimension,
            _ => return Err(StoreError::AmbiguousCategoryIndex(dimensions)),
        };

        let array = match self {
            Self::Directory(entries) => io::read_array_heap(&entries.category_indexes[dimension])?,
            Self::Combined(reader) => {
                let member = paths::combined_category_member(dimension);
                reader.read_array(&member)?.ok_or_else(|| {
                    StoreError::corrupted(PathBuf::from(&member), "category index member is missing")
                })?
            },
            Self::ColumnDir { .. } | Self::ColumnArchive { .. } => return Ok(None),
        };

        let index = CategoryIndex::from_array(dimension, &array)?;
        debug!(dimension = %dimension, categories = index.len(), "Loaded category index");
        Ok(Some(index))
    }

    /// Loads a column, returning if a mapped load had to fall back to the heap.
    pub(crate) fn load_column(&self, name: &str, mmap: bool) -> Result<(Column, bool), StoreError> {
        match self {
            Self::Directory(entries) => match entries.columns.get(name) {
                Some(ColumnSource::Directory(path)) => Ok((load_column_dir(name, path, mmap)?, false)),
                Some(ColumnSource::Archive(path)) => {
                    let reader = ArchiveReader::open(path)?;
                    let column = load_column_archive(name, &reader, |member| member.to_string())?;
                    Ok((column, mmap))
                },
                None => Err(StoreError::KeyNotFound(vec![name.to_string()])),
            },
            Self::ColumnDir { name: stored, path } if stored == name => {
                Ok((load_column_dir(name, path, mmap)?, false))
            },
            Self::ColumnArchive { name: stored, reader } if stored == name => {
                let column = load_column_archive(name, reader, |member| member.to_string())?;
                Ok((column, mmap))
            },
            Self::Combined(reader) => {
                let column =
                    load_column_archive(name, reader, |member| paths::combined_member(name, member))?;
                Ok((column, mmap))
            },
            Self::ColumnDir { .. } | Self::ColumnArchive { .. } => {
                Err(StoreError::KeyNotFound(vec![name.to_string()]))
            },
        }
    }
}

fn load_column_dir(name: &str, dir: &Path, mmap: bool) -> Result<Column, StoreError> {
    let read = |member: &str| -> Result<Option<TypedArray>, StoreError> {
        let path = paths::array_file(dir, member);
        if !path.try_exists()? {
            return Ok(None);
        }
        let array = if mmap {
            io::read_array_mapped(&path)?
        } else {
            io::read_array_heap(&path)?
        };
        Ok(Some(array))
    };

    let data = read(paths::DATA_ARRAY)?.ok_or_else(|| {
        StoreError::corrupted(dir, format!("column {name:?} has no data array"))
    })?;
    let index = read(paths::INDEX_ARRAY)?;
    let valid = read(paths::VALID_ARRAY)?;

    Ok(Column::from_parts(name, data, index, valid)?)
}

fn load_column_archive(
    name: &str,
    reader: &ArchiveReader,
    member_name: impl Fn(&str) -> String,
) -> Result<Column, StoreError> {
    let data = reader.read_array(&member_name(paths::DATA_ARRAY))?.ok_or_else(|| {
        StoreError::corrupted(PathBuf::from(name), "column archive has no data member")
    })?;
    let index = reader.read_array(&member_name(paths::INDEX_ARRAY))?;
    let valid = reader.read_array(&member_name(paths::VALID_ARRAY))?;

    Ok(Column::from_parts(name, data, index, valid)?)
}
