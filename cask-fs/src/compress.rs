//! Conversion between the uncompressed directory form and archives.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::io::{self, ArchiveReader};
use crate::paths::{self, ColumnSource, StoreEntries, StoreLayout, ARCHIVE_EXT, ARRAY_EXT};
use crate::store::{write_dir_atomic, write_file_atomic};
use crate::{CompressOptions, DecompressOptions, StoreError};

#[instrument(skip(options), fields(combined = options.combined, level = options.level))]
/// Compresses a column directory or every column of a store directory.
///
/// A column directory becomes a sibling `<column>.arrz` archive. A store
/// directory has each of its uncompressed columns converted in place, or
/// with [CompressOptions::combined] is written as a single sibling
/// `<store>.arrz` archive also holding the category index.
///
/// Originals are only removed once the archive is fully written, and only
/// if [CompressOptions::keep_original] is not set.
///
/// Returns the archives written.
pub fn compress(location: &Path, options: CompressOptions) -> Result<Vec<PathBuf>, StoreError> {
    match StoreLayout::detect(location)? {
        StoreLayout::ColumnDir { name, path } => {
            compress_column_dir(&name, &path, &options).map(|archive| vec![archive])
        },
        StoreLayout::Directory(entries) if options.combined => {
            compress_combined(location, &entries, &options).map(|archive| vec![archive])
        },
        StoreLayout::Directory(entries) => {
            let mut archives = Vec::new();
            for (name, source) in &entries.columns {
                match source {
                    ColumnSource::Directory(path) => {
                        archives.push(compress_column_dir(name, path, &options)?);
                    },
                    ColumnSource::Archive(_) => {
                        debug!(column = %name, "Column is already compressed");
                    },
                }
            }
            Ok(archives)
        },
        StoreLayout::ColumnArchive { .. } | StoreLayout::Combined(_) => {
            debug!("Location is already compressed");
            Ok(Vec::new())
        },
    }
}

#[instrument(skip(options))]
/// Expands a column archive, a combined store archive or every column
/// archive within a store directory.
///
/// Returns the directories written.
pub fn decompress(location: &Path, options: DecompressOptions) -> Result<Vec<PathBuf>, StoreError> {
    match StoreLayout::detect(location)? {
        StoreLayout::ColumnArchive { name, reader } => {
            decompress_column_archive(&name, location, reader, &options).map(|dir| vec![dir])
        },
        StoreLayout::Combined(reader) => {
            decompress_combined(location, reader, &options).map(|dir| vec![dir])
        },
        StoreLayout::Directory(entries) => {
            let mut dirs = Vec::new();
            for (name, source) in &entries.columns {
                if let ColumnSource::Archive(path) = source {
                    let reader = ArchiveReader::open(path)?;
                    dirs.push(decompress_column_archive(name, path, reader, &options)?);
                }
            }
            Ok(dirs)
        },
        StoreLayout::ColumnDir { .. } => {
            debug!("Location is not compressed");
            Ok(Vec::new())
        },
    }
}

fn compress_column_dir(
    name: &str,
    dir: &Path,
    options: &CompressOptions,
) -> Result<PathBuf, StoreError> {
    let target = dir.with_file_name(format!("{name}.{ARCHIVE_EXT}"));
    ensure_absent(&target)?;

    let members = column_dir_members(dir, |member| member.to_string())?;
    write_file_atomic(&target, |staging| io::write_archive(staging, &members, options.level))?;

    if !options.keep_original {
        fs::remove_dir_all(dir)?;
    }

    info!(column = %name, path = %target.display(), "Compressed column");
    Ok(target)
}

fn compress_combined(
    location: &Path,
    entries: &StoreEntries,
    options: &CompressOptions,
) -> Result<PathBuf, StoreError> {
    let location = match location.file_name() {
        Some(_) => location.to_path_buf(),
        None => location.canonicalize()?,
    };
    let store_name = location
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StoreError::InvalidName(location.display().to_string()))?;
    let target = location.with_file_name(format!("{store_name}.{ARCHIVE_EXT}"));
    ensure_absent(&target)?;

    let mut members = Vec::new();
    for (dimension, path) in &entries.category_indexes {
        members.push((paths::combined_category_member(dimension), read_array_bytes(path)?));
    }
    for (name, source) in &entries.columns {
        match source {
            ColumnSource::Directory(dir) => {
                members.extend(column_dir_members(dir, |member| paths::combined_member(name, member))?);
            },
            ColumnSource::Archive(path) => {
                let reader = ArchiveReader::open(path)?;
                for member in paths::COLUMN_ARRAYS {
                    if let Some(raw) = reader.read_raw(member)? {
                        members.push((paths::combined_member(name, member), raw.as_bytes().to_vec()));
                    }
                }
            },
        }
    }

    write_file_atomic(&target, |staging| io::write_archive(staging, &members, options.level))?;

    if !options.keep_original {
        fs::remove_dir_all(&location)?;
    }

    info!(
        path = %target.display(),
        columns = entries.columns.len(),
        members = members.len(),
        "Compressed store into a single archive",
    );
    Ok(target)
}

fn decompress_column_archive(
    name: &str,
    archive: &Path,
    reader: ArchiveReader,
    options: &DecompressOptions,
) -> Result<PathBuf, StoreError> {
    let target = archive.with_file_name(name);
    ensure_absent(&target)?;

    write_dir_atomic(&target, |staging| {
        fs::create_dir(staging)?;
        for member in paths::COLUMN_ARRAYS {
            if let Some(raw) = reader.read_raw(member)? {
                let path = paths::array_file(staging, member);
                io::validate_array_bytes(&path, raw.as_bytes())?;
                write_synced(&path, raw.as_bytes())?;
            }
        }
        Ok(())
    })?;
    drop(reader);

    if !options.keep_original {
        fs::remove_file(archive)?;
    }

    info!(column = %name, path = %target.display(), "Decompressed column");
    Ok(target)
}

fn decompress_combined(
    archive: &Path,
    reader: ArchiveReader,
    options: &DecompressOptions,
) -> Result<PathBuf, StoreError> {
    let stem = archive
        .file_stem()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StoreError::InvalidName(archive.display().to_string()))?;
    let target = archive.with_file_name(stem);
    ensure_absent(&target)?;

    let names: Vec<String> = reader.names().map(str::to_string).collect();
    write_dir_atomic(&target, |staging| {
        fs::create_dir(staging)?;
        for member in &names {
            let path = match member.split_once('/') {
                Some((column, array)) => {
                    let column_dir = staging.join(column);
                    if !column_dir.try_exists()? {
                        fs::create_dir(&column_dir)?;
                    }
                    paths::array_file(&column_dir, array)
                },
                None if member.ends_with(paths::CATEGORY_SUFFIX) => {
                    staging.join(format!("{member}.{ARRAY_EXT}"))
                },
                None => {
                    return Err(StoreError::corrupted(
                        archive,
                        format!("unexpected archive member {member:?}"),
                    ))
                },
            };

            let raw = reader.read_raw(member)?.ok_or_else(|| {
                StoreError::corrupted(archive, format!("archive member {member:?} disappeared"))
            })?;
            io::validate_array_bytes(&path, raw.as_bytes())?;
            write_synced(&path, raw.as_bytes())?;
        }
        Ok(())
    })?;
    drop(reader);

    if !options.keep_original {
        fs::remove_file(archive)?;
    }

    info!(path = %target.display(), members = names.len(), "Decompressed store archive");
    Ok(target)
}

/// Reads the arrays of a column directory as archive members.
fn column_dir_members(
    dir: &Path,
    member_name: impl Fn(&str) -> String,
) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let mut members = Vec::with_capacity(paths::COLUMN_ARRAYS.len());
    for member in paths::COLUMN_ARRAYS {
        let path = paths::array_file(dir, member);
        if path.try_exists()? {
            members.push((member_name(member), read_array_bytes(&path)?));
        }
    }
    Ok(members)
}

fn read_array_bytes(path: &Path) -> Result<Vec<u8>, StoreError> {
    let bytes = fs::read(path)?;
    io::validate_array_bytes(path, &bytes)?;
    Ok(bytes)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn ensure_absent(target: &Path) -> Result<(), StoreError> {
    if target.try_exists()? {
        return Err(StoreError::AlreadyExists(target.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cask_tarp::{
        AccessMode,
        CategoryIndex,
        CategoryMode,
        Column,
        ColumnKind,
        ColumnSet,
        PrimitiveType,
    };

    use super::*;
    use crate::{load, save_set, LoadOptions};

    fn sample_set() -> ColumnSet {
        let mut hits = Column::create("hits", ColumnKind::Vector, PrimitiveType::I16.into(), 4)
            .unwrap()
            .with_validity();
        hits.append_vector_rows_as(0, &[1i16, 2, 3]).unwrap();
        hits.append_vector_rows_as(3, &[4i16]).unwrap();
        hits.mark_invalid(2).unwrap();

        let energy = Column::from_parts(
            "energy",
            cask_tarp::TypedArray::from_pod(PrimitiveType::F32.into(), &[1.0f32, 2.0, 3.0, 4.0])
                .unwrap(),
            None,
            None,
        )
        .unwrap();

        let index =
            CategoryIndex::build("run", [("a", 1), ("b", 3)], CategoryMode::Unique).unwrap();
        ColumnSet::from_parts([hits, energy], Some(index)).unwrap()
    }

    fn saved_store() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        save_set(&store, &sample_set()).expect("Save store");
        (dir, store)
    }

    #[test]
    fn test_compress_columns_in_place() {
        let (_dir, store) = saved_store();

        let archives = compress(&store, CompressOptions::default()).expect("Compress store");
        assert_eq!(archives, vec![store.join("energy.arrz"), store.join("hits.arrz")]);
        assert!(!store.join("hits").exists());
        assert!(store.join("run__categ_index.arr").exists());

        let loaded = load(&store, LoadOptions::default()).expect("Load compressed store");
        assert_eq!(loaded.set, sample_set());
        assert_eq!(loaded.downgraded, vec!["energy".to_string(), "hits".to_string()]);
        for column in loaded.set.columns() {
            assert_eq!(column.access_mode(), AccessMode::Heap);
        }
    }

    #[test]
    fn test_compress_keep_original() {
        let (_dir, store) = saved_store();
        let hits = store.join("hits");

        let options = CompressOptions::builder().keep_original(true).build();
        let archives = compress(&hits, options).expect("Compress column");
        assert_eq!(archives, vec![store.join("hits.arrz")]);
        assert!(hits.exists());

        let from_archive = load(&archives[0], LoadOptions::default()).unwrap();
        let from_dir = load(&hits, LoadOptions::default()).unwrap();
        assert_eq!(from_archive.set, from_dir.set);
    }

    #[test]
    fn test_combined_round_trip() {
        let (dir, store) = saved_store();

        let options = CompressOptions::builder().combined(true).build();
        let archives = compress(&store, options).expect("Compress store");
        let archive = dir.path().join("store.arrz");
        assert_eq!(archives, vec![archive.clone()]);
        assert!(!store.exists());

        let loaded = load(&archive, LoadOptions::default()).expect("Load combined archive");
        assert_eq!(loaded.set, sample_set());
        assert_eq!(loaded.set.category_index(), sample_set().category_index());

        let dirs = decompress(&archive, DecompressOptions::default()).expect("Decompress");
        assert_eq!(dirs, vec![store.clone()]);
        assert!(!archive.exists());

        let loaded = load(&store, LoadOptions::default()).unwrap();
        assert_eq!(loaded.set, sample_set());
        assert!(loaded.downgraded.is_empty());
    }

    #[test]
    fn test_decompress_restores_identical_bytes() {
        let (_dir, store) = saved_store();
        let data_path = store.join("hits").join("data.arr");
        let original = fs::read(&data_path).unwrap();

        compress(&store, CompressOptions::default()).unwrap();
        let dirs = decompress(&store, DecompressOptions::default()).expect("Decompress store");
        assert_eq!(dirs.len(), 2);
        assert!(!store.join("hits.arrz").exists());
        assert_eq!(fs::read(&data_path).unwrap(), original);
    }

    #[test]
    fn test_compress_refuses_to_overwrite() {
        let (_dir, store) = saved_store();
        let hits = store.join("hits");
        let options = CompressOptions::builder().keep_original(true).build();
        compress(&hits, options.clone()).unwrap();

        let err = compress(&hits, options).expect_err("Archive exists");
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }
}
