use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use cask_tarp::{merge_sets, CategoryIndex, CategoryKey, ColumnError, ColumnSet};
use tracing::{info, instrument, warn};

use crate::store::{
    list_columns,
    load,
    load_category_index,
    save_category_index,
    save_column,
    stored_rows,
    write_dir_atomic,
};
use crate::{ConcatOptions, LoadOptions, StoreError};

#[derive(Debug, Clone, Default, PartialEq)]
/// What a call to [concatenate_and_index] wrote.
pub struct ConcatReport {
    /// The number of events on the merged event axis.
    pub rows: usize,
    /// Columns merged and written to the output store.
    pub written: Vec<String>,
    /// Selected columns which already existed in the output store.
    pub skipped: Vec<String>,
}

#[instrument(skip(batches, options), fields(batches = batches.len(), dimension = %options.category_name))]
/// Merges the stores of several labelled batches into a single store at `outdir`.
///
/// Each batch contributes one category index entry covering its events, in
/// input order. A batch which is itself a merged store keeps the entries of
/// its own category index instead. Batches are memory mapped, so merging costs one copy of the
/// selected columns.
///
/// A new `outdir` is staged in full and renamed into place. If `outdir`
/// already holds a store, only columns not yet present are merged and
/// written. The merged event axis must then match the store: the category
/// index computed from the batches must equal the persisted one, otherwise a
/// [StoreError::CategoryMismatch] is returned, and a store without an index
/// must have the same number of events. If writing into an existing store
/// fails, everything written by this call is removed again.
pub fn concatenate_and_index(
    batches: &[(CategoryKey, PathBuf)],
    outdir: &Path,
    options: ConcatOptions,
) -> Result<ConcatReport, StoreError> {
    let selected: BTreeSet<String> = match &options.keys {
        Some(keys) => keys.iter().cloned().collect(),
        None => {
            let mut names = BTreeSet::new();
            for (_, location) in batches {
                names.extend(list_columns(location)?);
            }
            names
        },
    };

    let outdir_exists = outdir.try_exists()?;
    let (existing_columns, existing_index) = if outdir_exists {
        (
            list_columns(outdir)?.into_iter().collect::<BTreeSet<_>>(),
            load_category_index(outdir)?,
        )
    } else {
        (BTreeSet::new(), None)
    };

    let (skipped, to_merge): (Vec<String>, Vec<String>) = selected
        .into_iter()
        .partition(|name| existing_columns.contains(name));

    if to_merge.is_empty() {
        info!(skipped = ?skipped, "Every selected column already exists, nothing to merge");
        return Ok(ConcatReport {
            rows: existing_index.map(|index| index.total_rows()).unwrap_or(0),
            written: Vec::new(),
            skipped,
        });
    }

    let mut loaded = Vec::with_capacity(batches.len());
    for (key, location) in batches {
        let load_options = LoadOptions::builder().keys(to_merge.clone()).build();
        loaded.push((key.clone(), load(location, load_options)?.set));
    }
    let labelled: Vec<(CategoryKey, &ColumnSet)> =
        loaded.iter().map(|(key, set)| (key.clone(), set)).collect();

    let merged = merge_sets(&options.category_name, &labelled, Some(to_merge.as_slice()), options.mode)?;
    let index = merged.category_index().ok_or_else(|| StoreError::CategoryMismatch {
        name: options.category_name.clone(),
        reason: "merge produced no category index".to_string(),
    })?;

    match &existing_index {
        Some(existing) if existing != index => {
            return Err(StoreError::CategoryMismatch {
                name: index.name().to_string(),
                reason: format!(
                    "batches describe {} categories over {} events but the store holds {} \
                     categories over {} events",
                    index.len(),
                    index.total_rows(),
                    existing.len(),
                    existing.total_rows(),
                ),
            });
        },
        Some(_) => {},
        None if outdir_exists => {
            if let Some((rows, source)) = stored_rows(outdir)? {
                if rows != index.total_rows() {
                    return Err(ColumnError::LengthMismatch {
                        column: to_merge.join(","),
                        reason: format!(
                            "batches describe {} events but {source} has {rows}",
                            index.total_rows(),
                        ),
                    }
                    .into());
                }
            }
        },
        None => {},
    }

    if outdir_exists {
        let new_index = existing_index.is_none().then_some(index);
        write_into_store(outdir, new_index, &merged)?;
    } else {
        write_new_store(outdir, index, &merged)?;
    }

    let rows = index.total_rows();
    info!(rows, written = ?to_merge, skipped = ?skipped, "Merged batches");

    Ok(ConcatReport {
        rows,
        written: to_merge,
        skipped,
    })
}

/// Stages a complete store next to `outdir` and renames it into place.
fn write_new_store(
    outdir: &Path,
    index: &CategoryIndex,
    merged: &ColumnSet,
) -> Result<(), StoreError> {
    if let Some(parent) = outdir.parent() {
        fs::create_dir_all(parent)?;
    }

    write_dir_atomic(outdir, |staging| {
        fs::create_dir(staging)?;
        save_category_index(staging, index)?;
        for column in merged.columns() {
            save_column(staging, column)?;
        }
        Ok(())
    })
}

/// Adds the merged columns, and the index if the store has none, to an
/// existing store. On failure the entries already added are removed.
fn write_into_store(
    outdir: &Path,
    index: Option<&CategoryIndex>,
    merged: &ColumnSet,
) -> Result<(), StoreError> {
    let mut written = Vec::new();
    let result = write_entries(outdir, index, merged, &mut written);

    if result.is_err() {
        for path in written.iter().rev() {
            let removed = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            if let Err(e) = removed {
                warn!(path = %path.display(), error = ?e, "Failed to remove partially merged output");
            }
        }
    }

    result
}

fn write_entries(
    outdir: &Path,
    index: Option<&CategoryIndex>,
    merged: &ColumnSet,
    written: &mut Vec<PathBuf>,
) -> Result<(), StoreError> {
    if let Some(index) = index {
        written.push(save_category_index(outdir, index)?);
    }
    for column in merged.columns() {
        written.push(save_column(outdir, column)?);
    }
    Ok(())
}
