//! Concatenation of columns from independent batches onto a single event axis.
//!
//! Merging never mutates its inputs, it produces new heap owned arrays. The
//! one non-trivial step is the index rewrite: every range of input `i` is
//! shifted by the total `data` length of the inputs before it.

use std::collections::BTreeSet;

use tracing::{debug, instrument};

use crate::{
    AlignedBuf,
    CategoryIndex,
    CategoryKey,
    CategoryMode,
    Column,
    ColumnError,
    ColumnSet,
    ElementLayout,
    IndexRange,
    TypedArray,
};

/// Concatenates same name, same layout columns in input order.
///
/// Inputs without a `valid` array are treated as all valid if any other
/// input tracks validity. Mixing scalar and vector inputs is rejected.
pub fn concatenate(inputs: &[&Column]) -> Result<Column, ColumnError> {
    let Some(first) = inputs.first() else {
        return Err(ColumnError::schema_mismatch(
            "column",
            "at least one column is required to concatenate",
        ));
    };
    let name = first.name();
    let layout = first.layout();
    let is_vector = first.index().is_some();

    for column in inputs {
        check_compatible(first, column)?;
        column.validate()?;
    }

    let track_validity = inputs.iter().any(|column| column.valid().is_some());
    let total_rows: usize = inputs.iter().map(|column| column.rows()).sum();
    let total_records: usize = inputs.iter().map(|column| column.data().len()).sum();
    let record_size = first.data().record_size();

    let mut data = AlignedBuf::with_capacity(total_records * record_size);
    let mut index = is_vector.then(|| Vec::<IndexRange>::with_capacity(total_rows));
    let mut valid = track_validity.then(|| Vec::<u8>::with_capacity(total_rows));

    let mut data_offset = 0u64;
    for column in inputs {
        data.extend_from_slice(column.data().as_bytes());

        if let Some(output) = index.as_mut() {
            output.extend(column.ranges()?.iter().map(|range| IndexRange {
                start: range.start + data_offset,
                stop: range.stop + data_offset,
            }));
        }

        if let Some(output) = valid.as_mut() {
            match column.valid() {
                Some(flags) => output.extend_from_slice(flags.as_bytes()),
                None => output.resize(output.len() + column.rows(), 1),
            }
        }

        data_offset += column.data().len() as u64;
    }

    let data = TypedArray::from_heap(layout.clone(), total_records, data, 0)
        .map_err(|e| e.for_column(name))?;
    let index = index
        .map(|ranges| TypedArray::from_pod(ElementLayout::index_range(), &ranges))
        .transpose()
        .map_err(|e| e.for_column(name))?;
    let valid = valid
        .map(|flags| TypedArray::from_bytes(ElementLayout::validity(), &flags))
        .transpose()
        .map_err(|e| e.for_column(name))?;

    debug!(
        column = name,
        inputs = inputs.len(),
        rows = total_rows,
        records = total_records,
        "Concatenated column"
    );

    Column::from_parts(name, data, index, valid)
}

/// Concatenates columns and builds a category index with one entry per input.
pub fn concatenate_labelled(
    category_name: &str,
    inputs: &[(CategoryKey, &Column)],
    mode: CategoryMode,
) -> Result<(Column, CategoryIndex), ColumnError> {
    let index = CategoryIndex::build(
        category_name,
        inputs.iter().map(|(key, column)| (key.clone(), column.rows())),
        mode,
    )?;

    let columns: Vec<&Column> = inputs.iter().map(|(_, column)| *column).collect();
    let column = concatenate(&columns)?;

    Ok((column, index))
}

#[instrument(skip(batches), fields(batches = batches.len()))]
/// Merges per category batches into a single column set.
///
/// Every selected column (all columns found in any batch when `columns` is
/// `None`) must be present in every batch. Each batch contributes one
/// category index entry covering its events, labelled with its key. A batch
/// which is itself the output of a merge over the same category dimension
/// contributes its own entries instead, so merging in steps gives the same
/// index as merging in one call.
pub fn merge_sets(
    category_name: &str,
    batches: &[(CategoryKey, &ColumnSet)],
    columns: Option<&[String]>,
    mode: CategoryMode,
) -> Result<ColumnSet, ColumnError> {
    if batches.is_empty() {
        return Err(ColumnError::schema_mismatch(
            category_name,
            "at least one batch is required to merge",
        ));
    }

    let names: BTreeSet<&str> = match columns {
        Some(names) => names.iter().map(String::as_str).collect(),
        None => batches.iter().flat_map(|(_, set)| set.names()).collect(),
    };

    let mut index = CategoryIndex::new(category_name, mode);
    for (key, set) in batches {
        let Some(existing) = set.category_index() else {
            index.push(key.clone(), set.rows().unwrap_or(0))?;
            continue;
        };

        if existing.name() != category_name {
            return Err(ColumnError::schema_mismatch(
                category_name,
                format!("batch {key} is already indexed by {:?}", existing.name()),
            ));
        }
        debug!(batch = %key, categories = existing.len(), "Batch keeps its own categories");
        for entry in existing.entries() {
            index.push(entry.key.clone(), entry.rows())?;
        }
    }

    let mut output = ColumnSet::new();
    output.set_category_index(index)?;

    for name in names {
        let mut inputs = Vec::with_capacity(batches.len());
        for (key, set) in batches {
            let column = set.column(name).ok_or_else(|| {
                ColumnError::schema_mismatch(name, format!("column is missing from batch {key}"))
            })?;
            inputs.push(column);
        }

        let merged = concatenate(&inputs)?;
        output.add_column(merged)?;
    }

    debug!(columns = output.len(), rows = ?output.rows(), "Merged column sets");

    Ok(output)
}

fn check_compatible(first: &Column, column: &Column) -> Result<(), ColumnError> {
    if column.name() != first.name() {
        return Err(ColumnError::schema_mismatch(
            first.name(),
            format!("cannot merge with column {:?}", column.name()),
        ));
    }
    if column.layout() != first.layout() {
        return Err(ColumnError::schema_mismatch(
            first.name(),
            format!("layout {} differs from {}", column.layout(), first.layout()),
        ));
    }
    if column.kind() != first.kind() {
        return Err(ColumnError::schema_mismatch(
            first.name(),
            format!("cannot merge a {} column with a {} column", column.kind(), first.kind()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CategoryEntry, ColumnKind, PrimitiveType};

    fn vector(name: &str, events: &[&[i32]]) -> Column {
        let mut column =
            Column::create(name, ColumnKind::Vector, PrimitiveType::I32.into(), events.len()).unwrap();
        for (event, values) in events.iter().enumerate() {
            column.append_vector_rows_as(event, *values).unwrap();
        }
        column
    }

    fn scalar(name: &str, values: &[f64]) -> Column {
        let data = TypedArray::from_pod(PrimitiveType::F64.into(), values).unwrap();
        Column::from_parts(name, data, None, None).unwrap()
    }

    #[test]
    fn test_merge_example_scenario() {
        let a = vector("pulses", &[&[1, 2], &[3]]);
        let b = vector("pulses", &[&[4, 5, 6]]);

        let (merged, index) = concatenate_labelled(
            "run",
            &[("run1".into(), &a), ("run2".into(), &b)],
            CategoryMode::Unique,
        )
        .expect("Merge columns");

        assert_eq!(merged.values_as::<i32>().unwrap(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            merged.ranges().unwrap(),
            &[IndexRange::new(0, 2), IndexRange::new(2, 3), IndexRange::new(3, 6)],
        );
        assert_eq!(
            index.entries(),
            &[
                CategoryEntry { key: "run1".into(), start: 0, stop: 2 },
                CategoryEntry { key: "run2".into(), start: 2, stop: 3 },
            ],
        );
    }

    #[test]
    fn test_offsets_shift_by_preceding_data_len() {
        let a = vector("pulses", &[&[1, 2, 3], &[], &[4]]);
        let b = vector("pulses", &[&[5], &[6, 7]]);
        let merged = concatenate(&[&a, &b]).unwrap();

        let ranges = merged.ranges().unwrap();
        let data_len = a.data().len() as u64;
        assert_eq!(&ranges[..3], a.ranges().unwrap());
        for (shifted, original) in ranges[3..].iter().zip(b.ranges().unwrap()) {
            assert_eq!(shifted.start, original.start + data_len);
            assert_eq!(shifted.stop, original.stop + data_len);
        }
        assert_eq!(merged.vector_row_as::<i32>(4).unwrap(), &[6, 7]);
    }

    #[rstest::rstest]
    #[case::ab_then_c(&[2, 1])]
    #[case::a_then_bc(&[1, 2])]
    #[case::one_at_a_time(&[1, 1, 1])]
    #[case::single_group(&[3])]
    fn test_merge_sets_in_steps_is_associative(#[case] groups: &[usize]) {
        let batches = [
            ColumnSet::from_parts([vector("pulses", &[&[1], &[2, 3]])], None).unwrap(),
            ColumnSet::from_parts([vector("pulses", &[&[4, 5]])], None).unwrap(),
            ColumnSet::from_parts([vector("pulses", &[&[], &[6], &[7, 8, 9]])], None).unwrap(),
        ];
        let labelled: Vec<(CategoryKey, &ColumnSet)> = batches
            .iter()
            .enumerate()
            .map(|(i, set)| ((i as i64 + 1).into(), set))
            .collect();

        let all = merge_sets("run", &labelled, None, CategoryMode::Unique).unwrap();

        let mut partials = Vec::new();
        let mut consumed = 0;
        for &size in groups {
            let group = &labelled[consumed..consumed + size];
            partials.push(merge_sets("run", group, None, CategoryMode::Unique).unwrap());
            consumed += size;
        }
        let partials: Vec<(CategoryKey, &ColumnSet)> = partials
            .iter()
            .map(|set| (CategoryKey::from("partial"), set))
            .collect();

        let stepped = merge_sets("run", &partials, None, CategoryMode::Unique).unwrap();
        assert_eq!(
            stepped.category_index().unwrap().entries(),
            all.category_index().unwrap().entries(),
        );
        assert_eq!(stepped.column("pulses"), all.column("pulses"));
        assert_eq!(
            stepped.column("pulses").unwrap().ranges().unwrap(),
            &[
                IndexRange::new(0, 1),
                IndexRange::new(1, 3),
                IndexRange::new(3, 5),
                IndexRange::new(5, 5),
                IndexRange::new(5, 6),
                IndexRange::new(6, 9),
            ],
        );
    }

    #[test]
    fn test_merge_sets_rejects_other_dimension() {
        let a = ColumnSet::from_parts([scalar("energy", &[1.0])], None).unwrap();
        let subruns = merge_sets("subrun", &[(1i64.into(), &a)], None, CategoryMode::Unique).unwrap();

        let err = merge_sets("run", &[(1i64.into(), &subruns)], None, CategoryMode::Unique)
            .expect_err("Batch is indexed by another dimension");
        assert!(matches!(err, ColumnError::SchemaMismatch { .. }), "got {err:?}");
    }

    #[test]
    fn test_empty_batches_are_legal() {
        let a = vector("pulses", &[&[1]]);
        let empty = vector("pulses", &[]);
        let b = vector("pulses", &[&[2]]);

        let (merged, index) = concatenate_labelled(
            "run",
            &[(1i64.into(), &a), (2i64.into(), &empty), (3i64.into(), &b)],
            CategoryMode::Unique,
        )
        .unwrap();

        assert_eq!(merged.rows(), 2);
        let ranges: Vec<_> = index.entries().iter().map(CategoryEntry::range).collect();
        assert_eq!(ranges, vec![0..1, 1..1, 1..2]);
        index.validate().expect("Contiguous ranges");
    }

    #[test]
    fn test_validity_is_back_filled() {
        let mut a = scalar("energy", &[1.0, 2.0]).with_validity();
        a.mark_invalid(1).unwrap();
        let b = scalar("energy", &[3.0]);

        let merged = concatenate(&[&a, &b]).unwrap();
        assert_eq!(merged.valid().unwrap().as_bytes(), &[1, 0, 1]);
        assert_eq!(merged.values_as::<f64>().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_vector_validity_is_back_filled_with_shifted_ranges() {
        let a = vector("pulses", &[&[1, 2], &[3]]);
        let mut b = vector("pulses", &[&[], &[4, 5]]).with_validity();
        b.mark_invalid(0).unwrap();
        let c = vector("pulses", &[&[6]]);

        let merged = concatenate(&[&a, &b, &c]).unwrap();
        assert_eq!(merged.valid().unwrap().as_bytes(), &[1, 1, 0, 1, 1]);
        assert_eq!(
            merged.ranges().unwrap(),
            &[
                IndexRange::new(0, 2),
                IndexRange::new(2, 3),
                IndexRange::new(3, 3),
                IndexRange::new(3, 5),
                IndexRange::new(5, 6),
            ],
        );
        assert!(!merged.is_valid(2));
        assert_eq!(merged.vector_row_as::<i32>(3).unwrap(), &[4, 5]);
        merged.validate().expect("Merged column is consistent");
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let a = vector("pulses", &[&[1, 2]]);
        let b = vector("pulses", &[&[3]]);
        let before = (a.clone(), b.clone());

        let _ = concatenate(&[&a, &b]).unwrap();
        assert_eq!((a, b), before);
    }

    #[test]
    fn test_layout_mismatch() {
        let a = scalar("energy", &[1.0]);
        let b = Column::create("energy", ColumnKind::Scalar, PrimitiveType::F32.into(), 1).unwrap();
        let err = concatenate(&[&a, &b]).expect_err("Layouts differ");
        assert!(matches!(err, ColumnError::SchemaMismatch { column, .. } if column == "energy"));
    }

    #[test]
    fn test_index_presence_mismatch() {
        let a = Column::create("x", ColumnKind::Scalar, PrimitiveType::I32.into(), 1).unwrap();
        let b = vector("x", &[&[1]]);
        let err = concatenate(&[&a, &b]).expect_err("Kinds differ");
        assert!(matches!(err, ColumnError::SchemaMismatch { .. }), "got {err:?}");
    }

    #[test]
    fn test_name_mismatch() {
        let a = scalar("energy", &[1.0]);
        let b = scalar("zenith", &[1.0]);
        let err = concatenate(&[&a, &b]).expect_err("Names differ");
        assert!(matches!(err, ColumnError::SchemaMismatch { .. }), "got {err:?}");
    }

    #[test]
    fn test_no_inputs() {
        let err = concatenate(&[]).expect_err("Nothing to merge");
        assert!(matches!(err, ColumnError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_merge_sets() {
        let batch1 = ColumnSet::from_parts(
            [scalar("energy", &[1.0, 2.0]), vector("pulses", &[&[1], &[2, 3]])],
            None,
        )
        .unwrap();
        let batch2 = ColumnSet::from_parts(
            [scalar("energy", &[3.0]), vector("pulses", &[&[4]])],
            None,
        )
        .unwrap();

        let merged = merge_sets(
            "run",
            &[(10i64.into(), &batch1), (11i64.into(), &batch2)],
            None,
            CategoryMode::Unique,
        )
        .expect("Merge sets");

        assert_eq!(merged.rows(), Some(3));
        assert_eq!(merged.names().collect::<Vec<_>>(), vec!["energy", "pulses"]);
        let index = merged.category_index().unwrap();
        assert_eq!(index.slice(&11i64.into()), Some(2..3));
        assert_eq!(
            merged.column("pulses").unwrap().vector_row_as::<i32>(2).unwrap(),
            &[4],
        );
    }

    #[test]
    fn test_merge_sets_selected_columns() {
        let batch1 =
            ColumnSet::from_parts([scalar("energy", &[1.0]), scalar("zenith", &[0.5])], None).unwrap();
        let batch2 = ColumnSet::from_parts([scalar("energy", &[2.0])], None).unwrap();

        let err = merge_sets(
            "run",
            &[(1i64.into(), &batch1), (2i64.into(), &batch2)],
            None,
            CategoryMode::Unique,
        )
        .expect_err("zenith is missing from the second batch");
        assert!(matches!(err, ColumnError::SchemaMismatch { column, .. } if column == "zenith"));

        let merged = merge_sets(
            "run",
            &[(1i64.into(), &batch1), (2i64.into(), &batch2)],
            Some(&["energy".to_string()][..]),
            CategoryMode::Unique,
        )
        .expect("Only energy is merged");
        assert_eq!(merged.len(), 1);
    }
}
