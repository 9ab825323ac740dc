use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use cask_fs::{CompressOptions, ConcatOptions, DecompressOptions, LoadOptions, ARCHIVE_EXT};
use cask_tarp::{CategoryKey, CategoryMode, Column};
use clap::Subcommand;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print a summary of the columns and category index of a store
    Inspect {
        /// The store directory, column directory or archive to inspect.
        location: PathBuf,
        #[arg(long, value_delimiter = ',')]
        /// Only inspect the given columns.
        keys: Option<Vec<String>>,
        #[arg(long)]
        /// Read arrays onto the heap instead of memory mapping them.
        no_mmap: bool,
    },
    /// Compress a store or a single column into zstd archives
    Compress {
        /// The store directory or column directory to compress.
        location: PathBuf,
        #[arg(long, env = "CASK_COMPRESSION_LEVEL", default_value_t = cask_fs::DEFAULT_COMPRESSION_LEVEL)]
        /// The zstd compression level.
        level: i32,
        #[arg(long)]
        /// Keep the uncompressed originals.
        keep_original: bool,
        #[arg(long)]
        /// Write a single archive for the whole store.
        combined: bool,
    },
    /// Expand archives back into the uncompressed directory form
    Decompress {
        /// The archive, or store directory holding column archives, to expand.
        location: PathBuf,
        #[arg(long)]
        /// Keep the archives.
        keep_original: bool,
    },
    /// Merge the stores of several batches into one category indexed store
    Concat {
        #[arg(long, env = "CASK_CATEGORY", default_value = "run")]
        /// The category dimension the batches are labelled with.
        category: String,
        #[arg(long, value_delimiter = ',')]
        /// Only merge the given columns.
        keys: Option<Vec<String>>,
        #[arg(long)]
        /// Allow the same category key to label more than one batch.
        allow_repeats: bool,
        #[arg(short, long)]
        /// The output store directory.
        outdir: PathBuf,
        #[arg(required = true, value_parser = parse_batch)]
        /// The batches to merge in order, as `KEY=PATH`. {n}
        /// {n}
        /// Keys which parse as integers are stored as integer keys.
        batches: Vec<(CategoryKey, PathBuf)>,
    },
}

impl Commands {
    /// Triggers any additional startup messages which are aware
    /// of the provided subcommand.
    pub fn display_startup_message(&self) {
        match self {
            Commands::Inspect { location, .. } => {
                info!(location = %location.display(), "Inspecting store");
            },
            Commands::Compress {
                location,
                level,
                combined,
                ..
            } => {
                info!(location = %location.display(), level, combined, "Compressing store");
            },
            Commands::Decompress { location, .. } => {
                info!(location = %location.display(), "Decompressing store");
            },
            Commands::Concat {
                category,
                outdir,
                batches,
                ..
            } => {
                info!(
                    category = %category,
                    outdir = %outdir.display(),
                    batches = batches.len(),
                    "Merging batches",
                );
            },
        }
    }

    /// Executes the command
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Commands::Inspect {
                location,
                keys,
                no_mmap,
            } => {
                let options = LoadOptions::builder().maybe_keys(keys).mmap(!no_mmap).build();
                tokio::task::spawn_blocking(move || inspect(&location, options))
                    .await
                    .context("Join inspect task")??;
            },
            Commands::Compress {
                location,
                level,
                keep_original,
                combined,
            } => {
                let options = CompressOptions::builder()
                    .level(level)
                    .keep_original(keep_original)
                    .combined(combined)
                    .build();
                let archives = compress(location, options).await?;
                info!(archives = archives.len(), "Compression complete");
            },
            Commands::Decompress {
                location,
                keep_original,
            } => {
                let options = DecompressOptions::builder().keep_original(keep_original).build();
                let dirs = decompress(location, options).await?;
                info!(directories = dirs.len(), "Decompression complete");
            },
            Commands::Concat {
                category,
                keys,
                allow_repeats,
                outdir,
                batches,
            } => {
                let mode = if allow_repeats {
                    CategoryMode::AllowRepeats
                } else {
                    CategoryMode::Unique
                };
                let options = ConcatOptions::builder()
                    .category_name(category)
                    .maybe_keys(keys)
                    .mode(mode)
                    .build();
                let report = tokio::task::spawn_blocking(move || {
                    cask_fs::concatenate_and_index(&batches, &outdir, options)
                })
                .await
                .context("Join merge task")?
                .context("Merge batches")?;
                info!(
                    rows = report.rows,
                    written = ?report.written,
                    skipped = ?report.skipped,
                    "Merge complete",
                );
            },
        }

        Ok(())
    }
}

fn inspect(location: &Path, options: LoadOptions) -> anyhow::Result<()> {
    let loaded = cask_fs::load(location, options)
        .with_context(|| format!("Load store {}", location.display()))?;

    for key in &loaded.missing_keys {
        warn!(column = %key, "Column not found");
    }

    let set = &loaded.set;
    println!(
        "{} column(s), {} event(s)",
        set.len(),
        set.rows().unwrap_or(0),
    );
    if let Some(index) = set.category_index() {
        println!(
            "category index {:?}: {} categories",
            index.name(),
            index.len(),
        );
        for entry in index.entries() {
            println!("  {} [{}, {})", entry.key, entry.start, entry.stop);
        }
    }
    for column in set.columns() {
        println!("{}", describe_column(column));
    }

    Ok(())
}

fn describe_column(column: &Column) -> String {
    let mut description = format!(
        "{} ({}, {:?}) {}: {} events, {} records",
        column.name(),
        column.kind(),
        column.access_mode(),
        column.layout(),
        column.rows(),
        column.data().len(),
    );
    if column.valid().is_some() {
        description.push_str(&format!(", {} invalid", column.invalid_count()));
    }
    description
}

/// Compresses each uncompressed column of a store directory in parallel.
///
/// Combined archives and single columns are written by one task.
async fn compress(location: PathBuf, options: CompressOptions) -> anyhow::Result<Vec<PathBuf>> {
    let is_store_dir = location.is_dir() && !cask_fs::is_column_dir(&location);
    let jobs = if options.combined || !is_store_dir {
        vec![location]
    } else {
        column_jobs(&location, |path| path.is_dir())?
    };

    let mut tasks = JoinSet::new();
    for job in jobs {
        let options = options.clone();
        tasks.spawn_blocking(move || {
            cask_fs::compress(&job, options).with_context(|| format!("Compress {}", job.display()))
        });
    }

    let mut archives = Vec::new();
    while let Some(result) = tasks.join_next().await {
        archives.extend(result.context("Join compression task")??);
    }
    Ok(archives)
}

/// Expands each column archive of a store directory in parallel.
async fn decompress(location: PathBuf, options: DecompressOptions) -> anyhow::Result<Vec<PathBuf>> {
    let jobs = if location.is_dir() {
        column_jobs(&location, |path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == ARCHIVE_EXT)
        })?
    } else {
        vec![location]
    };

    let mut tasks = JoinSet::new();
    for job in jobs {
        let options = options.clone();
        tasks.spawn_blocking(move || {
            cask_fs::decompress(&job, options).with_context(|| format!("Decompress {}", job.display()))
        });
    }

    let mut dirs = Vec::new();
    while let Some(result) = tasks.join_next().await {
        dirs.extend(result.context("Join decompression task")??);
    }
    Ok(dirs)
}

/// The visible entries of a store directory accepted by `filter`.
fn column_jobs(dir: &Path, filter: impl Fn(&Path) -> bool) -> anyhow::Result<Vec<PathBuf>> {
    let mut jobs = Vec::new();
    for entry in dir.read_dir().context("Read store directory")? {
        let path = entry?.path();
        let is_hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if !is_hidden && filter(&path) {
            jobs.push(path);
        }
    }
    jobs.sort();
    Ok(jobs)
}

fn parse_batch(value: &str) -> anyhow::Result<(CategoryKey, PathBuf)> {
    let Some((key, path)) = value.split_once('=') else {
        bail!("expected KEY=PATH, got {value:?}");
    };
    if key.is_empty() || path.is_empty() {
        bail!("expected KEY=PATH, got {value:?}");
    }

    let key = match key.parse::<i64>() {
        Ok(key) => CategoryKey::Int(key),
        Err(_) => CategoryKey::Text(key.to_string()),
    };
    Ok((key, PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch() {
        let (key, path) = parse_batch("120034=/data/run_120034").unwrap();
        assert_eq!(key, CategoryKey::Int(120034));
        assert_eq!(path, PathBuf::from("/data/run_120034"));

        let (key, _) = parse_batch("IC86=batch").unwrap();
        assert_eq!(key, CategoryKey::Text("IC86".to_string()));

        assert!(parse_batch("no-separator").is_err());
        assert!(parse_batch("=path").is_err());
    }

    #[test]
    fn test_column_jobs_skip_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("energy")).unwrap();
        std::fs::create_dir(dir.path().join(".pulses.partial")).unwrap();
        std::fs::write(dir.path().join("run__categ_index.arr"), b"").unwrap();

        let jobs = column_jobs(dir.path(), |path| path.is_dir()).unwrap();
        assert_eq!(jobs, vec![dir.path().join("energy")]);
    }

    #[tokio::test]
    async fn test_compress_single_column_dir() {
        use cask_tarp::{PrimitiveType, TypedArray};

        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let data = TypedArray::from_pod(PrimitiveType::U32.into(), &[7u32, 8]).unwrap();
        let column = Column::from_parts("energy", data, None, None).unwrap();
        let column_dir = cask_fs::save_column(&store, &column).unwrap();

        let archives = compress(column_dir.clone(), CompressOptions::default()).await.unwrap();
        assert_eq!(archives, vec![store.join("energy.arrz")]);
        assert!(!column_dir.exists());

        let loaded = cask_fs::load(&store, LoadOptions::default()).unwrap();
        assert_eq!(loaded.downgraded, vec!["energy".to_string()]);
    }

    #[tokio::test]
    async fn test_parallel_compress_and_decompress() {
        use cask_tarp::{ColumnSet, PrimitiveType, TypedArray};

        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let columns = ["energy", "zenith"]
            .into_iter()
            .map(|name| {
                let data = TypedArray::from_pod(PrimitiveType::U32.into(), &[1u32, 2, 3]).unwrap();
                Column::from_parts(name, data, None, None).unwrap()
            })
            .collect::<Vec<_>>();
        cask_fs::save_set(&store, &ColumnSet::from_parts(columns, None).unwrap()).unwrap();

        let mut archives = compress(store.clone(), CompressOptions::default()).await.unwrap();
        archives.sort();
        assert_eq!(
            archives,
            vec![store.join("energy.arrz"), store.join("zenith.arrz")],
        );

        let dirs = decompress(store.clone(), DecompressOptions::default()).await.unwrap();
        assert_eq!(dirs.len(), 2);

        let loaded = cask_fs::load(&store, LoadOptions::default()).unwrap();
        assert!(loaded.downgraded.is_empty());
        assert_eq!(
            loaded.set.column("zenith").unwrap().data().cast::<u32>().unwrap(),
            &[1, 2, 3],
        );
    }
}
