use bon::Builder;
use cask_tarp::CategoryMode;

/// The default zstd compression level for archives.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Builder)]
/// Options controlling how a store is loaded.
pub struct LoadOptions {
    /// Only load the named columns.
    ///
    /// All columns are loaded when unset.
    pub keys: Option<Vec<String>>,
    #[builder(default = true)]
    /// Memory map individually stored arrays instead of reading them
    /// onto the heap.
    ///
    /// Archived arrays are always read onto the heap.
    pub mmap: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Builder)]
/// Options controlling how a store or column is compressed.
pub struct CompressOptions {
    #[builder(default)]
    /// Keep the uncompressed originals once the archive is written.
    pub keep_original: bool,
    #[builder(default = DEFAULT_COMPRESSION_LEVEL)]
    /// The zstd compression level.
    pub level: i32,
    #[builder(default)]
    /// Write a single archive holding every column and the category index
    /// instead of one archive per column.
    pub combined: bool,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Default, Builder)]
/// Options controlling how archives are expanded.
pub struct DecompressOptions {
    #[builder(default)]
    /// Keep the archive once the expanded directory is written.
    pub keep_original: bool,
}

#[derive(Debug, Clone, Builder)]
/// Options for merging several batches into one store.
pub struct ConcatOptions {
    #[builder(into)]
    /// The category dimension the batches are labelled with, e.g. `run`.
    pub category_name: String,
    /// Only merge the named columns.
    ///
    /// Every column found in any batch is merged when unset.
    pub keys: Option<Vec<String>>,
    #[builder(default)]
    /// Whether the same category key may label more than one batch.
    pub mode: CategoryMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_defaults() {
        let load = LoadOptions::default();
        assert!(load.mmap);
        assert!(load.keys.is_none());

        let compress = CompressOptions::default();
        assert!(!compress.keep_original);
        assert!(!compress.combined);
        assert_eq!(compress.level, DEFAULT_COMPRESSION_LEVEL);

        let concat = ConcatOptions::builder().category_name("run").build();
        assert_eq!(concat.mode, CategoryMode::Unique);
    }
}
